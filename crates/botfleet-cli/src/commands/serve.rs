use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::error;

use botfleet_core::FleetCore;
use botfleet_core::dispatch::IngressServer;

pub async fn run(core: Arc<FleetCore>) -> Result<()> {
    core.start().await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    spawn_signal_listener(shutdown_tx);

    println!(
        "botfleet serving on {}:{} (Ctrl+C to stop)",
        core.config.server.host, core.config.server.port
    );

    IngressServer::new(core.clone()).run(shutdown_rx).await?;

    core.shutdown().await;
    println!("botfleet stopped");
    Ok(())
}

fn spawn_signal_listener(shutdown_tx: broadcast::Sender<()>) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    error!("Failed to install SIGTERM handler: {}", err);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                let _ = shutdown_tx.send(());
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = shutdown_tx.send(());
            }
        }
    });

    #[cfg(not(unix))]
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });
}
