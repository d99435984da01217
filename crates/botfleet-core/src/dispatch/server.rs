//! HTTP server lifecycle around the ingress router.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::ingress;
use crate::FleetCore;

/// Serves the webhook and management API until shutdown is signalled.
pub struct IngressServer {
    core: Arc<FleetCore>,
}

impl IngressServer {
    pub fn new(core: Arc<FleetCore>) -> Self {
        Self { core }
    }

    /// Bind and serve; returns once the shutdown channel fires and
    /// in-flight requests have drained.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let app = ingress::app(self.core.clone());
        let addr = format!(
            "{}:{}",
            self.core.config.server.host, self.core.config.server.port
        );

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("ingress listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("ingress shutting down");
            })
            .await?;

        Ok(())
    }
}
