pub mod config;
pub mod dispatch;
pub mod models;
pub mod paths;
pub mod telegram;

pub use config::FleetConfig;
pub use models::*;

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::JobScheduler;
use tracing::{info, warn};

use botfleet_storage::{HealthStore, Storage};
use dispatch::handler::{UpdateHandler, default_chain};
use dispatch::health::{HealthAggregator, HealthRecorder};
use dispatch::registry::DeliveryRegistry;
use dispatch::router::UpdateRouter;
use dispatch::scheduler::PollScheduler;
use dispatch::worker::ChainExecutor;
use telegram::BotApiFactory;

/// Core engine state shared between the HTTP server and the CLI.
///
/// Everything hangs off this struct; components receive their
/// dependencies at construction and nothing reaches for globals.
pub struct FleetCore {
    pub config: Arc<FleetConfig>,
    pub storage: Arc<Storage>,
    pub health_store: Arc<HealthStore>,
    pub api_factory: Arc<dyn BotApiFactory>,
    pub aggregator: Arc<HealthAggregator>,
    pub recorder: HealthRecorder,
    pub registry: Arc<DeliveryRegistry>,
    pub router: Arc<UpdateRouter>,
    pub scheduler: Arc<PollScheduler>,
    jobs: Mutex<Option<JobScheduler>>,
    aggregator_task: JoinHandle<()>,
    started_at: Instant,
}

impl FleetCore {
    /// Wire the engine with the default handler chain.
    pub fn new(
        config: FleetConfig,
        storage: Arc<Storage>,
        health_store: Arc<HealthStore>,
        api_factory: Arc<dyn BotApiFactory>,
    ) -> anyhow::Result<Arc<Self>> {
        Self::with_handlers(config, storage, health_store, api_factory, default_chain())
    }

    /// Wire the engine with a custom handler chain.
    pub fn with_handlers(
        config: FleetConfig,
        storage: Arc<Storage>,
        health_store: Arc<HealthStore>,
        api_factory: Arc<dyn BotApiFactory>,
        handlers: Vec<Arc<dyn UpdateHandler>>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);

        let aggregator = HealthAggregator::new(config.health.clone());
        let (recorder, aggregator_task) = aggregator.start();

        let registry = DeliveryRegistry::new(storage.clone(), api_factory.clone(), config.clone());
        let executor = ChainExecutor::new(
            handlers,
            registry.clone(),
            api_factory.clone(),
            storage.clone(),
            recorder.clone(),
        );
        let router = UpdateRouter::new(executor, recorder.clone(), &config.dispatch);
        let scheduler = PollScheduler::new(
            registry.clone(),
            router.clone(),
            api_factory.clone(),
            recorder.clone(),
            config.clone(),
        );
        registry.attach_poll_control(scheduler.clone());

        let loaded = registry.load()?;
        info!(bots = loaded, "delivery registry loaded");

        Ok(Arc::new(Self {
            config,
            storage,
            health_store,
            api_factory,
            aggregator,
            recorder,
            registry,
            router,
            scheduler,
            jobs: Mutex::new(None),
            aggregator_task,
            started_at: Instant::now(),
        }))
    }

    /// Bring delivery up: converge poll loops and start maintenance jobs.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let (started, stopped) = self.scheduler.reconcile().await;
        info!(started, stopped, "poll loops reconciled");

        let scheduler = dispatch::jobs::start_jobs(self).await?;
        *self.jobs.lock().await = Some(scheduler);
        Ok(())
    }

    /// Tear delivery down in reverse order of start.
    pub async fn shutdown(&self) {
        if let Some(mut jobs) = self.jobs.lock().await.take() {
            if let Err(err) = jobs.shutdown().await {
                warn!(error = %err, "maintenance job scheduler did not stop cleanly");
            }
        }
        self.scheduler.shutdown().await;
        self.aggregator_task.abort();
        info!("fleet core stopped");
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}
