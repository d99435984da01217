//! Mode-aware poll scheduler.
//!
//! Supervises one [`BotPoller`] per polling-mode bot. The liveness registry
//! maps bot IDs to handles carrying the cancellation token, the join handle,
//! and a generation counter so stale handles from exited loops are replaced
//! rather than trusted. The scheduler never starts a loop for a bot whose
//! committed mode is not `polling`.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::DispatchError;
use super::health::HealthRecorder;
use super::poller::BotPoller;
use super::registry::{DeliveryRegistry, ModeTransition, ResumeMode};
use super::router::UpdateRouter;
use crate::config::FleetConfig;
use crate::models::{BotIdentity, DeliveryMode};
use crate::telegram::BotApiFactory;

/// Poll-loop lifecycle seam the registry drives during mode transitions.
#[async_trait]
pub trait PollControl: Send + Sync {
    async fn ensure_running(&self, bot: &BotIdentity);
    async fn ensure_stopped(&self, bot_id: &str);
}

/// A supervised poll loop.
struct PollerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    generation: u64,
}

pub struct PollScheduler {
    registry: Arc<DeliveryRegistry>,
    router: Arc<UpdateRouter>,
    api_factory: Arc<dyn BotApiFactory>,
    health: HealthRecorder,
    config: Arc<FleetConfig>,
    pollers: DashMap<String, PollerHandle>,
    generation: AtomicU64,
}

impl PollScheduler {
    pub fn new(
        registry: Arc<DeliveryRegistry>,
        router: Arc<UpdateRouter>,
        api_factory: Arc<dyn BotApiFactory>,
        health: HealthRecorder,
        config: Arc<FleetConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            router,
            api_factory,
            health,
            config,
            pollers: DashMap::new(),
            generation: AtomicU64::new(0),
        })
    }

    pub fn is_running(&self, bot_id: &str) -> bool {
        self.pollers
            .get(bot_id)
            .map(|handle| !handle.join.is_finished())
            .unwrap_or(false)
    }

    /// Bot IDs with a live poll loop, sorted.
    pub fn running_bots(&self) -> Vec<String> {
        let mut bots: Vec<String> = self
            .pollers
            .iter()
            .filter(|entry| !entry.value().join.is_finished())
            .map(|entry| entry.key().clone())
            .collect();
        bots.sort();
        bots
    }

    /// Converge live pollers onto the store: start loops for active polling
    /// bots, stop loops for bots no longer polling. Returns
    /// (started, stopped).
    pub async fn reconcile(&self) -> (usize, usize) {
        let pollable = self.registry.pollable_bots();
        let desired: HashSet<&str> = pollable.iter().map(|bot| bot.bot_id.as_str()).collect();

        let mut started = 0;
        for bot in &pollable {
            if !self.is_running(&bot.bot_id) {
                started += 1;
            }
            self.ensure_running(bot).await;
        }

        let running: Vec<String> = self.pollers.iter().map(|entry| entry.key().clone()).collect();
        let mut stopped = 0;
        for bot_id in running {
            if !desired.contains(bot_id.as_str()) {
                self.ensure_stopped(&bot_id).await;
                stopped += 1;
            }
        }

        info!(started, stopped, "poll scheduler reconciled");
        (started, stopped)
    }

    /// Cancel every poller, then await each under the shutdown grace.
    pub async fn shutdown(&self) {
        for entry in self.pollers.iter() {
            entry.value().cancel.cancel();
        }

        let bot_ids: Vec<String> = self.pollers.iter().map(|entry| entry.key().clone()).collect();
        for bot_id in bot_ids {
            if let Some((_, handle)) = self.pollers.remove(&bot_id) {
                self.stop_handle(&bot_id, handle).await;
            }
        }
        info!("poll scheduler stopped");
    }

    /// Health-breach reaction: move the bot off webhooks and back onto its
    /// poll loop. The registry calls back into `ensure_running` once the
    /// provider side is torn down.
    pub async fn fallback_to_polling(
        &self,
        bot_id: &str,
        reason: &str,
    ) -> Result<ModeTransition, DispatchError> {
        warn!(bot_id = %bot_id, reason = %reason, "falling back to polling");
        let result = self
            .registry
            .disable_webhook(bot_id, ResumeMode::Polling)
            .await;
        match &result {
            Ok(transition) => {
                info!(bot_id = %bot_id, changed = transition.changed(), "fallback transition finished");
            }
            Err(err) => {
                error!(bot_id = %bot_id, error = %err, "fallback transition failed");
            }
        }
        result
    }

    fn spawn_poller(&self, bot: &BotIdentity) -> PollerHandle {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let poller = BotPoller::new(
            bot.clone(),
            self.api_factory.api_for(bot),
            self.router.clone(),
            self.health.clone(),
            self.config.polling.clone(),
            cancel.clone(),
        );
        let join = tokio::spawn(poller.run());
        info!(bot_id = %bot.bot_id, generation, "poller spawned");
        PollerHandle {
            cancel,
            join,
            generation,
        }
    }

    async fn stop_handle(&self, bot_id: &str, handle: PollerHandle) {
        let generation = handle.generation;
        handle.cancel.cancel();

        let grace = Duration::from_secs(self.config.polling.shutdown_grace_secs);
        let abort = handle.join.abort_handle();
        match timeout(grace, handle.join).await {
            Ok(Ok(())) => {
                debug!(bot_id = %bot_id, generation, "poller stopped");
            }
            Ok(Err(err)) => {
                warn!(bot_id = %bot_id, generation, error = %err, "poller task failed");
            }
            Err(_) => {
                warn!(
                    bot_id = %bot_id,
                    generation,
                    grace_secs = self.config.polling.shutdown_grace_secs,
                    "poller exceeded shutdown grace, aborting"
                );
                abort.abort();
            }
        }
    }
}

#[async_trait]
impl PollControl for PollScheduler {
    async fn ensure_running(&self, bot: &BotIdentity) {
        match self.registry.committed_mode(&bot.bot_id) {
            Ok(DeliveryMode::Polling) => {}
            Ok(mode) => {
                warn!(bot_id = %bot.bot_id, %mode, "refusing poll loop, bot is not in polling mode");
                return;
            }
            Err(err) => {
                warn!(bot_id = %bot.bot_id, error = %err, "refusing poll loop for unknown bot");
                return;
            }
        }

        match self.pollers.entry(bot.bot_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().join.is_finished() {
                    return;
                }
                let stale = occupied.insert(self.spawn_poller(bot));
                debug!(
                    bot_id = %bot.bot_id,
                    stale_generation = stale.generation,
                    "replaced exited poller handle"
                );
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.spawn_poller(bot));
            }
        }
    }

    async fn ensure_stopped(&self, bot_id: &str) {
        let Some((_, handle)) = self.pollers.remove(bot_id) else {
            return;
        };
        self.stop_handle(bot_id, handle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::worker::mock::MockUpdateExecutor;
    use crate::models::BotToken;
    use crate::telegram::mock::MockApiFactory;
    use botfleet_storage::Storage;
    use std::time::Instant;
    use tempfile::tempdir;

    struct Rig {
        _dir: tempfile::TempDir,
        factory: Arc<MockApiFactory>,
        registry: Arc<DeliveryRegistry>,
        scheduler: Arc<PollScheduler>,
    }

    fn rig(attach: bool) -> Rig {
        let dir = tempdir().unwrap();
        let storage =
            Arc::new(Storage::new(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let factory = Arc::new(MockApiFactory::new());

        let mut config = FleetConfig::default();
        config.server.public_base_url = Some("https://bots.example.com".to_string());
        config.polling.poll_timeout_secs = 1;
        config.polling.error_backoff_min_ms = 5;
        config.polling.error_backoff_max_ms = 20;
        config.polling.shutdown_grace_secs = 5;
        let config = Arc::new(config);

        let registry = DeliveryRegistry::new(storage, factory.clone(), config.clone());
        let (health, _events) = HealthRecorder::test_pair();
        let router = UpdateRouter::new(MockUpdateExecutor::new(), health.clone(), &config.dispatch);
        let scheduler = PollScheduler::new(
            registry.clone(),
            router,
            factory.clone(),
            health,
            config,
        );
        if attach {
            registry.attach_poll_control(scheduler.clone());
        }

        Rig {
            _dir: dir,
            factory,
            registry,
            scheduler,
        }
    }

    async fn wait_until(check: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_refuses_poller_for_webhook_bot() {
        let rig = rig(true);
        rig.registry.register("hook-bot", BotToken::new("tok")).unwrap();
        rig.registry.enable_webhook("hook-bot").await.unwrap();

        let bot = rig.registry.get("hook-bot").unwrap();
        rig.scheduler.ensure_running(&bot).await;

        assert!(!rig.scheduler.is_running("hook-bot"));
        assert!(rig.scheduler.running_bots().is_empty());
        assert_eq!(
            rig.factory
                .get("hook-bot")
                .get_updates_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn test_ensure_running_is_idempotent() {
        let rig = rig(true);
        rig.registry.register("poll-bot", BotToken::new("tok")).unwrap();
        rig.registry.enable_polling("poll-bot").await.unwrap();

        let bot = rig.registry.get("poll-bot").unwrap();
        rig.scheduler.ensure_running(&bot).await;
        rig.scheduler.ensure_running(&bot).await;

        assert!(rig.scheduler.is_running("poll-bot"));
        assert_eq!(rig.scheduler.running_bots(), vec!["poll-bot".to_string()]);
        assert_eq!(rig.scheduler.pollers.len(), 1);

        rig.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_enable_webhook_stops_live_poller() {
        let rig = rig(true);
        rig.registry.register("poll-bot", BotToken::new("tok")).unwrap();
        rig.registry.enable_polling("poll-bot").await.unwrap();

        let api = rig.factory.get("poll-bot");
        wait_until(|| api.get_updates_calls.load(std::sync::atomic::Ordering::SeqCst) >= 1).await;
        assert!(rig.scheduler.is_running("poll-bot"));

        let transition = rig.registry.enable_webhook("poll-bot").await.unwrap();
        assert!(transition.changed());
        assert!(!rig.scheduler.is_running("poll-bot"));
        assert!(api.registered_webhook.lock().is_some());

        // The loop is gone: the fetch counter freezes.
        let frozen = api.get_updates_calls.load(std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            api.get_updates_calls.load(std::sync::atomic::Ordering::SeqCst),
            frozen
        );
    }

    #[tokio::test]
    async fn test_reconcile_converges_on_store() {
        let rig = rig(false);
        rig.registry.register("bot-a", BotToken::new("a")).unwrap();
        rig.registry.register("bot-d", BotToken::new("d")).unwrap();
        rig.registry.enable_polling("bot-a").await.unwrap();
        rig.registry.enable_polling("bot-d").await.unwrap();

        let (started, stopped) = rig.scheduler.reconcile().await;
        assert_eq!((started, stopped), (2, 0));
        assert_eq!(
            rig.scheduler.running_bots(),
            vec!["bot-a".to_string(), "bot-d".to_string()]
        );

        // Mode flips underneath (control not attached, so the loop survives
        // until the next reconcile pass).
        rig.registry.disable_delivery("bot-d").await.unwrap();
        assert!(rig.scheduler.is_running("bot-d"));

        let (started, stopped) = rig.scheduler.reconcile().await;
        assert_eq!((started, stopped), (0, 1));
        assert!(rig.scheduler.is_running("bot-a"));
        assert!(!rig.scheduler.is_running("bot-d"));

        rig.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let rig = rig(true);
        for bot_id in ["bot-a", "bot-b"] {
            rig.registry.register(bot_id, BotToken::new("tok")).unwrap();
            rig.registry.enable_polling(bot_id).await.unwrap();
        }
        assert_eq!(rig.scheduler.running_bots().len(), 2);

        rig.scheduler.shutdown().await;
        assert!(rig.scheduler.running_bots().is_empty());
        assert!(!rig.scheduler.is_running("bot-a"));
        assert!(!rig.scheduler.is_running("bot-b"));
    }

    #[tokio::test]
    async fn test_fallback_resumes_polling() {
        let rig = rig(true);
        rig.registry.register("hook-bot", BotToken::new("tok")).unwrap();
        rig.registry.enable_webhook("hook-bot").await.unwrap();

        let transition = rig
            .scheduler
            .fallback_to_polling("hook-bot", "error rate above threshold")
            .await
            .unwrap();
        assert!(transition.changed());
        assert_eq!(
            rig.registry.committed_mode("hook-bot").unwrap(),
            DeliveryMode::Polling
        );
        assert!(rig.scheduler.is_running("hook-bot"));
        assert_eq!(
            rig.factory
                .get("hook-bot")
                .delete_webhook_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        rig.scheduler.shutdown().await;
    }
}
