//! Delivery mode registry.
//!
//! Authoritative state machine for how each bot receives updates:
//!
//! ```text
//!   disabled <-> polling <-> transitioning <-> webhook
//! ```
//!
//! Transitions are serialized per bot by an async mutex, bounded by the
//! transition timeout, and rolled back to the previous stable mode when the
//! provider round-trip fails. `transitioning` never leaks outside: external
//! readers see the last committed stable mode until a transition lands.

use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

use botfleet_storage::Storage;

use super::error::DispatchError;
use super::scheduler::PollControl;
use crate::config::FleetConfig;
use crate::models::{BotIdentity, BotStatus, BotToken, DeliveryMode, valid_bot_id};
use crate::telegram::BotApiFactory;

/// Outcome of an idempotent transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeTransition {
    /// The mode actually moved; the provider was called.
    Changed,
    /// Already in the requested mode; no provider call was made.
    Unchanged,
}

impl ModeTransition {
    pub fn changed(self) -> bool {
        matches!(self, ModeTransition::Changed)
    }
}

/// What a bot falls back to when its webhook is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    Polling,
    Disabled,
}

impl ResumeMode {
    fn delivery_mode(self) -> DeliveryMode {
        match self {
            ResumeMode::Polling => DeliveryMode::Polling,
            ResumeMode::Disabled => DeliveryMode::Disabled,
        }
    }
}

/// Per-bot delivery state, backed by the bot store.
pub struct DeliveryRegistry {
    storage: Arc<Storage>,
    api_factory: Arc<dyn BotApiFactory>,
    config: Arc<FleetConfig>,
    /// Live bot records; `mode` here includes the internal transitioning state.
    bots: DashMap<String, BotIdentity>,
    /// Webhook path segment -> bot ID.
    path_index: DashMap<String, String>,
    /// Stable mode a transition started from, present only mid-transition.
    stable_before: DashMap<String, DeliveryMode>,
    transition_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    poll_control: OnceLock<Arc<dyn PollControl>>,
}

impl DeliveryRegistry {
    pub fn new(
        storage: Arc<Storage>,
        api_factory: Arc<dyn BotApiFactory>,
        config: Arc<FleetConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            api_factory,
            config,
            bots: DashMap::new(),
            path_index: DashMap::new(),
            stable_before: DashMap::new(),
            transition_locks: DashMap::new(),
            poll_control: OnceLock::new(),
        })
    }

    /// Wire the scheduler half. Called once during engine assembly.
    pub fn attach_poll_control(&self, control: Arc<dyn PollControl>) {
        if self.poll_control.set(control).is_err() {
            warn!("poll control attached twice, keeping the first");
        }
    }

    /// Load all persisted bots into the live map. Run before serving.
    pub fn load(&self) -> anyhow::Result<usize> {
        let rows = self.storage.bots.list_raw()?;
        let mut loaded = 0;
        for (bot_id, data) in rows {
            let mut bot: BotIdentity = match serde_json::from_slice(&data) {
                Ok(bot) => bot,
                Err(err) => {
                    error!(bot_id = %bot_id, error = %err, "skipping unreadable bot record");
                    continue;
                }
            };
            // A crash mid-transition never persists `transitioning`, but
            // tolerate hand-edited rows.
            if !bot.mode.is_stable() {
                warn!(bot_id = %bot.bot_id, "bot record stored mid-transition, resetting to disabled");
                bot.mode = DeliveryMode::Disabled;
            }
            self.path_index
                .insert(bot.path_token.clone(), bot.bot_id.clone());
            self.bots.insert(bot.bot_id.clone(), bot);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Provision a new bot. The mode starts disabled; no provider calls.
    pub fn register(
        &self,
        bot_id: &str,
        token: BotToken,
    ) -> Result<BotIdentity, DispatchError> {
        if !valid_bot_id(bot_id) {
            return Err(DispatchError::Configuration(format!(
                "invalid bot id: {bot_id:?}"
            )));
        }
        if token.is_empty() {
            return Err(DispatchError::Configuration("empty bot token".to_string()));
        }
        if self.bots.contains_key(bot_id) {
            return Err(DispatchError::Configuration(format!(
                "bot {bot_id} already exists"
            )));
        }

        let bot = BotIdentity::provision(bot_id, token);
        self.persist(&bot)?;
        self.path_index
            .insert(bot.path_token.clone(), bot.bot_id.clone());
        self.bots.insert(bot.bot_id.clone(), bot.clone());
        info!(bot_id = %bot.bot_id, "bot registered");
        Ok(bot)
    }

    /// Remove a bot, tearing down live delivery first.
    pub async fn deregister(&self, bot_id: &str) -> Result<(), DispatchError> {
        let _guard = self.acquire_transition_lock(bot_id).await?;
        let bot = self.get(bot_id)?;

        match self.committed_mode_of(&bot) {
            DeliveryMode::Webhook => {
                let api = self.api_factory.api_for(&bot);
                match timeout(self.transition_timeout(), api.delete_webhook()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(bot_id = %bot_id, error = %err, "deleteWebhook failed during deregister");
                    }
                    Err(_) => {
                        warn!(bot_id = %bot_id, "deleteWebhook timed out during deregister");
                    }
                }
            }
            DeliveryMode::Polling => {
                self.poll_stopped(bot_id).await;
            }
            _ => {}
        }

        self.storage
            .bots
            .delete(bot_id)
            .map_err(DispatchError::Storage)?;
        self.storage
            .slots
            .delete_prefix(&format!("{bot_id}:"))
            .map_err(DispatchError::Storage)?;
        self.path_index.remove(&bot.path_token);
        self.bots.remove(bot_id);
        self.transition_locks.remove(bot_id);
        info!(bot_id = %bot_id, "bot deregistered");
        Ok(())
    }

    /// Switch a bot to webhook delivery. Idempotent; serialized per bot.
    pub async fn enable_webhook(&self, bot_id: &str) -> Result<ModeTransition, DispatchError> {
        let _guard = self.acquire_transition_lock(bot_id).await?;
        let bot = self.get(bot_id)?;

        if bot.mode == DeliveryMode::Webhook {
            return Ok(ModeTransition::Unchanged);
        }

        let url = self
            .config
            .webhook_url(&bot.path_token)
            .ok_or_else(|| {
                DispatchError::Configuration(
                    "server.public_base_url must be set before enabling webhooks".to_string(),
                )
            })?;

        let previous = bot.mode;
        self.begin_transition(bot_id, previous);

        // The poll loop must be fully gone before the provider starts
        // pushing; a live loop after setWebhook would double-deliver.
        self.poll_stopped(bot_id).await;

        let api = self.api_factory.api_for(&bot);
        let result = timeout(
            self.transition_timeout(),
            api.set_webhook(&url, &bot.webhook_secret),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                self.commit(bot_id, DeliveryMode::Webhook).await?;
                info!(bot_id = %bot_id, from = %previous, "webhook enabled");
                Ok(ModeTransition::Changed)
            }
            Ok(Err(err)) => {
                self.rollback(bot_id, previous).await;
                warn!(bot_id = %bot_id, error = %err, "setWebhook failed, rolled back");
                Err(DispatchError::UpstreamProvider(err.to_string()))
            }
            Err(_) => {
                self.rollback(bot_id, previous).await;
                warn!(bot_id = %bot_id, "setWebhook timed out, rolled back");
                Err(DispatchError::TransitionTimeout {
                    timeout_secs: self.config.dispatch.transition_timeout_secs,
                })
            }
        }
    }

    /// Leave webhook delivery, resuming as polling or disabled. Idempotent:
    /// a bot not in webhook mode returns Unchanged without a provider call.
    pub async fn disable_webhook(
        &self,
        bot_id: &str,
        resume: ResumeMode,
    ) -> Result<ModeTransition, DispatchError> {
        let _guard = self.acquire_transition_lock(bot_id).await?;
        let bot = self.get(bot_id)?;

        if bot.mode != DeliveryMode::Webhook {
            return Ok(ModeTransition::Unchanged);
        }

        let previous = bot.mode;
        self.begin_transition(bot_id, previous);

        let api = self.api_factory.api_for(&bot);
        let result = timeout(self.transition_timeout(), api.delete_webhook()).await;

        match result {
            Ok(Ok(())) => {
                let target = resume.delivery_mode();
                self.commit(bot_id, target).await?;
                if target == DeliveryMode::Polling {
                    let bot = self.get(bot_id)?;
                    self.poll_running(&bot).await;
                }
                info!(bot_id = %bot_id, to = %target, "webhook disabled");
                Ok(ModeTransition::Changed)
            }
            Ok(Err(err)) => {
                self.rollback(bot_id, previous).await;
                warn!(bot_id = %bot_id, error = %err, "deleteWebhook failed, rolled back");
                Err(DispatchError::UpstreamProvider(err.to_string()))
            }
            Err(_) => {
                self.rollback(bot_id, previous).await;
                warn!(bot_id = %bot_id, "deleteWebhook timed out, rolled back");
                Err(DispatchError::TransitionTimeout {
                    timeout_secs: self.config.dispatch.transition_timeout_secs,
                })
            }
        }
    }

    /// Move a disabled bot straight to polling. No provider round-trip.
    pub async fn enable_polling(&self, bot_id: &str) -> Result<ModeTransition, DispatchError> {
        let _guard = self.acquire_transition_lock(bot_id).await?;
        let bot = self.get(bot_id)?;

        match bot.mode {
            DeliveryMode::Polling => Ok(ModeTransition::Unchanged),
            DeliveryMode::Webhook => Err(DispatchError::ModeMismatch {
                bot_id: bot_id.to_string(),
                mode: bot.mode,
            }),
            _ => {
                self.commit(bot_id, DeliveryMode::Polling).await?;
                let bot = self.get(bot_id)?;
                self.poll_running(&bot).await;
                info!(bot_id = %bot_id, "polling enabled");
                Ok(ModeTransition::Changed)
            }
        }
    }

    /// Stop all delivery for a bot without removing it.
    pub async fn disable_delivery(&self, bot_id: &str) -> Result<ModeTransition, DispatchError> {
        let guard = self.acquire_transition_lock(bot_id).await?;
        let bot = self.get(bot_id)?;
        match self.committed_mode_of(&bot) {
            DeliveryMode::Disabled => Ok(ModeTransition::Unchanged),
            DeliveryMode::Webhook => {
                // disable_webhook takes the same per-bot lock.
                drop(guard);
                self.disable_webhook(bot_id, ResumeMode::Disabled).await
            }
            _ => {
                self.poll_stopped(bot_id).await;
                self.commit(bot_id, DeliveryMode::Disabled).await?;
                info!(bot_id = %bot_id, "delivery disabled");
                Ok(ModeTransition::Changed)
            }
        }
    }

    pub fn set_status(&self, bot_id: &str, status: BotStatus) -> Result<(), DispatchError> {
        let mut bot = self.get(bot_id)?;
        bot.status = status;
        bot.touch();
        self.persist(&bot)?;
        self.bots.insert(bot.bot_id.clone(), bot);
        Ok(())
    }

    /// Live record by bot ID.
    pub fn get(&self, bot_id: &str) -> Result<BotIdentity, DispatchError> {
        self.bots
            .get(bot_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| DispatchError::UnknownBot(bot_id.to_string()))
    }

    /// Resolve the webhook path segment to a bot.
    pub fn resolve_path_token(&self, path_token: &str) -> Option<BotIdentity> {
        let bot_id = self.path_index.get(path_token)?.clone();
        self.bots.get(&bot_id).map(|entry| entry.clone())
    }

    /// All bots, ordered by ID for stable listings.
    pub fn list(&self) -> Vec<BotIdentity> {
        let mut bots: Vec<BotIdentity> =
            self.bots.iter().map(|entry| entry.value().clone()).collect();
        bots.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        bots
    }

    /// Bots whose committed mode is polling and whose status allows it.
    pub fn pollable_bots(&self) -> Vec<BotIdentity> {
        self.list()
            .into_iter()
            .filter(|bot| {
                bot.status == BotStatus::Active
                    && self.committed_mode_of(bot) == DeliveryMode::Polling
            })
            .collect()
    }

    /// The last committed stable mode; mid-transition callers see the mode
    /// the transition started from.
    pub fn committed_mode(&self, bot_id: &str) -> Result<DeliveryMode, DispatchError> {
        let bot = self.get(bot_id)?;
        Ok(self.committed_mode_of(&bot))
    }

    fn committed_mode_of(&self, bot: &BotIdentity) -> DeliveryMode {
        if bot.mode.is_stable() {
            bot.mode
        } else {
            self.stable_before
                .get(&bot.bot_id)
                .map(|entry| *entry)
                .unwrap_or(DeliveryMode::Disabled)
        }
    }

    fn transition_timeout(&self) -> Duration {
        Duration::from_secs(self.config.dispatch.transition_timeout_secs)
    }

    async fn acquire_transition_lock(
        &self,
        bot_id: &str,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, DispatchError> {
        let lock = self
            .transition_locks
            .entry(bot_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        timeout(self.transition_timeout(), lock.lock_owned())
            .await
            .map_err(|_| DispatchError::DuplicateTransition {
                bot_id: bot_id.to_string(),
            })
    }

    fn begin_transition(&self, bot_id: &str, previous: DeliveryMode) {
        self.stable_before.insert(bot_id.to_string(), previous);
        if let Some(mut entry) = self.bots.get_mut(bot_id) {
            entry.mode = DeliveryMode::Transitioning;
        }
    }

    async fn commit(&self, bot_id: &str, mode: DeliveryMode) -> Result<(), DispatchError> {
        let mut bot = self.get(bot_id)?;
        bot.mode = mode;
        bot.touch();

        if let Err(err) = self.persist(&bot) {
            // The provider side already moved; put it back before surfacing.
            error!(bot_id = %bot_id, error = %err, "mode commit failed to persist");
            if mode == DeliveryMode::Webhook {
                let api = self.api_factory.api_for(&bot);
                if let Err(undo) = api.delete_webhook().await {
                    error!(bot_id = %bot_id, error = %undo, "webhook undo after failed commit also failed");
                }
            }
            if let Some((_, previous)) = self.stable_before.remove(bot_id) {
                if let Some(mut entry) = self.bots.get_mut(bot_id) {
                    entry.mode = previous;
                }
            }
            return Err(err);
        }

        self.bots.insert(bot.bot_id.clone(), bot);
        self.stable_before.remove(bot_id);
        Ok(())
    }

    async fn rollback(&self, bot_id: &str, previous: DeliveryMode) {
        if let Some(mut entry) = self.bots.get_mut(bot_id) {
            entry.mode = previous;
        }
        self.stable_before.remove(bot_id);

        // A transition out of polling stopped the loop; restore it.
        if previous == DeliveryMode::Polling {
            if let Ok(bot) = self.get(bot_id) {
                self.poll_running(&bot).await;
            }
        }
    }

    fn persist(&self, bot: &BotIdentity) -> Result<(), DispatchError> {
        let data = serde_json::to_vec(bot)
            .map_err(|err| DispatchError::Storage(anyhow::Error::new(err)))?;
        self.storage
            .bots
            .put_raw(&bot.bot_id, &data)
            .map_err(DispatchError::Storage)
    }

    async fn poll_stopped(&self, bot_id: &str) {
        if let Some(control) = self.poll_control.get() {
            control.ensure_stopped(bot_id).await;
        }
    }

    async fn poll_running(&self, bot: &BotIdentity) {
        if let Some(control) = self.poll_control.get() {
            control.ensure_running(bot).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::mock::{MockApiFactory, MockBotApi};
    use crate::telegram::types::{TelegramMessageResponse, TelegramUpdate, TelegramUser, WebhookInfo};
    use crate::telegram::BotApi;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        storage: Arc<Storage>,
        factory: Arc<MockApiFactory>,
        registry: Arc<DeliveryRegistry>,
    }

    fn harness() -> Harness {
        harness_with(|config| {
            config.server.public_base_url = Some("https://bots.example.com".to_string());
        })
    }

    fn harness_with(tweak: impl FnOnce(&mut FleetConfig)) -> Harness {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Arc::new(Storage::new(db_path.to_str().unwrap()).unwrap());
        let factory = Arc::new(MockApiFactory::new());
        let mut config = FleetConfig::default();
        tweak(&mut config);
        let registry =
            DeliveryRegistry::new(storage.clone(), factory.clone(), Arc::new(config));
        Harness {
            _dir: dir,
            storage,
            factory,
            registry,
        }
    }

    fn stored_mode(storage: &Storage, bot_id: &str) -> DeliveryMode {
        let data = storage.bots.get_raw(bot_id).unwrap().unwrap();
        let bot: BotIdentity = serde_json::from_slice(&data).unwrap();
        bot.mode
    }

    #[tokio::test]
    async fn test_enable_webhook_registers_once_and_persists() {
        let h = harness();
        let bot = h.registry.register("support-bot", BotToken::new("tok")).unwrap();
        let api = h.factory.get("support-bot");

        let first = h.registry.enable_webhook("support-bot").await.unwrap();
        assert_eq!(first, ModeTransition::Changed);

        let (url, secret) = api.registered_webhook.lock().clone().unwrap();
        assert_eq!(
            url,
            format!("https://bots.example.com/webhook/{}", bot.path_token)
        );
        assert_eq!(secret, bot.webhook_secret);
        assert_eq!(stored_mode(&h.storage, "support-bot"), DeliveryMode::Webhook);

        // Second enable is an idempotent no-op: no extra provider call.
        let second = h.registry.enable_webhook("support-bot").await.unwrap();
        assert_eq!(second, ModeTransition::Unchanged);
        assert_eq!(api.set_webhook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disable_webhook_is_idempotent() {
        let h = harness();
        h.registry.register("support-bot", BotToken::new("tok")).unwrap();
        let api = h.factory.get("support-bot");

        h.registry.enable_webhook("support-bot").await.unwrap();

        let first = h
            .registry
            .disable_webhook("support-bot", ResumeMode::Disabled)
            .await
            .unwrap();
        assert_eq!(first, ModeTransition::Changed);
        assert_eq!(api.delete_webhook_calls.load(Ordering::SeqCst), 1);

        let second = h
            .registry
            .disable_webhook("support-bot", ResumeMode::Disabled)
            .await
            .unwrap();
        assert_eq!(second, ModeTransition::Unchanged);
        assert_eq!(api.delete_webhook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(stored_mode(&h.storage, "support-bot"), DeliveryMode::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_timeout_rolls_back() {
        let h = harness();
        h.registry.register("support-bot", BotToken::new("tok")).unwrap();
        h.registry.enable_polling("support-bot").await.unwrap();

        let api = h.factory.get("support-bot");
        api.webhook_call_delay_ms.store(60_000, Ordering::SeqCst);

        let err = h.registry.enable_webhook("support-bot").await.unwrap_err();
        assert!(matches!(err, DispatchError::TransitionTimeout { .. }));
        assert_eq!(
            h.registry.committed_mode("support-bot").unwrap(),
            DeliveryMode::Polling
        );
        assert_eq!(stored_mode(&h.storage, "support-bot"), DeliveryMode::Polling);
    }

    #[tokio::test]
    async fn test_provider_error_rolls_back() {
        let h = harness();
        h.registry.register("support-bot", BotToken::new("tok")).unwrap();
        let api = h.factory.get("support-bot");
        api.fail_set_webhook.store(true, Ordering::SeqCst);

        let err = h.registry.enable_webhook("support-bot").await.unwrap_err();
        assert!(matches!(err, DispatchError::UpstreamProvider(_)));
        assert_eq!(
            h.registry.committed_mode("support-bot").unwrap(),
            DeliveryMode::Disabled
        );
    }

    #[tokio::test]
    async fn test_concurrent_enables_collapse_to_one_registration() {
        let h = harness();
        h.registry.register("support-bot", BotToken::new("tok")).unwrap();
        let api = h.factory.get("support-bot");

        let r1 = h.registry.clone();
        let r2 = h.registry.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.enable_webhook("support-bot").await }),
            tokio::spawn(async move { r2.enable_webhook("support-bot").await }),
        );
        let a = a.unwrap().unwrap();
        let b = b.unwrap().unwrap();

        assert_eq!(api.set_webhook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            [a, b].iter().filter(|r| r.changed()).count(),
            1,
            "exactly one caller performs the registration"
        );
        assert_eq!(
            h.registry.committed_mode("support-bot").unwrap(),
            DeliveryMode::Webhook
        );
    }

    #[tokio::test]
    async fn test_enable_requires_public_base_url() {
        let h = harness_with(|_| {});
        h.registry.register("support-bot", BotToken::new("tok")).unwrap();

        let err = h.registry.enable_webhook("support-bot").await.unwrap_err();
        assert!(matches!(err, DispatchError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unknown_bot() {
        let h = harness();
        let err = h.registry.enable_webhook("ghost").await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownBot(_)));
    }

    #[test]
    fn test_register_validates_and_indexes() {
        let h = harness();
        assert!(matches!(
            h.registry.register("bad id", BotToken::new("tok")),
            Err(DispatchError::Configuration(_))
        ));
        assert!(matches!(
            h.registry.register("support-bot", BotToken::new("")),
            Err(DispatchError::Configuration(_))
        ));

        let bot = h.registry.register("support-bot", BotToken::new("tok")).unwrap();
        assert!(matches!(
            h.registry.register("support-bot", BotToken::new("tok2")),
            Err(DispatchError::Configuration(_))
        ));

        let resolved = h.registry.resolve_path_token(&bot.path_token).unwrap();
        assert_eq!(resolved.bot_id, "support-bot");
        assert!(h.registry.resolve_path_token("not-a-token").is_none());
    }

    #[tokio::test]
    async fn test_deregister_tears_down_webhook_and_slots() {
        let h = harness();
        let bot = h.registry.register("support-bot", BotToken::new("tok")).unwrap();
        let api = h.factory.get("support-bot");
        h.registry.enable_webhook("support-bot").await.unwrap();

        h.storage.slots.put_raw("support-bot:42", b"{}").unwrap();
        h.storage.slots.put_raw("other-bot:42", b"{}").unwrap();

        h.registry.deregister("support-bot").await.unwrap();

        assert_eq!(api.delete_webhook_calls.load(Ordering::SeqCst), 1);
        assert!(h.storage.bots.get_raw("support-bot").unwrap().is_none());
        assert!(h.storage.slots.get_raw("support-bot:42").unwrap().is_none());
        assert!(h.storage.slots.get_raw("other-bot:42").unwrap().is_some());
        assert!(h.registry.resolve_path_token(&bot.path_token).is_none());
        assert!(matches!(
            h.registry.get("support-bot"),
            Err(DispatchError::UnknownBot(_))
        ));
    }

    #[tokio::test]
    async fn test_load_restores_bots_from_storage() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let path_token;
        {
            let storage = Arc::new(Storage::new(db_path.to_str().unwrap()).unwrap());
            let factory = Arc::new(MockApiFactory::new());
            let registry =
                DeliveryRegistry::new(storage, factory, Arc::new(FleetConfig::default()));
            path_token = registry
                .register("support-bot", BotToken::new("tok"))
                .unwrap()
                .path_token;
        }

        let storage = Arc::new(Storage::new(db_path.to_str().unwrap()).unwrap());
        let factory = Arc::new(MockApiFactory::new());
        let registry = DeliveryRegistry::new(storage, factory, Arc::new(FleetConfig::default()));
        assert_eq!(registry.load().unwrap(), 1);
        assert_eq!(
            registry.resolve_path_token(&path_token).unwrap().bot_id,
            "support-bot"
        );
    }

    /// Order guard: the poll loop must be stopped before the provider is
    /// asked to push.
    #[tokio::test]
    async fn test_loop_stops_before_webhook_registration() {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        struct LoggingApi {
            inner: MockBotApi,
            log: Arc<Mutex<Vec<&'static str>>>,
        }

        #[async_trait]
        impl BotApi for LoggingApi {
            async fn get_me(&self) -> anyhow::Result<TelegramUser> {
                self.inner.get_me().await
            }
            async fn get_updates(
                &self,
                offset: i64,
                timeout_secs: u32,
                limit: u32,
            ) -> anyhow::Result<Vec<TelegramUpdate>> {
                self.inner.get_updates(offset, timeout_secs, limit).await
            }
            async fn set_webhook(&self, url: &str, secret: &str) -> anyhow::Result<()> {
                self.log.lock().push("set_webhook");
                self.inner.set_webhook(url, secret).await
            }
            async fn delete_webhook(&self) -> anyhow::Result<()> {
                self.inner.delete_webhook().await
            }
            async fn webhook_info(&self) -> anyhow::Result<WebhookInfo> {
                self.inner.webhook_info().await
            }
            async fn send_message(
                &self,
                chat_id: i64,
                text: &str,
            ) -> anyhow::Result<TelegramMessageResponse> {
                self.inner.send_message(chat_id, text).await
            }
        }

        struct LoggingControl {
            log: Arc<Mutex<Vec<&'static str>>>,
        }

        #[async_trait]
        impl PollControl for LoggingControl {
            async fn ensure_running(&self, _bot: &BotIdentity) {
                self.log.lock().push("ensure_running");
            }
            async fn ensure_stopped(&self, _bot_id: &str) {
                self.log.lock().push("ensure_stopped");
            }
        }

        struct SingleApiFactory {
            api: Arc<LoggingApi>,
        }

        impl BotApiFactory for SingleApiFactory {
            fn api_for(&self, _bot: &BotIdentity) -> Arc<dyn BotApi> {
                self.api.clone()
            }
        }

        let dir = tempdir().unwrap();
        let storage =
            Arc::new(Storage::new(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let mut config = FleetConfig::default();
        config.server.public_base_url = Some("https://bots.example.com".to_string());
        let api = Arc::new(LoggingApi {
            inner: MockBotApi::new(),
            log: log.clone(),
        });
        let registry = DeliveryRegistry::new(
            storage,
            Arc::new(SingleApiFactory { api }),
            Arc::new(config),
        );
        registry.attach_poll_control(Arc::new(LoggingControl { log: log.clone() }));

        registry.register("support-bot", BotToken::new("tok")).unwrap();
        registry.enable_polling("support-bot").await.unwrap();
        registry.enable_webhook("support-bot").await.unwrap();

        let calls = log.lock().clone();
        let stop_pos = calls
            .iter()
            .position(|&c| c == "ensure_stopped")
            .expect("loop stop requested");
        let hook_pos = calls
            .iter()
            .position(|&c| c == "set_webhook")
            .expect("webhook registered");
        assert!(stop_pos < hook_pos, "loop stopped before setWebhook: {calls:?}");
    }
}
