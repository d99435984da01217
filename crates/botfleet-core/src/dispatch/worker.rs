//! Update execution seam.
//!
//! Slot pumps hand one update at a time to an [`UpdateExecutor`] and act on
//! its acknowledgment: `Done` moves on, `Retry` is re-attempted with backoff,
//! `Fatal` is recorded and dropped. The in-process [`ChainExecutor`] runs the
//! handler chain; other executors (e.g. a remote worker pool) can be swapped
//! in at construction.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use botfleet_storage::Storage;

use super::handler::{HandlerContext, HandlerVerdict, UpdateHandler};
use super::health::{DeliveryEvent, HealthRecorder};
use super::registry::DeliveryRegistry;
use crate::models::{InboundUpdate, now_ms};
use crate::telegram::BotApiFactory;

/// Executor acknowledgment for one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecAck {
    /// Fully processed; the slot may advance.
    Done,
    /// Transient failure; the pump retries with backoff.
    Retry(String),
    /// Unrecoverable for this update; record and advance.
    Fatal(String),
}

/// Where slot pumps submit updates.
#[async_trait]
pub trait UpdateExecutor: Send + Sync {
    async fn execute(&self, update: &InboundUpdate) -> ExecAck;
}

/// Runs the handler chain in-process.
///
/// Handler errors and panics are contained here: the slot pump only ever
/// sees an acknowledgment, never an escaped failure.
pub struct ChainExecutor {
    handlers: Vec<Arc<dyn UpdateHandler>>,
    registry: Arc<DeliveryRegistry>,
    api_factory: Arc<dyn BotApiFactory>,
    storage: Arc<Storage>,
    health: HealthRecorder,
}

impl ChainExecutor {
    pub fn new(
        handlers: Vec<Arc<dyn UpdateHandler>>,
        registry: Arc<DeliveryRegistry>,
        api_factory: Arc<dyn BotApiFactory>,
        storage: Arc<Storage>,
        health: HealthRecorder,
    ) -> Arc<Self> {
        Arc::new(Self {
            handlers,
            registry,
            api_factory,
            storage,
            health,
        })
    }

    fn delivery_latency(update: &InboundUpdate) -> u64 {
        (now_ms() - update.received_at).max(0) as u64
    }
}

#[async_trait]
impl UpdateExecutor for ChainExecutor {
    async fn execute(&self, update: &InboundUpdate) -> ExecAck {
        let bot = match self.registry.get(&update.bot_id) {
            Ok(bot) => bot,
            Err(err) => {
                self.health.record(DeliveryEvent::failed(
                    &update.bot_id,
                    update.path,
                    "unknown_bot",
                ));
                return ExecAck::Fatal(err.to_string());
            }
        };

        let Some(handler) = self.handlers.iter().find(|h| h.accepts(update)) else {
            warn!(bot_id = %update.bot_id, update_id = update.update_id, "no handler accepted the update");
            self.health.record(DeliveryEvent::failed(
                &update.bot_id,
                update.path,
                "no_handler",
            ));
            return ExecAck::Fatal("no handler accepted the update".to_string());
        };

        let api = self.api_factory.api_for(&bot);
        let cx = HandlerContext::new(
            update.bot_id.clone(),
            update.slot_key(),
            api.clone(),
            self.storage.clone(),
        );

        let outcome = AssertUnwindSafe(handler.handle(&cx, update))
            .catch_unwind()
            .await;
        let verdict = match outcome {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(err)) => {
                warn!(
                    bot_id = %update.bot_id,
                    update_id = update.update_id,
                    handler = handler.name(),
                    error = %err,
                    "handler failed"
                );
                self.health.record(DeliveryEvent::failed(
                    &update.bot_id,
                    update.path,
                    "handler_error",
                ));
                return ExecAck::Fatal(err.to_string());
            }
            Err(_) => {
                warn!(
                    bot_id = %update.bot_id,
                    update_id = update.update_id,
                    handler = handler.name(),
                    "handler panicked"
                );
                self.health.record(DeliveryEvent::failed(
                    &update.bot_id,
                    update.path,
                    "handler_panic",
                ));
                return ExecAck::Fatal("handler panicked".to_string());
            }
        };

        match verdict {
            HandlerVerdict::Done => {
                self.health.record(DeliveryEvent::handled(
                    &update.bot_id,
                    update.path,
                    Self::delivery_latency(update),
                ));
                ExecAck::Done
            }
            HandlerVerdict::Reply(text) => {
                let Some(chat_id) = update.payload.chat_id() else {
                    debug!(
                        bot_id = %update.bot_id,
                        update_id = update.update_id,
                        "reply requested but update has no chat, dropping"
                    );
                    self.health.record(DeliveryEvent::handled(
                        &update.bot_id,
                        update.path,
                        Self::delivery_latency(update),
                    ));
                    return ExecAck::Done;
                };
                match api.send_message(chat_id, &text).await {
                    Ok(_) => {
                        self.health.record(DeliveryEvent::handled(
                            &update.bot_id,
                            update.path,
                            Self::delivery_latency(update),
                        ));
                        ExecAck::Done
                    }
                    Err(err) => ExecAck::Retry(format!("send failed: {err}")),
                }
            }
            HandlerVerdict::Retry(reason) => ExecAck::Retry(reason),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::dispatch::handler::{CommandAckHandler, FallbackHandler, default_chain};
    use crate::dispatch::health::DeliveryOutcome;
    use crate::models::{BotToken, DeliveryPath};
    use crate::telegram::mock::MockApiFactory;
    use crate::telegram::types::TelegramUpdate;
    use tempfile::tempdir;

    struct Rig {
        _dir: tempfile::TempDir,
        factory: Arc<MockApiFactory>,
        executor: Arc<ChainExecutor>,
        events: tokio::sync::mpsc::UnboundedReceiver<DeliveryEvent>,
    }

    fn rig(handlers: Vec<Arc<dyn UpdateHandler>>) -> Rig {
        let dir = tempdir().unwrap();
        let storage =
            Arc::new(Storage::new(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let factory = Arc::new(MockApiFactory::new());
        let registry = DeliveryRegistry::new(
            storage.clone(),
            factory.clone(),
            Arc::new(FleetConfig::default()),
        );
        registry.register("support-bot", BotToken::new("tok")).unwrap();
        let (recorder, events) = HealthRecorder::test_pair();
        let executor = ChainExecutor::new(handlers, registry, factory.clone(), storage, recorder);
        Rig {
            _dir: dir,
            factory,
            executor,
            events,
        }
    }

    fn message_update(text: &str) -> InboundUpdate {
        let payload: TelegramUpdate = serde_json::from_value(serde_json::json!({
            "update_id": 900,
            "message": {
                "message_id": 1,
                "from": {"id": 7, "is_bot": false, "first_name": "Ada"},
                "chat": {"id": 7, "type": "private"},
                "text": text,
            }
        }))
        .unwrap();
        InboundUpdate::new("support-bot", payload, DeliveryPath::Push)
    }

    #[tokio::test]
    async fn test_done_records_handled() {
        let mut rig = rig(vec![Arc::new(FallbackHandler)]);
        let ack = rig.executor.execute(&message_update("hi")).await;
        assert_eq!(ack, ExecAck::Done);

        let event = rig.events.try_recv().unwrap();
        assert_eq!(event.outcome, DeliveryOutcome::Handled);
        assert!(event.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_reply_goes_through_provider() {
        let mut rig = rig(default_chain());
        let ack = rig.executor.execute(&message_update("/start")).await;
        assert_eq!(ack, ExecAck::Done);

        let api = rig.factory.get("support-bot");
        assert_eq!(api.sent_texts(), vec!["Bot is online.".to_string()]);
        assert_eq!(
            rig.events.try_recv().unwrap().outcome,
            DeliveryOutcome::Handled
        );
    }

    #[tokio::test]
    async fn test_handler_error_is_fatal_and_recorded() {
        struct FailingHandler;

        #[async_trait]
        impl UpdateHandler for FailingHandler {
            fn name(&self) -> &str {
                "failing"
            }
            fn accepts(&self, _update: &InboundUpdate) -> bool {
                true
            }
            async fn handle(
                &self,
                _cx: &HandlerContext,
                _update: &InboundUpdate,
            ) -> anyhow::Result<HandlerVerdict> {
                anyhow::bail!("downstream unavailable")
            }
        }

        let mut rig = rig(vec![Arc::new(FailingHandler)]);
        let ack = rig.executor.execute(&message_update("hi")).await;
        assert!(matches!(ack, ExecAck::Fatal(_)));

        let event = rig.events.try_recv().unwrap();
        assert_eq!(event.outcome, DeliveryOutcome::Failed);
        assert_eq!(event.reason, Some("handler_error"));
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        struct PanickingHandler;

        #[async_trait]
        impl UpdateHandler for PanickingHandler {
            fn name(&self) -> &str {
                "panicking"
            }
            fn accepts(&self, _update: &InboundUpdate) -> bool {
                true
            }
            async fn handle(
                &self,
                _cx: &HandlerContext,
                _update: &InboundUpdate,
            ) -> anyhow::Result<HandlerVerdict> {
                panic!("boom")
            }
        }

        let mut rig = rig(vec![Arc::new(PanickingHandler)]);
        let ack = rig.executor.execute(&message_update("hi")).await;
        assert_eq!(ack, ExecAck::Fatal("handler panicked".to_string()));
        assert_eq!(
            rig.events.try_recv().unwrap().reason,
            Some("handler_panic")
        );
    }

    #[tokio::test]
    async fn test_retry_verdict_passes_through() {
        struct RetryingHandler;

        #[async_trait]
        impl UpdateHandler for RetryingHandler {
            fn name(&self) -> &str {
                "retrying"
            }
            fn accepts(&self, _update: &InboundUpdate) -> bool {
                true
            }
            async fn handle(
                &self,
                _cx: &HandlerContext,
                _update: &InboundUpdate,
            ) -> anyhow::Result<HandlerVerdict> {
                Ok(HandlerVerdict::Retry("rate limited".to_string()))
            }
        }

        let mut rig = rig(vec![Arc::new(RetryingHandler)]);
        let ack = rig.executor.execute(&message_update("hi")).await;
        assert_eq!(ack, ExecAck::Retry("rate limited".to_string()));
        assert!(rig.events.try_recv().is_err(), "retry defers health reporting to the pump");
    }

    #[tokio::test]
    async fn test_first_accepting_handler_wins() {
        let mut rig = rig(vec![Arc::new(CommandAckHandler), Arc::new(FallbackHandler)]);

        rig.executor.execute(&message_update("/help")).await;
        let api = rig.factory.get("support-bot");
        assert_eq!(api.sent_texts(), vec!["Received /help.".to_string()]);

        rig.executor.execute(&message_update("plain text")).await;
        assert_eq!(api.sent_texts().len(), 1, "fallback does not reply");
        let _ = rig.events.try_recv();
    }

    #[tokio::test]
    async fn test_unknown_bot_is_fatal() {
        let mut rig = rig(default_chain());
        let mut update = message_update("hi");
        update.bot_id = "ghost".to_string();

        let ack = rig.executor.execute(&update).await;
        assert!(matches!(ack, ExecAck::Fatal(_)));
        assert_eq!(rig.events.try_recv().unwrap().reason, Some("unknown_bot"));
    }
}
