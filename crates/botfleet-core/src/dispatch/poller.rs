//! Long-poll loop for a single bot.
//!
//! One `BotPoller` task per polling-mode bot, owned and supervised by the
//! scheduler. The loop long-polls `getUpdates`, forwards each batch to the
//! router in provider order, and advances its offset past the highest update
//! seen. Fetch failures back off exponentially and never tear the loop down;
//! cancellation is observed between fetch cycles so an in-flight long poll
//! always completes.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::health::{DeliveryEvent, HealthRecorder};
use super::router::UpdateRouter;
use crate::config::PollingConfig;
use crate::models::{BotIdentity, DeliveryPath, InboundUpdate};
use crate::telegram::BotApi;

pub struct BotPoller {
    bot: BotIdentity,
    api: Arc<dyn BotApi>,
    router: Arc<UpdateRouter>,
    health: HealthRecorder,
    config: PollingConfig,
    cancel: CancellationToken,
}

impl BotPoller {
    pub fn new(
        bot: BotIdentity,
        api: Arc<dyn BotApi>,
        router: Arc<UpdateRouter>,
        health: HealthRecorder,
        config: PollingConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bot,
            api,
            router,
            health,
            config,
            cancel,
        }
    }

    /// Run until cancelled. The offset lives only as long as the task;
    /// after a restart the provider re-delivers unacknowledged updates and
    /// slot ordering absorbs the overlap.
    pub async fn run(self) {
        let bot_id = self.bot.bot_id.clone();
        let mut offset: i64 = 0;
        let mut backoff = Duration::from_millis(self.config.error_backoff_min_ms);
        info!(bot_id = %bot_id, "poll loop started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self
                .api
                .get_updates(offset, self.config.poll_timeout_secs, self.config.batch_limit)
                .await
            {
                Ok(updates) => {
                    backoff = Duration::from_millis(self.config.error_backoff_min_ms);
                    for payload in updates {
                        offset = offset.max(payload.update_id + 1);
                        self.health
                            .record(DeliveryEvent::accepted(&bot_id, DeliveryPath::Pull));

                        let update = InboundUpdate::new(&bot_id, payload, DeliveryPath::Pull);
                        if let Err(err) = self.router.enqueue(update) {
                            warn!(bot_id = %bot_id, error = %err, "router refused polled update");
                            self.health.record(DeliveryEvent::failed(
                                &bot_id,
                                DeliveryPath::Pull,
                                "queue_full",
                            ));
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        bot_id = %bot_id,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "getUpdates failed, backing off"
                    );
                    self.health.record(DeliveryEvent::failed(
                        &bot_id,
                        DeliveryPath::Pull,
                        "fetch_error",
                    ));
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2)
                        .min(Duration::from_millis(self.config.error_backoff_max_ms));
                }
            }
        }

        info!(bot_id = %bot_id, "poll loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::health::DeliveryOutcome;
    use crate::dispatch::worker::mock::MockUpdateExecutor;
    use crate::models::BotToken;
    use crate::telegram::mock::MockBotApi;
    use crate::telegram::types::TelegramUpdate;
    use std::sync::atomic::Ordering;
    use std::time::Instant;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn fast_polling() -> PollingConfig {
        PollingConfig {
            poll_timeout_secs: 1,
            batch_limit: 100,
            error_backoff_min_ms: 5,
            error_backoff_max_ms: 40,
            shutdown_grace_secs: 5,
        }
    }

    fn payload(update_id: i64, user_id: i64) -> TelegramUpdate {
        serde_json::from_value(serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": update_id,
                "from": {"id": user_id, "is_bot": false, "first_name": "Ada"},
                "chat": {"id": user_id, "type": "private"},
                "text": "hi",
            }
        }))
        .unwrap()
    }

    struct Rig {
        api: Arc<MockBotApi>,
        executor: Arc<MockUpdateExecutor>,
        router: Arc<UpdateRouter>,
        events: UnboundedReceiver<DeliveryEvent>,
        cancel: CancellationToken,
        join: tokio::task::JoinHandle<()>,
    }

    fn start_poller(queue_bound: usize) -> Rig {
        let api = Arc::new(MockBotApi::new());
        let executor = MockUpdateExecutor::new();
        let (health, events) = HealthRecorder::test_pair();
        let config = DispatchConfig {
            queue_bound,
            retry_backoff_ms: 1,
            ..DispatchConfig::default()
        };
        let router = UpdateRouter::new(executor.clone(), health.clone(), &config);
        let cancel = CancellationToken::new();

        let bot = BotIdentity::provision("poll-bot", BotToken::new("tok"));
        let poller = BotPoller::new(
            bot,
            api.clone(),
            router.clone(),
            health,
            fast_polling(),
            cancel.clone(),
        );
        let join = tokio::spawn(poller.run());

        Rig {
            api,
            executor,
            router,
            events,
            cancel,
            join,
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
    async fn test_offset_advances_past_each_batch() {
        let rig = start_poller(100);
        rig.api.push_batch(vec![payload(5, 9), payload(6, 9)]);
        rig.api.push_batch(vec![payload(7, 9)]);

        wait_until(|| rig.executor.executed.load(Ordering::SeqCst) == 3).await;
        rig.cancel.cancel();
        let _ = rig.join.await;

        let offsets = rig.api.offsets_seen.lock().clone();
        assert!(offsets.len() >= 3);
        assert_eq!(offsets[0], 0);
        assert_eq!(offsets[1], 7, "offset jumps past the highest update in the batch");
        assert_eq!(offsets[2], 8);

        assert_eq!(rig.executor.entered_order("poll-bot:9"), vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_fetch_errors_back_off_then_recover() {
        let mut rig = start_poller(100);
        rig.api.fail_get_updates.store(true, Ordering::SeqCst);

        let mut saw_fetch_error = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !saw_fetch_error && Instant::now() < deadline {
            if let Ok(event) = rig.events.try_recv() {
                saw_fetch_error = event.outcome == DeliveryOutcome::Failed
                    && event.reason == Some("fetch_error");
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        assert!(saw_fetch_error);

        rig.api.fail_get_updates.store(false, Ordering::SeqCst);
        rig.api.push_batch(vec![payload(40, 9)]);
        wait_until(|| rig.executor.executed.load(Ordering::SeqCst) == 1).await;

        rig.cancel.cancel();
        let _ = rig.join.await;
    }

    #[tokio::test]
    async fn test_cancel_observed_between_cycles() {
        let rig = start_poller(100);
        wait_until(|| rig.api.get_updates_calls.load(Ordering::SeqCst) >= 1).await;

        rig.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), rig.join)
            .await
            .expect("poller exits promptly once cancelled")
            .unwrap();
    }

    #[tokio::test]
    async fn test_queue_full_is_recorded_not_fatal() {
        let mut rig = start_poller(1);
        rig.executor.delay_ms.store(300, Ordering::SeqCst);
        rig.api
            .push_batch(vec![payload(1, 7), payload(2, 7), payload(3, 7)]);

        // 1 admitted, 2 refused; the loop keeps polling afterwards.
        wait_until(|| rig.executor.executed.load(Ordering::SeqCst) == 1).await;
        wait_until(|| rig.router.depth() == 0).await;
        wait_until(|| rig.api.get_updates_calls.load(Ordering::SeqCst) >= 2).await;
        rig.cancel.cancel();
        let _ = rig.join.await;

        let mut accepted = 0;
        let mut queue_full = 0;
        while let Ok(event) = rig.events.try_recv() {
            match (event.outcome, event.reason) {
                (DeliveryOutcome::Accepted, _) => accepted += 1,
                (DeliveryOutcome::Failed, Some("queue_full")) => queue_full += 1,
                _ => {}
            }
        }
        assert_eq!(accepted, 3);
        assert_eq!(queue_full, 2);
    }
}
