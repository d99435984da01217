//! Health and metrics aggregation.
//!
//! Delivery paths report fire-and-forget events through [`HealthRecorder`];
//! an aggregator task folds them into per-bot rolling windows. Threshold
//! evaluation walks the windows and raises deduplicated alerts that drive
//! webhook-to-polling fallback.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::HealthConfig;
use crate::models::{AlertKind, BotHealth, BotIdentity, DeliveryMode, DeliveryPath, HealthAlert, now_ms};

/// Terminal classification of one delivery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Update entered the engine and was queued for execution.
    Accepted,
    /// Handler chain completed.
    Handled,
    /// Update was refused at the edge before routing.
    Rejected,
    /// Execution or fetch failed after acceptance.
    Failed,
}

/// One health event. Cheap to build, cheap to send.
#[derive(Debug, Clone)]
pub struct DeliveryEvent {
    pub bot_id: String,
    pub path: DeliveryPath,
    pub outcome: DeliveryOutcome,
    pub reason: Option<&'static str>,
    pub latency_ms: Option<u64>,
    pub at: i64,
}

impl DeliveryEvent {
    pub fn accepted(bot_id: &str, path: DeliveryPath) -> Self {
        Self::new(bot_id, path, DeliveryOutcome::Accepted, None, None)
    }

    pub fn handled(bot_id: &str, path: DeliveryPath, latency_ms: u64) -> Self {
        Self::new(
            bot_id,
            path,
            DeliveryOutcome::Handled,
            None,
            Some(latency_ms),
        )
    }

    pub fn rejected(bot_id: &str, path: DeliveryPath, reason: &'static str) -> Self {
        Self::new(bot_id, path, DeliveryOutcome::Rejected, Some(reason), None)
    }

    pub fn failed(bot_id: &str, path: DeliveryPath, reason: &'static str) -> Self {
        Self::new(bot_id, path, DeliveryOutcome::Failed, Some(reason), None)
    }

    fn new(
        bot_id: &str,
        path: DeliveryPath,
        outcome: DeliveryOutcome,
        reason: Option<&'static str>,
        latency_ms: Option<u64>,
    ) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            path,
            outcome,
            reason,
            latency_ms,
            at: now_ms(),
        }
    }
}

/// Non-blocking event intake handle. Clone freely; sits on hot paths.
#[derive(Clone)]
pub struct HealthRecorder {
    tx: mpsc::UnboundedSender<DeliveryEvent>,
    closed_logged: Arc<AtomicBool>,
}

impl HealthRecorder {
    /// Enqueue an event; never blocks. A closed aggregator drops the event.
    pub fn record(&self, event: DeliveryEvent) {
        if self.tx.send(event).is_err() && !self.closed_logged.swap(true, Ordering::SeqCst) {
            warn!("health aggregator gone, dropping delivery events");
        }
    }

    /// Recorder wired to a bare channel, for asserting emitted events.
    #[cfg(test)]
    pub fn test_pair() -> (Self, mpsc::UnboundedReceiver<DeliveryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed_logged: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }
}

/// Per-bot rolling windows plus alert cooldown tracking.
pub struct HealthAggregator {
    windows: DashMap<String, VecDeque<DeliveryEvent>>,
    last_alert_at: DashMap<String, i64>,
    config: HealthConfig,
}

impl HealthAggregator {
    pub fn new(config: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            windows: DashMap::new(),
            last_alert_at: DashMap::new(),
            config,
        })
    }

    /// Spawn the consumer task; returns the recorder half.
    pub fn start(self: &Arc<Self>) -> (HealthRecorder, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                aggregator.ingest(event);
            }
            debug!("health aggregator intake closed");
        });

        (
            HealthRecorder {
                tx,
                closed_logged: Arc::new(AtomicBool::new(false)),
            },
            handle,
        )
    }

    /// Fold one event into its bot's window.
    pub fn ingest(&self, event: DeliveryEvent) {
        let horizon = event.at - self.window_ms();
        let mut window = self.windows.entry(event.bot_id.clone()).or_default();
        window.push_back(event);
        while window.front().is_some_and(|oldest| oldest.at < horizon) {
            window.pop_front();
        }
    }

    fn window_ms(&self) -> i64 {
        (self.config.window_secs as i64) * 1_000
    }

    /// Point-in-time counters for one bot over the current window.
    pub fn snapshot(&self, bot_id: &str, mode: DeliveryMode) -> BotHealth {
        let now = now_ms();
        let horizon = now - self.window_ms();

        let mut accepted = 0u64;
        let mut handled = 0u64;
        let mut rejected = 0u64;
        let mut failed = 0u64;
        let mut latency_total = 0u64;
        let mut latency_count = 0u64;
        let mut last_update_at = None;

        if let Some(window) = self.windows.get(bot_id) {
            for event in window.iter().filter(|event| event.at >= horizon) {
                match event.outcome {
                    DeliveryOutcome::Accepted => accepted += 1,
                    DeliveryOutcome::Handled => handled += 1,
                    DeliveryOutcome::Rejected => rejected += 1,
                    DeliveryOutcome::Failed => failed += 1,
                }
                if let Some(latency) = event.latency_ms {
                    latency_total += latency;
                    latency_count += 1;
                }
                last_update_at = Some(
                    last_update_at.map_or(event.at, |current: i64| current.max(event.at)),
                );
            }
        }

        let received = accepted + rejected;
        let error_rate = if received > 0 {
            (rejected + failed) as f64 / received as f64
        } else {
            0.0
        };
        let avg_latency_ms = if latency_count > 0 {
            latency_total as f64 / latency_count as f64
        } else {
            0.0
        };

        BotHealth {
            bot_id: bot_id.to_string(),
            mode,
            window_start: horizon,
            window_end: now,
            received,
            handled,
            rejected,
            failed,
            error_rate,
            avg_latency_ms,
            last_update_at,
        }
    }

    /// Snapshots for every provided bot, window or not.
    pub fn snapshot_all(&self, bots: &[BotIdentity]) -> Vec<BotHealth> {
        bots.iter()
            .map(|bot| self.snapshot(&bot.bot_id, bot.mode))
            .collect()
    }

    /// Evaluate thresholds for webhook-mode bots. Returns the alerts raised
    /// this pass; a bot inside its cooldown window raises nothing even while
    /// the breach persists.
    pub fn evaluate(&self, bots: &[BotIdentity]) -> Vec<HealthAlert> {
        let mut alerts = Vec::new();
        let cooldown_ms = (self.config.alert_cooldown_secs as i64) * 1_000;

        for bot in bots {
            if bot.mode != DeliveryMode::Webhook {
                continue;
            }
            let health = self.snapshot(&bot.bot_id, bot.mode);
            if health.received < self.config.min_samples {
                continue;
            }
            if health.error_rate <= self.config.error_rate_threshold {
                continue;
            }

            let now = now_ms();
            let in_cooldown = self
                .last_alert_at
                .get(&bot.bot_id)
                .is_some_and(|last| now - *last < cooldown_ms);
            if in_cooldown {
                continue;
            }
            self.last_alert_at.insert(bot.bot_id.clone(), now);

            alerts.push(HealthAlert {
                alert_id: Uuid::new_v4(),
                bot_id: bot.bot_id.clone(),
                kind: AlertKind::ErrorRate,
                error_rate: health.error_rate,
                window_start: health.window_start,
                window_end: health.window_end,
                raised_at: now,
                message: format!(
                    "error rate {:.0}% over last {}s exceeds {:.0}% threshold",
                    health.error_rate * 100.0,
                    self.config.window_secs,
                    self.config.error_rate_threshold * 100.0,
                ),
            });
        }

        alerts
    }

    /// Drop windows that have gone completely silent past the horizon.
    pub fn prune_idle(&self) -> usize {
        let horizon = now_ms() - self.window_ms();
        let idle: Vec<String> = self
            .windows
            .iter()
            .filter(|entry| entry.value().back().is_none_or(|event| event.at < horizon))
            .map(|entry| entry.key().clone())
            .collect();
        for bot_id in &idle {
            self.windows.remove(bot_id);
        }
        idle.len()
    }
}
