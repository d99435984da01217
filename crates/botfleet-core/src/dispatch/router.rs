//! Shared update router.
//!
//! One router serves the whole fleet. Each conversation slot owns a FIFO of
//! pending updates drained by a pump task spawned on demand; the pump submits
//! one update at a time to the [`UpdateExecutor`] and waits for its
//! acknowledgment, which is what serializes a slot. Distinct slots pump in
//! parallel, bounded globally by a semaphore.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::error::DispatchError;
use super::health::{DeliveryEvent, HealthRecorder};
use super::worker::{ExecAck, UpdateExecutor};
use crate::config::DispatchConfig;
use crate::models::InboundUpdate;

struct SlotQueue {
    items: VecDeque<InboundUpdate>,
    /// True while a pump task owns this slot.
    pumping: bool,
}

struct SlotState {
    queue: Mutex<SlotQueue>,
}

impl SlotState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(SlotQueue {
                items: VecDeque::new(),
                pumping: false,
            }),
        })
    }
}

pub struct UpdateRouter {
    executor: Arc<dyn UpdateExecutor>,
    health: HealthRecorder,
    slots: DashMap<String, Arc<SlotState>>,
    permits: Arc<Semaphore>,
    /// Updates admitted but not yet finished, across all slots.
    depth: AtomicUsize,
    queue_bound: usize,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl UpdateRouter {
    pub fn new(
        executor: Arc<dyn UpdateExecutor>,
        health: HealthRecorder,
        config: &DispatchConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            executor,
            health,
            slots: DashMap::new(),
            permits: Arc::new(Semaphore::new(config.effective_in_flight())),
            depth: AtomicUsize::new(0),
            queue_bound: config.queue_bound,
            retry_attempts: config.retry_attempts,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    /// Append an update to its slot's FIFO and return immediately. Spawns the
    /// slot's pump when none is running.
    pub fn enqueue(self: &Arc<Self>, update: InboundUpdate) -> Result<(), DispatchError> {
        let admitted = self.depth.fetch_add(1, Ordering::SeqCst);
        if admitted >= self.queue_bound {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            warn!(
                bot_id = %update.bot_id,
                update_id = update.update_id,
                depth = admitted,
                "dispatch queue full, refusing update"
            );
            return Err(DispatchError::QueueFull);
        }

        let slot_key = update.slot_key();
        // Push while holding the map entry so a concurrent prune cannot
        // drop the slot between lookup and insert.
        let entry = self
            .slots
            .entry(slot_key.clone())
            .or_insert_with(SlotState::new);
        let state = entry.clone();
        let spawn_pump = {
            let mut queue = entry.queue.lock();
            queue.items.push_back(update);
            if queue.pumping {
                false
            } else {
                queue.pumping = true;
                true
            }
        };
        drop(entry);

        if spawn_pump {
            let router = self.clone();
            tokio::spawn(async move {
                router.run_pump(state, slot_key).await;
            });
        }
        Ok(())
    }

    /// Updates admitted but not yet finished.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Drop slot entries with no queued work and no pump. Returns how many
    /// were removed.
    pub fn prune_idle_slots(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, state| {
            let queue = state.queue.lock();
            queue.pumping || !queue.items.is_empty()
        });
        before - self.slots.len()
    }

    /// Drain one slot until its FIFO is empty. Exactly one pump runs per slot
    /// at any time; the `pumping` flag flips under the queue lock.
    async fn run_pump(self: Arc<Self>, state: Arc<SlotState>, slot_key: String) {
        loop {
            let update = {
                let mut queue = state.queue.lock();
                match queue.items.pop_front() {
                    Some(update) => update,
                    None => {
                        queue.pumping = false;
                        break;
                    }
                }
            };

            self.deliver(update).await;
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(slot = %slot_key, "slot pump drained");
    }

    /// Submit one update, retrying transient failures with exponential
    /// backoff. The global permit is held only while the executor runs, not
    /// across backoff sleeps.
    async fn deliver(&self, update: InboundUpdate) {
        let mut attempt = 0u32;
        loop {
            let ack = {
                let Ok(_permit) = self.permits.acquire().await else {
                    // The semaphore is never closed while the router lives.
                    return;
                };
                self.executor.execute(&update).await
            };

            match ack {
                ExecAck::Done => return,
                ExecAck::Fatal(reason) => {
                    warn!(
                        bot_id = %update.bot_id,
                        update_id = update.update_id,
                        reason = %reason,
                        "update dropped after fatal executor ack"
                    );
                    return;
                }
                ExecAck::Retry(reason) => {
                    attempt += 1;
                    if attempt > self.retry_attempts {
                        warn!(
                            bot_id = %update.bot_id,
                            update_id = update.update_id,
                            attempts = attempt,
                            reason = %reason,
                            "retries exhausted, dropping update"
                        );
                        self.health.record(DeliveryEvent::failed(
                            &update.bot_id,
                            update.path,
                            "retries_exhausted",
                        ));
                        return;
                    }
                    let backoff = self.retry_backoff * 2u32.pow(attempt - 1);
                    debug!(
                        bot_id = %update.bot_id,
                        update_id = update.update_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        reason = %reason,
                        "retrying update"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
