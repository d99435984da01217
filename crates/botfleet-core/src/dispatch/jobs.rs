//! Scheduled maintenance: snapshot persistence, threshold evaluation,
//! retention cleanup.

use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::FleetCore;
use crate::models::{AlertKind, ConversationSlot, HealthAlert, now_ms};
use botfleet_storage::AlertStore;

/// What one retention pass removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub health_rows: usize,
    pub alerts: usize,
    pub stale_slots: usize,
    pub idle_queue_slots: usize,
    pub idle_windows: usize,
}

/// Wire and start the recurring maintenance jobs.
pub async fn start_jobs(core: &Arc<FleetCore>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow!("Failed to create job scheduler: {}", e))?;

    let job_core = core.clone();
    let snapshot_job = Job::new_repeated_async(
        Duration::from_secs(core.config.health.snapshot_interval_secs),
        move |_uuid, _lock| {
            let core = job_core.clone();
            Box::pin(async move {
                match snapshot_health(&core) {
                    Ok(rows) => debug!(rows, "health snapshots persisted"),
                    Err(err) => error!(error = %err, "health snapshot job failed"),
                }
            })
        },
    )
    .map_err(|e| anyhow!("Failed to create snapshot job: {}", e))?;
    scheduler
        .add(snapshot_job)
        .await
        .map_err(|e| anyhow!("Failed to add snapshot job: {}", e))?;

    let job_core = core.clone();
    let evaluate_job = Job::new_repeated_async(
        Duration::from_secs(core.config.health.evaluate_interval_secs),
        move |_uuid, _lock| {
            let core = job_core.clone();
            Box::pin(async move {
                match evaluate_alerts(&core).await {
                    Ok(alerts) if alerts.is_empty() => {}
                    Ok(alerts) => info!(raised = alerts.len(), "health evaluation raised alerts"),
                    Err(err) => error!(error = %err, "health evaluation job failed"),
                }
            })
        },
    )
    .map_err(|e| anyhow!("Failed to create evaluation job: {}", e))?;
    scheduler
        .add(evaluate_job)
        .await
        .map_err(|e| anyhow!("Failed to add evaluation job: {}", e))?;

    let job_core = core.clone();
    let cleanup_job = Job::new_async(
        core.config.health.cleanup_cron.as_str(),
        move |_uuid, _lock| {
            let core = job_core.clone();
            Box::pin(async move {
                if let Err(err) = run_cleanup(&core) {
                    error!(error = %err, "cleanup job failed");
                }
            })
        },
    )
    .map_err(|e| anyhow!("Failed to create cleanup job: {}", e))?;
    scheduler
        .add(cleanup_job)
        .await
        .map_err(|e| anyhow!("Failed to add cleanup job: {}", e))?;

    scheduler
        .start()
        .await
        .map_err(|e| anyhow!("Failed to start job scheduler: {}", e))?;

    info!(
        snapshot_secs = core.config.health.snapshot_interval_secs,
        evaluate_secs = core.config.health.evaluate_interval_secs,
        cleanup_cron = %core.config.health.cleanup_cron,
        "maintenance jobs started"
    );
    Ok(scheduler)
}

/// Persist one rolling-window snapshot row per registered bot.
pub fn snapshot_health(core: &FleetCore) -> Result<usize> {
    let bots = core.registry.list();
    let window_end = now_ms();

    let mut written = 0;
    for bot in &bots {
        let mode = core
            .registry
            .committed_mode(&bot.bot_id)
            .unwrap_or(bot.mode);
        let snapshot = core.aggregator.snapshot(&bot.bot_id, mode);
        let data = serde_json::to_vec(&snapshot)?;
        core.health_store.append(&bot.bot_id, window_end, &data)?;
        written += 1;
    }
    Ok(written)
}

/// One evaluation pass: raise alerts for webhook bots over the error
/// threshold and demote them to polling, then restart any polling bot
/// whose loop has died. Returns every alert raised this pass.
pub async fn evaluate_alerts(core: &Arc<FleetCore>) -> Result<Vec<HealthAlert>> {
    let bots = core.registry.list();
    let mut raised = core.aggregator.evaluate(&bots);

    for alert in &raised {
        persist_alert(core, alert);
        warn!(
            bot_id = %alert.bot_id,
            error_rate = alert.error_rate,
            "health alert: {}",
            alert.message
        );
        if let Err(err) = core
            .scheduler
            .fallback_to_polling(&alert.bot_id, "error rate above threshold")
            .await
        {
            error!(bot_id = %alert.bot_id, error = %err, "webhook fallback failed");
        }
    }

    let mut stalled = false;
    for bot in core.registry.pollable_bots() {
        if core.scheduler.is_running(&bot.bot_id) {
            continue;
        }
        stalled = true;
        let health = core.aggregator.snapshot(&bot.bot_id, bot.mode);
        let alert = HealthAlert {
            alert_id: Uuid::new_v4(),
            bot_id: bot.bot_id.clone(),
            kind: AlertKind::PollerStalled,
            error_rate: health.error_rate,
            window_start: health.window_start,
            window_end: health.window_end,
            raised_at: now_ms(),
            message: format!("poll loop for {} is not running", bot.bot_id),
        };
        persist_alert(core, &alert);
        warn!(bot_id = %bot.bot_id, "poll loop dead, scheduling restart");
        raised.push(alert);
    }
    if stalled {
        core.scheduler.reconcile().await;
    }

    Ok(raised)
}

fn persist_alert(core: &FleetCore, alert: &HealthAlert) {
    let key = AlertStore::alert_key(alert.raised_at, &alert.alert_id.to_string());
    match serde_json::to_vec(alert) {
        Ok(data) => {
            if let Err(err) = core.storage.alerts.put_raw(&key, &data) {
                error!(bot_id = %alert.bot_id, error = %err, "failed to persist health alert");
            }
        }
        Err(err) => {
            error!(bot_id = %alert.bot_id, error = %err, "failed to encode health alert");
        }
    }
}

/// One retention pass over persisted and in-memory operational state.
pub fn run_cleanup(core: &FleetCore) -> Result<CleanupReport> {
    let retention_ms = (core.config.health.retention_days as i64) * 24 * 60 * 60 * 1_000;
    let cutoff = now_ms() - retention_ms;

    let health_rows = core.health_store.prune_before(cutoff)?;
    let alerts = core.storage.alerts.prune_before(cutoff)?;

    let slot_max_age_ms = (core.config.health.slot_max_age_hours as i64) * 60 * 60 * 1_000;
    let mut stale_slots = 0;
    for (key, data) in core.storage.slots.list_raw()? {
        let stale = match serde_json::from_slice::<ConversationSlot>(&data) {
            Ok(slot) => slot.is_stale(slot_max_age_ms),
            Err(err) => {
                warn!(key = %key, error = %err, "dropping unreadable conversation slot");
                true
            }
        };
        if stale && core.storage.slots.delete(&key)? {
            stale_slots += 1;
        }
    }

    let idle_queue_slots = core.router.prune_idle_slots();
    let idle_windows = core.aggregator.prune_idle();

    let report = CleanupReport {
        health_rows,
        alerts,
        stale_slots,
        idle_queue_slots,
        idle_windows,
    };
    info!(
        health_rows = report.health_rows,
        alerts = report.alerts,
        stale_slots = report.stale_slots,
        idle_queue_slots = report.idle_queue_slots,
        idle_windows = report.idle_windows,
        "cleanup pass finished"
    );
    Ok(report)
}
