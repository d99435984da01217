use anyhow::Result;
use comfy_table::{Cell, Table};
use serde_json::json;
use std::sync::Arc;

use botfleet_core::FleetCore;
use botfleet_core::models::{BotHealth, HealthAlert};

use crate::cli::OutputFormat;
use crate::commands::utils::{colored_mode, format_timestamp};
use crate::output::json::print_json;

const ALERT_TAIL: usize = 5;

pub fn run(core: Arc<FleetCore>, bot_id: Option<String>, format: OutputFormat) -> Result<()> {
    match bot_id {
        Some(bot_id) => bot_health(core, &bot_id, format),
        None => fleet_health(core, format),
    }
}

/// Most recent persisted window for a bot. The serve process owns the live
/// in-memory windows, so the CLI reads what the snapshot job wrote.
fn latest_snapshot(core: &FleetCore, bot_id: &str) -> Result<Option<BotHealth>> {
    let Some(data) = core.health_store.latest_for_bot(bot_id)? else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

fn recent_alerts(
    core: &FleetCore,
    bot_id: Option<&str>,
    limit: usize,
) -> Result<Vec<HealthAlert>> {
    let mut alerts = Vec::new();
    for (_key, data) in core.storage.alerts.list_raw()?.into_iter().rev() {
        let Ok(alert) = serde_json::from_slice::<HealthAlert>(&data) else {
            continue;
        };
        if bot_id.is_some_and(|id| id != alert.bot_id) {
            continue;
        }
        alerts.push(alert);
        if alerts.len() >= limit {
            break;
        }
    }
    Ok(alerts)
}

fn fleet_health(core: Arc<FleetCore>, format: OutputFormat) -> Result<()> {
    let bots = core.registry.list();
    let alerts = recent_alerts(&core, None, ALERT_TAIL)?;

    if format.is_json() {
        let mut rows = Vec::new();
        for bot in &bots {
            rows.push(json!({
                "bot_id": bot.bot_id,
                "health": latest_snapshot(&core, &bot.bot_id)?,
            }));
        }
        return print_json(&json!({ "bots": rows, "recent_alerts": alerts }));
    }

    if bots.is_empty() {
        println!("No bots registered.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "ID",
        "Mode",
        "Received",
        "Handled",
        "Failed",
        "Error rate",
        "Window end",
    ]);
    for bot in &bots {
        let row = match latest_snapshot(&core, &bot.bot_id)? {
            Some(health) => vec![
                Cell::new(&bot.bot_id),
                Cell::new(colored_mode(health.mode)),
                Cell::new(health.received),
                Cell::new(health.handled),
                Cell::new(health.failed),
                Cell::new(format!("{:.1}%", health.error_rate * 100.0)),
                Cell::new(format_timestamp(health.window_end)),
            ],
            None => {
                let mode = core.registry.committed_mode(&bot.bot_id).unwrap_or(bot.mode);
                vec![
                    Cell::new(&bot.bot_id),
                    Cell::new(colored_mode(mode)),
                    Cell::new("-"),
                    Cell::new("-"),
                    Cell::new("-"),
                    Cell::new("-"),
                    Cell::new("no snapshot yet"),
                ]
            }
        };
        table.add_row(row);
    }
    crate::output::table::print_table(table)?;

    if !alerts.is_empty() {
        println!();
        println!("Recent alerts:");
        for alert in alerts {
            println!(
                "  {} [{}] {}",
                format_timestamp(alert.raised_at),
                alert.bot_id,
                alert.message
            );
        }
    }
    Ok(())
}

fn bot_health(core: Arc<FleetCore>, bot_id: &str, format: OutputFormat) -> Result<()> {
    let bot = core.registry.get(bot_id)?;
    let mode = core.registry.committed_mode(bot_id)?;
    let polling_active = core.scheduler.is_running(bot_id);
    let health = latest_snapshot(&core, bot_id)?;
    let alerts = recent_alerts(&core, Some(bot_id), ALERT_TAIL)?;

    if format.is_json() {
        return print_json(&json!({
            "bot_id": bot.bot_id,
            "mode": mode.as_str(),
            "polling_active": polling_active,
            "health": health,
            "recent_alerts": alerts,
        }));
    }

    println!("Bot:            {}", bot.bot_id);
    println!("Delivery mode:  {}", colored_mode(mode));
    if polling_active {
        println!("Poll loop:      running");
    }
    match health {
        Some(health) => {
            println!("Window end:     {}", format_timestamp(health.window_end));
            println!("Received:       {}", health.received);
            println!("Handled:        {}", health.handled);
            println!("Rejected:       {}", health.rejected);
            println!("Failed:         {}", health.failed);
            println!("Error rate:     {:.1}%", health.error_rate * 100.0);
            println!("Avg latency:    {:.0} ms", health.avg_latency_ms);
            if let Some(at) = health.last_update_at {
                println!("Last update:    {}", format_timestamp(at));
            }
        }
        None => println!("No health snapshot recorded yet."),
    }

    if !alerts.is_empty() {
        println!();
        println!("Recent alerts:");
        for alert in alerts {
            println!("  {} {}", format_timestamp(alert.raised_at), alert.message);
        }
    }
    Ok(())
}
