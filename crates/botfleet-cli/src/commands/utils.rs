use chrono::{DateTime, Local, TimeZone};
use colored::Colorize;

use botfleet_core::models::{BotStatus, DeliveryMode};

pub fn format_timestamp(timestamp: i64) -> String {
    let datetime: DateTime<Local> = match Local.timestamp_millis_opt(timestamp).single() {
        Some(dt) => dt,
        None => return "-".to_string(),
    };
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn colored_status(status: BotStatus) -> String {
    match status {
        BotStatus::Active => "active".green().to_string(),
        BotStatus::Paused => "paused".yellow().to_string(),
        BotStatus::Error => "error".red().to_string(),
    }
}

pub fn colored_mode(mode: DeliveryMode) -> String {
    match mode {
        DeliveryMode::Webhook => "webhook".cyan().to_string(),
        DeliveryMode::Polling => "polling".blue().to_string(),
        DeliveryMode::Disabled => "disabled".dimmed().to_string(),
        DeliveryMode::Transitioning => "transitioning".yellow().to_string(),
    }
}
