use anyhow::{Context, Result};
use comfy_table::{Cell, Table};
use serde_json::json;
use std::sync::Arc;

use botfleet_core::FleetCore;
use botfleet_core::models::{BotToken, DeliveryMode};
use botfleet_core::telegram::check_token;

use crate::cli::{BotCommands, OutputFormat};
use crate::commands::utils::{colored_mode, colored_status, format_timestamp};
use crate::output::json::print_json;

pub async fn run(core: Arc<FleetCore>, command: BotCommands, format: OutputFormat) -> Result<()> {
    match command {
        BotCommands::Add {
            bot_id,
            token,
            skip_verify,
        } => add_bot(core, &bot_id, token, skip_verify, format).await,
        BotCommands::List => list_bots(core, format),
        BotCommands::Start { bot_id } => start_bot(core, &bot_id, format).await,
        BotCommands::Stop { bot_id } => stop_bot(core, &bot_id, format).await,
        BotCommands::Remove { bot_id } => remove_bot(core, &bot_id, format).await,
    }
}

async fn add_bot(
    core: Arc<FleetCore>,
    bot_id: &str,
    token: String,
    skip_verify: bool,
    format: OutputFormat,
) -> Result<()> {
    let token = BotToken::new(token);

    let account = if skip_verify {
        None
    } else {
        Some(
            check_token(&token)
                .await
                .context("token validation against Telegram failed")?,
        )
    };

    let bot = core.registry.register(bot_id, token)?;

    if format.is_json() {
        return print_json(&json!({
            "bot": bot.summary(),
            "account": account.as_ref().map(|user| &user.username),
        }));
    }

    println!("Bot registered: {}", bot.bot_id);
    if let Some(user) = account
        && let Some(username) = user.username
    {
        println!("Account:        @{username}");
    }
    println!("Webhook path:   {}", bot.webhook_path());
    if let Some(url) = core.config.webhook_url(&bot.path_token) {
        println!("Webhook URL:    {url}");
    }
    println!("Delivery mode:  disabled (enable polling or a webhook next)");
    Ok(())
}

fn list_bots(core: Arc<FleetCore>, format: OutputFormat) -> Result<()> {
    let bots = core.registry.list();

    if format.is_json() {
        let summaries: Vec<_> = bots.iter().map(|bot| bot.summary()).collect();
        return print_json(&summaries);
    }

    if bots.is_empty() {
        println!("No bots registered.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "Status", "Mode", "Webhook path", "Created"]);
    for bot in bots {
        let mode = core.registry.committed_mode(&bot.bot_id).unwrap_or(bot.mode);
        table.add_row(vec![
            Cell::new(&bot.bot_id),
            Cell::new(colored_status(bot.status)),
            Cell::new(colored_mode(mode)),
            Cell::new(bot.webhook_path()),
            Cell::new(format_timestamp(bot.created_at)),
        ]);
    }
    crate::output::table::print_table(table)
}

async fn start_bot(core: Arc<FleetCore>, bot_id: &str, format: OutputFormat) -> Result<()> {
    let transition = core.registry.enable_polling(bot_id).await?;
    let mode = core.registry.committed_mode(bot_id)?;

    if format.is_json() {
        return print_json(&json!({
            "bot_id": bot_id,
            "mode": mode.as_str(),
            "changed": transition.changed(),
        }));
    }

    if transition.changed() {
        println!("Polling started for {bot_id}");
    } else {
        println!("{bot_id} is already polling");
    }
    Ok(())
}

async fn stop_bot(core: Arc<FleetCore>, bot_id: &str, format: OutputFormat) -> Result<()> {
    let transition = core.registry.disable_delivery(bot_id).await?;

    if format.is_json() {
        return print_json(&json!({
            "bot_id": bot_id,
            "mode": DeliveryMode::Disabled.as_str(),
            "changed": transition.changed(),
        }));
    }

    if transition.changed() {
        println!("Delivery stopped for {bot_id}");
    } else {
        println!("{bot_id} has no delivery to stop");
    }
    Ok(())
}

async fn remove_bot(core: Arc<FleetCore>, bot_id: &str, format: OutputFormat) -> Result<()> {
    core.registry.deregister(bot_id).await?;

    if format.is_json() {
        return print_json(&json!({ "deleted": bot_id }));
    }
    println!("Bot removed: {bot_id}");
    Ok(())
}
