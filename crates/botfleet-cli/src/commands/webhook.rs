use anyhow::Result;
use serde_json::json;
use std::sync::Arc;

use botfleet_core::FleetCore;
use botfleet_core::dispatch::registry::ResumeMode;
use botfleet_core::models::DeliveryMode;

use crate::cli::{OutputFormat, ResumeTarget, WebhookCommands};
use crate::commands::utils::colored_mode;
use crate::output::json::print_json;

pub async fn run(
    core: Arc<FleetCore>,
    command: WebhookCommands,
    format: OutputFormat,
) -> Result<()> {
    match command {
        WebhookCommands::Enable { bot_id } => enable(core, &bot_id, format).await,
        WebhookCommands::Disable { bot_id, resume } => {
            disable(core, &bot_id, resume, format).await
        }
        WebhookCommands::Status { bot_id } => status(core, &bot_id, format).await,
    }
}

async fn enable(core: Arc<FleetCore>, bot_id: &str, format: OutputFormat) -> Result<()> {
    let transition = core.registry.enable_webhook(bot_id).await?;

    if format.is_json() {
        return print_json(&json!({
            "bot_id": bot_id,
            "mode": DeliveryMode::Webhook.as_str(),
            "changed": transition.changed(),
        }));
    }

    if transition.changed() {
        println!("Webhook enabled for {bot_id}");
        if let Ok(bot) = core.registry.get(bot_id)
            && let Some(url) = core.config.webhook_url(&bot.path_token)
        {
            println!("Registered URL: {url}");
        }
    } else {
        println!("Webhook already enabled for {bot_id}");
    }
    Ok(())
}

async fn disable(
    core: Arc<FleetCore>,
    bot_id: &str,
    resume: ResumeTarget,
    format: OutputFormat,
) -> Result<()> {
    let resume = match resume {
        ResumeTarget::Polling => ResumeMode::Polling,
        ResumeTarget::Disabled => ResumeMode::Disabled,
    };
    let transition = core.registry.disable_webhook(bot_id, resume).await?;
    let mode = core.registry.committed_mode(bot_id)?;

    if format.is_json() {
        return print_json(&json!({
            "bot_id": bot_id,
            "mode": mode.as_str(),
            "changed": transition.changed(),
        }));
    }

    if transition.changed() {
        println!("Webhook disabled for {bot_id}, now {}", colored_mode(mode));
    } else {
        println!("No webhook to disable for {bot_id}, mode is {}", colored_mode(mode));
    }
    Ok(())
}

async fn status(core: Arc<FleetCore>, bot_id: &str, format: OutputFormat) -> Result<()> {
    let bot = core.registry.get(bot_id)?;
    let mode = core.registry.committed_mode(bot_id)?;

    // Provider round-trip; delivery state is still shown when it fails.
    let provider_info = core.api_factory.api_for(&bot).webhook_info().await;

    if format.is_json() {
        return print_json(&json!({
            "bot": bot.summary(),
            "mode": mode.as_str(),
            "provider": provider_info.as_ref().ok(),
        }));
    }

    println!("Bot:            {}", bot.bot_id);
    println!("Delivery mode:  {}", colored_mode(mode));
    println!("Webhook path:   {}", bot.webhook_path());
    match provider_info {
        Ok(info) if info.url.is_empty() => {
            println!("Provider:       no webhook registered");
        }
        Ok(info) => {
            println!("Provider URL:   {}", info.url);
            println!("Pending:        {}", info.pending_update_count);
            if let Some(message) = info.last_error_message {
                println!("Last error:     {message}");
            }
        }
        Err(err) => println!("Provider state unavailable: {err}"),
    }
    Ok(())
}
