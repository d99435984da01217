//! Telegram Bot API client.
//!
//! One `TelegramApi` per bot, all sharing a single reqwest client. Everything
//! the engine needs from the provider goes through the [`BotApi`] trait so
//! the registry, poller, and executor can be exercised against a scripted
//! provider in tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::types::{
    TelegramMessageResponse, TelegramResponse, TelegramUpdate, TelegramUser, WebhookInfo,
};
use crate::models::{BotIdentity, BotToken};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org/bot";
/// Default timeout for Telegram API calls (seconds)
const API_TIMEOUT_SECS: u64 = 30;
/// Extra headroom on top of the long-poll timeout (seconds)
const POLL_TIMEOUT_HEADROOM_SECS: u64 = 10;

/// Provider operations the dispatch engine relies on.
#[async_trait]
pub trait BotApi: Send + Sync {
    /// Validate the credential and identify the bot account.
    async fn get_me(&self) -> Result<TelegramUser>;

    /// Long-poll for updates after `offset`.
    async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u32,
        limit: u32,
    ) -> Result<Vec<TelegramUpdate>>;

    /// Register the webhook endpoint with its secret token.
    async fn set_webhook(&self, url: &str, secret_token: &str) -> Result<()>;

    /// Remove any registered webhook.
    async fn delete_webhook(&self) -> Result<()>;

    /// Current webhook registration as the provider sees it.
    async fn webhook_info(&self) -> Result<WebhookInfo>;

    /// Send a plain text message.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<TelegramMessageResponse>;
}

/// reqwest-backed [`BotApi`] implementation.
pub struct TelegramApi {
    token: BotToken,
    client: Client,
}

impl TelegramApi {
    pub fn new(token: BotToken, client: Client) -> Self {
        Self { token, client }
    }

    /// Get the API URL for a method
    fn api_url(&self, method: &str) -> String {
        format!("{}{}/{}", TELEGRAM_API_BASE, self.token.reveal(), method)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<T> {
        let url = self.api_url(method);
        let response = self
            .client
            .post(&url)
            .json(&params)
            .timeout(timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            // Read provider error text without echoing the URL (it embeds the token).
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            return Err(anyhow!("Telegram HTTP error {}: {}", status, error));
        }

        let body: TelegramResponse<T> = response.json().await?;
        if body.ok {
            body.result
                .ok_or_else(|| anyhow!("Telegram returned ok but no result"))
        } else {
            Err(anyhow!(
                "Telegram API error: {}",
                body.description.unwrap_or_default()
            ))
        }
    }
}

#[async_trait]
impl BotApi for TelegramApi {
    async fn get_me(&self) -> Result<TelegramUser> {
        self.call(
            "getMe",
            serde_json::json!({}),
            Duration::from_secs(API_TIMEOUT_SECS),
        )
        .await
    }

    async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u32,
        limit: u32,
    ) -> Result<Vec<TelegramUpdate>> {
        let params = serde_json::json!({
            "offset": offset,
            "timeout": timeout_secs,
            "limit": limit,
            "allowed_updates": ["message", "edited_message", "callback_query"],
        });

        self.call(
            "getUpdates",
            params,
            Duration::from_secs(timeout_secs as u64 + POLL_TIMEOUT_HEADROOM_SECS),
        )
        .await
    }

    async fn set_webhook(&self, url: &str, secret_token: &str) -> Result<()> {
        let params = serde_json::json!({
            "url": url,
            "secret_token": secret_token,
            "allowed_updates": ["message", "edited_message", "callback_query"],
        });

        let accepted: bool = self
            .call(
                "setWebhook",
                params,
                Duration::from_secs(API_TIMEOUT_SECS),
            )
            .await?;
        if accepted {
            Ok(())
        } else {
            Err(anyhow!("Telegram rejected setWebhook"))
        }
    }

    async fn delete_webhook(&self) -> Result<()> {
        let params = serde_json::json!({
            "drop_pending_updates": false,
        });

        let accepted: bool = self
            .call(
                "deleteWebhook",
                params,
                Duration::from_secs(API_TIMEOUT_SECS),
            )
            .await?;
        if accepted {
            Ok(())
        } else {
            Err(anyhow!("Telegram rejected deleteWebhook"))
        }
    }

    async fn webhook_info(&self) -> Result<WebhookInfo> {
        self.call(
            "getWebhookInfo",
            serde_json::json!({}),
            Duration::from_secs(API_TIMEOUT_SECS),
        )
        .await
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<TelegramMessageResponse> {
        let params = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });

        self.call(
            "sendMessage",
            params,
            Duration::from_secs(API_TIMEOUT_SECS),
        )
        .await
    }
}

/// Produces a provider client for a bot. The engine is wired against this
/// seam so tests can swap in scripted providers per bot.
pub trait BotApiFactory: Send + Sync {
    fn api_for(&self, bot: &BotIdentity) -> std::sync::Arc<dyn BotApi>;
}

/// Default factory: real Telegram clients over one shared reqwest client.
#[derive(Clone, Default)]
pub struct TelegramApiFactory {
    client: Client,
}

impl TelegramApiFactory {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl BotApiFactory for TelegramApiFactory {
    fn api_for(&self, bot: &BotIdentity) -> std::sync::Arc<dyn BotApi> {
        std::sync::Arc::new(TelegramApi::new(bot.token.clone(), self.client.clone()))
    }
}

/// Validate a credential against the provider and identify its bot account.
pub async fn check_token(token: &BotToken) -> Result<TelegramUser> {
    TelegramApi::new(token.clone(), Client::new()).get_me().await
}
