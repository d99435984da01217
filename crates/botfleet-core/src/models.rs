//! Core data model: bot identities, delivery modes, inbound updates, and
//! health records.

use chrono::Utc;
use rand::RngExt;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::telegram::types::TelegramUpdate;

/// Length of the derived webhook path segment.
const PATH_TOKEN_LEN: usize = 32;
/// Length of the generated webhook secret.
const WEBHOOK_SECRET_LEN: usize = 44;

/// Current wall clock in milliseconds.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Provider credential. Opaque everywhere outside the API client: `Debug`
/// and `Display` redact it, and API response types never carry it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotToken(String);

impl BotToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw credential. Only the provider client should call this.
    pub fn reveal(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for BotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BotToken(****)")
    }
}

impl fmt::Display for BotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}

/// How updates currently reach a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Disabled,
    Polling,
    Transitioning,
    Webhook,
}

impl DeliveryMode {
    /// Transitioning is a registry-internal state, never reported outward.
    pub fn is_stable(self) -> bool {
        !matches!(self, DeliveryMode::Transitioning)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMode::Disabled => "disabled",
            DeliveryMode::Polling => "polling",
            DeliveryMode::Transitioning => "transitioning",
            DeliveryMode::Webhook => "webhook",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-facing bot state, orthogonal to the delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Active,
    Paused,
    Error,
}

/// One tenant bot as persisted in the bot store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotIdentity {
    /// Stable unique ID chosen at provisioning
    pub bot_id: String,
    /// Provider credential
    pub token: BotToken,
    /// Derived webhook path segment, stable per token
    pub path_token: String,
    /// Secret expected in X-Telegram-Bot-Api-Secret-Token
    pub webhook_secret: String,
    pub status: BotStatus,
    pub mode: DeliveryMode,
    pub created_at: i64,
    pub updated_at: i64,
}

impl BotIdentity {
    /// Create a fresh identity with a derived path token and a random
    /// webhook secret. Mode starts disabled until an operator chooses one.
    pub fn provision(bot_id: impl Into<String>, token: BotToken) -> Self {
        let now = now_ms();
        Self {
            bot_id: bot_id.into(),
            path_token: derive_path_token(&token),
            webhook_secret: generate_webhook_secret(),
            token,
            status: BotStatus::Active,
            mode: DeliveryMode::Disabled,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }

    /// Webhook path for this bot, relative to the public base URL.
    pub fn webhook_path(&self) -> String {
        format!("/webhook/{}", self.path_token)
    }

    /// Credential-free view for API responses.
    pub fn summary(&self) -> BotSummary {
        BotSummary {
            bot_id: self.bot_id.clone(),
            status: self.status,
            mode: self.mode,
            webhook_path: self.webhook_path(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// What the management API exposes about a bot. No credential fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSummary {
    pub bot_id: String,
    pub status: BotStatus,
    pub mode: DeliveryMode,
    pub webhook_path: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Bot IDs are path and key material: short, no separators.
pub fn valid_bot_id(bot_id: &str) -> bool {
    !bot_id.is_empty()
        && bot_id.len() <= 64
        && bot_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn derive_path_token(token: &BotToken) -> String {
    let digest = Sha256::digest(token.reveal().as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(PATH_TOKEN_LEN);
    encoded
}

fn generate_webhook_secret() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(WEBHOOK_SECRET_LEN)
        .map(char::from)
        .collect()
}

/// Which pipeline carried an update into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPath {
    Push,
    Pull,
}

impl fmt::Display for DeliveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryPath::Push => f.write_str("push"),
            DeliveryPath::Pull => f.write_str("pull"),
        }
    }
}

/// A provider update annotated with its origin, as handed to the router.
#[derive(Debug, Clone)]
pub struct InboundUpdate {
    pub update_id: i64,
    pub bot_id: String,
    pub payload: TelegramUpdate,
    pub received_at: i64,
    pub path: DeliveryPath,
}

impl InboundUpdate {
    pub fn new(bot_id: impl Into<String>, payload: TelegramUpdate, path: DeliveryPath) -> Self {
        Self {
            update_id: payload.update_id,
            bot_id: bot_id.into(),
            payload,
            received_at: now_ms(),
            path,
        }
    }

    /// Conversation slot this update serializes on. Updates without a sender
    /// share the bot's service slot.
    pub fn slot_key(&self) -> String {
        match self.payload.sender() {
            Some(user) => slot_key(&self.bot_id, &user.id.to_string()),
            None => slot_key(&self.bot_id, "-"),
        }
    }
}

/// Composite slot key: "{bot_id}:{user_id}".
pub fn slot_key(bot_id: &str, user_part: &str) -> String {
    format!("{}:{}", bot_id, user_part)
}

/// Per-(bot, user) conversation state. The engine treats `state` as opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSlot {
    pub slot_key: String,
    pub bot_id: String,
    pub user_id: String,
    pub state: serde_json::Value,
    pub last_activity: i64,
}

impl ConversationSlot {
    pub fn new(bot_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let bot_id = bot_id.into();
        let user_id = user_id.into();
        Self {
            slot_key: slot_key(&bot_id, &user_id),
            bot_id,
            user_id,
            state: serde_json::Value::Null,
            last_activity: now_ms(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = now_ms();
    }

    pub fn is_stale(&self, max_age_ms: i64) -> bool {
        now_ms() - self.last_activity > max_age_ms
    }
}

/// Aggregated per-bot counters over one rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotHealth {
    pub bot_id: String,
    pub mode: DeliveryMode,
    pub window_start: i64,
    pub window_end: i64,
    pub received: u64,
    pub handled: u64,
    pub rejected: u64,
    pub failed: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub last_update_at: Option<i64>,
}

/// Why an alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ErrorRate,
    PollerStalled,
}

/// A threshold breach, persisted and exposed through the health API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthAlert {
    pub alert_id: Uuid,
    pub bot_id: String,
    pub kind: AlertKind,
    pub error_rate: f64,
    pub window_start: i64,
    pub window_end: i64,
    pub raised_at: i64,
    pub message: String,
}
