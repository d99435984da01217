//! Telegram Bot API wire types.
//!
//! Only the fields the engine actually reads are modeled; everything else the
//! provider sends is tolerated and dropped by serde. Payloads are passed to
//! handlers as-is, so handler chains can still reach the modeled fields
//! without re-parsing.

use serde::{Deserialize, Serialize};

/// Envelope every Bot API method call returns.
#[derive(Debug, Deserialize)]
pub struct TelegramResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
}

/// One update from getUpdates or a webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<TelegramMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_message: Option<TelegramMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_query: Option<TelegramCallbackQuery>,
}

impl TelegramUpdate {
    /// The human behind the update, when one is attached.
    pub fn sender(&self) -> Option<&TelegramUser> {
        if let Some(message) = &self.message {
            return message.from.as_ref();
        }
        if let Some(edited) = &self.edited_message {
            return edited.from.as_ref();
        }
        self.callback_query.as_ref().map(|query| &query.from)
    }

    /// Chat the update belongs to, for outbound replies.
    pub fn chat_id(&self) -> Option<i64> {
        if let Some(message) = &self.message {
            return Some(message.chat.id);
        }
        if let Some(edited) = &self.edited_message {
            return Some(edited.chat.id);
        }
        self.callback_query
            .as_ref()
            .and_then(|query| query.message.as_ref())
            .map(|message| message.chat.id)
    }

    /// Text content: message text, edited text, or callback data.
    pub fn text(&self) -> Option<&str> {
        if let Some(message) = &self.message {
            if let Some(text) = &message.text {
                return Some(text);
            }
        }
        if let Some(edited) = &self.edited_message {
            if let Some(text) = &edited.text {
                return Some(text);
            }
        }
        self.callback_query
            .as_ref()
            .and_then(|query| query.data.as_deref())
    }

    /// Whether the update carries a bot command ("/start", "/help", ...).
    pub fn is_command(&self) -> bool {
        self.text().is_some_and(|text| text.starts_with('/'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    #[serde(default)]
    pub date: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub is_bot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<TelegramMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Result of sendMessage, trimmed to what callers inspect.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessageResponse {
    pub message_id: i64,
}

/// getWebhookInfo result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookInfo {
    pub url: String,
    #[serde(default)]
    pub pending_update_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
}
