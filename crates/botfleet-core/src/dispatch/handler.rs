//! Update handler chain.
//!
//! Handlers are evaluated in registration order; the first whose `accepts`
//! returns true processes the update. The chain always terminates because a
//! fallback handler accepting everything is registered last.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use botfleet_storage::Storage;

use crate::models::{ConversationSlot, InboundUpdate};
use crate::telegram::BotApi;

/// What a handler decided about an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerVerdict {
    /// Processed, nothing to send.
    Done,
    /// Processed; send this text back to the originating chat.
    Reply(String),
    /// Transient problem, worth another attempt.
    Retry(String),
}

/// Per-update view handed to handlers: the bot's provider client and the
/// conversation slot's opaque state.
pub struct HandlerContext {
    bot_id: String,
    slot_key: String,
    api: Arc<dyn BotApi>,
    storage: Arc<Storage>,
}

impl HandlerContext {
    pub fn new(
        bot_id: impl Into<String>,
        slot_key: impl Into<String>,
        api: Arc<dyn BotApi>,
        storage: Arc<Storage>,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            slot_key: slot_key.into(),
            api,
            storage,
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn slot_key(&self) -> &str {
        &self.slot_key
    }

    /// Provider client for outbound sends.
    pub fn api(&self) -> &dyn BotApi {
        self.api.as_ref()
    }

    /// The slot's stored state, `Null` when the slot is new.
    pub fn load_state(&self) -> anyhow::Result<serde_json::Value> {
        match self.storage.slots.get_raw(&self.slot_key)? {
            Some(data) => {
                let slot: ConversationSlot = serde_json::from_slice(&data)?;
                Ok(slot.state)
            }
            None => Ok(serde_json::Value::Null),
        }
    }

    /// Persist new slot state, refreshing the activity timestamp.
    pub fn store_state(&self, state: serde_json::Value) -> anyhow::Result<()> {
        let mut slot = match self.storage.slots.get_raw(&self.slot_key)? {
            Some(data) => serde_json::from_slice(&data)?,
            None => {
                let user_part = self
                    .slot_key
                    .split_once(':')
                    .map(|(_, user)| user)
                    .unwrap_or("-");
                ConversationSlot::new(self.bot_id.clone(), user_part)
            }
        };
        slot.state = state;
        slot.touch();
        let data = serde_json::to_vec(&slot)?;
        self.storage.slots.put_raw(&self.slot_key, &data)?;
        Ok(())
    }
}

/// One link in the chain. Registration order is evaluation order.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap, synchronous gate; the first accepting handler wins.
    fn accepts(&self, update: &InboundUpdate) -> bool;

    async fn handle(
        &self,
        cx: &HandlerContext,
        update: &InboundUpdate,
    ) -> anyhow::Result<HandlerVerdict>;
}

/// Acknowledges `/`-prefixed commands with a canned reply.
pub struct CommandAckHandler;

#[async_trait]
impl UpdateHandler for CommandAckHandler {
    fn name(&self) -> &str {
        "command_ack"
    }

    fn accepts(&self, update: &InboundUpdate) -> bool {
        update.payload.is_command()
    }

    async fn handle(
        &self,
        _cx: &HandlerContext,
        update: &InboundUpdate,
    ) -> anyhow::Result<HandlerVerdict> {
        let command = update
            .payload
            .text()
            .and_then(|text| text.split_whitespace().next())
            .unwrap_or("/");
        let reply = match command {
            "/start" => "Bot is online.".to_string(),
            other => format!("Received {other}."),
        };
        Ok(HandlerVerdict::Reply(reply))
    }
}

/// Terminal handler: accepts everything, logs, succeeds.
pub struct FallbackHandler;

#[async_trait]
impl UpdateHandler for FallbackHandler {
    fn name(&self) -> &str {
        "fallback"
    }

    fn accepts(&self, _update: &InboundUpdate) -> bool {
        true
    }

    async fn handle(
        &self,
        _cx: &HandlerContext,
        update: &InboundUpdate,
    ) -> anyhow::Result<HandlerVerdict> {
        debug!(
            bot_id = %update.bot_id,
            update_id = update.update_id,
            path = %update.path,
            "update consumed by fallback handler"
        );
        Ok(HandlerVerdict::Done)
    }
}

/// The default chain: command acknowledgment, then the catch-all.
pub fn default_chain() -> Vec<Arc<dyn UpdateHandler>> {
    vec![Arc::new(CommandAckHandler), Arc::new(FallbackHandler)]
}
