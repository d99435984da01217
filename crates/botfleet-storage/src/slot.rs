//! Conversation slot storage - byte-level API for per-(bot, user) slot state.
//!
//! Keys are composite: "{bot_id}:{user_id}". A bot's slots can therefore be
//! listed and dropped with the prefix operations when the bot is deregistered.

use crate::define_simple_storage;

define_simple_storage! {
    /// Low-level conversation slot storage with byte-level API
    pub struct SlotStore { table: "conversation_slots" }
}
