//! Telegram provider integration: wire types, the [`BotApi`] seam, and the
//! reqwest client behind it.

pub mod client;
pub mod types;

pub use client::{BotApi, BotApiFactory, TelegramApi, TelegramApiFactory, check_token};
