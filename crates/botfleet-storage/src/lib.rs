//! Botfleet Storage - embedded persistence for the dispatch engine
//!
//! This crate provides the persistence layer for botfleet, using redb as the
//! embedded database. It exposes byte-level APIs; the engine crate owns the
//! typed models and their serialization.
//!
//! # Tables
//!
//! Primary database (`botfleet.db`):
//!
//! - `bots` - Bot identity records, keyed by bot ID
//! - `conversation_slots` - Per-(bot, user) slot state, keyed "{bot_id}:{user_id}"
//! - `health_alerts` - Raised alerts, keyed "{raised_at:020}:{alert_id}"
//!
//! Secondary database (`health.db`, see [`HealthStore`]):
//!
//! - `bot_health_windows` - Rolling window snapshots, keyed "{bot_id}:{window_end:020}"

pub mod alert;
pub mod bot;
pub mod health;
pub mod simple_storage;
pub mod slot;

use anyhow::Result;
use redb::Database;
use std::sync::Arc;

pub use alert::AlertStore;
pub use bot::BotStore;
pub use health::HealthStore;
pub use simple_storage::SimpleStorage;
pub use slot::SlotStore;

/// Central storage manager that initializes all primary-database stores.
pub struct Storage {
    db: Arc<Database>,
    pub bots: BotStore,
    pub slots: SlotStore,
    pub alerts: AlertStore,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will create the database file if it doesn't exist and initialize
    /// all required tables.
    pub fn new(path: &str) -> Result<Self> {
        let db = Arc::new(Database::create(path)?);

        let bots = BotStore::new(db.clone())?;
        let slots = SlotStore::new(db.clone())?;
        let alerts = AlertStore::new(db.clone())?;

        Ok(Self {
            db,
            bots,
            slots,
            alerts,
        })
    }

    /// Get a reference to the underlying database
    pub fn get_db(&self) -> Arc<Database> {
        self.db.clone()
    }
}
