//! Bot identity storage - byte-level API for bot records.
//!
//! Keys are bot IDs. Values are serialized bot identity records; the engine
//! layer owns the typed model and the serialization.

use crate::define_simple_storage;

define_simple_storage! {
    /// Low-level bot identity storage with byte-level API
    pub struct BotStore { table: "bots" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::Database;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_put_and_get_raw() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Arc::new(Database::create(db_path).unwrap());
        let storage = BotStore::new(db).unwrap();

        let data = br#"{"bot_id":"support-bot"}"#;
        storage.put_raw("support-bot", data).unwrap();

        let retrieved = storage.get_raw("support-bot").unwrap();
        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap(), data);
    }

    #[test]
    fn test_overwrite_keeps_single_record() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Arc::new(Database::create(db_path).unwrap());
        let storage = BotStore::new(db).unwrap();

        storage.put_raw("support-bot", b"v1").unwrap();
        storage.put_raw("support-bot", b"v2").unwrap();

        assert_eq!(storage.count().unwrap(), 1);
        assert_eq!(storage.get_raw("support-bot").unwrap().unwrap(), b"v2");
    }

    #[test]
    fn test_delete() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Arc::new(Database::create(db_path).unwrap());
        let storage = BotStore::new(db).unwrap();

        storage.put_raw("support-bot", b"data").unwrap();

        let deleted = storage.delete("support-bot").unwrap();
        assert!(deleted);

        let retrieved = storage.get_raw("support-bot").unwrap();
        assert!(retrieved.is_none());
    }
}
