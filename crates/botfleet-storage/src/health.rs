//! Windowed health snapshot storage.
//!
//! Lives in its own database file, separate from the primary store: snapshot
//! rows are high-churn operational data and losing them must never endanger
//! bot records or slot state. Keys are composite "{bot_id}:{window_end:020}"
//! so per-bot scans are prefix ranges and the newest row sorts last.

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

const HEALTH_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("bot_health_windows");

/// Storage for per-bot health window snapshots.
#[derive(Debug, Clone)]
pub struct HealthStore {
    db: Arc<Database>,
}

impl HealthStore {
    /// Open or create the health database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Arc::new(Database::create(path)?);
        let write_txn = db.begin_write()?;
        write_txn.open_table(HEALTH_TABLE)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    fn window_key(bot_id: &str, window_end_ms: i64) -> String {
        format!("{}:{:020}", bot_id, window_end_ms.max(0))
    }

    /// Append one snapshot row for a bot's window.
    pub fn append(&self, bot_id: &str, window_end_ms: i64, data: &[u8]) -> Result<()> {
        let key = Self::window_key(bot_id, window_end_ms);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(HEALTH_TABLE)?;
            table.insert(key.as_str(), data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// List all snapshot rows for a bot, oldest first.
    pub fn list_for_bot(&self, bot_id: &str) -> Result<Vec<(i64, Vec<u8>)>> {
        let prefix = format!("{bot_id}:");
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HEALTH_TABLE)?;

        let mut rows = Vec::new();
        for item in table.range(prefix.as_str()..)? {
            let (key, value) = item?;
            let key_str = key.value();
            if !key_str.starts_with(&prefix) {
                break;
            }
            let Some((_, end_part)) = key_str.rsplit_once(':') else {
                continue;
            };
            let window_end: i64 = end_part.parse().unwrap_or_default();
            rows.push((window_end, value.value().to_vec()));
        }

        Ok(rows)
    }

    /// Most recent snapshot row for a bot, if any.
    pub fn latest_for_bot(&self, bot_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.list_for_bot(bot_id)?.pop().map(|(_, data)| data))
    }

    /// Remove rows whose window ended before the cutoff.
    /// Returns the number of removed rows.
    pub fn prune_before(&self, cutoff_ms: i64) -> Result<usize> {
        let stale: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(HEALTH_TABLE)?;

            let mut keys = Vec::new();
            for item in table.iter()? {
                let (key, _) = item?;
                let key_str = key.value();
                let Some((_, end_part)) = key_str.rsplit_once(':') else {
                    warn!(key = key_str, "health row with malformed key, skipping");
                    continue;
                };
                let window_end: i64 = end_part.parse().unwrap_or(i64::MAX);
                if window_end < cutoff_ms {
                    keys.push(key_str.to_string());
                }
            }
            keys
        };

        let write_txn = self.db.begin_write()?;
        let mut removed = 0;
        {
            let mut table = write_txn.open_table(HEALTH_TABLE)?;
            for key in &stale {
                if table.remove(key.as_str())?.is_some() {
                    removed += 1;
                }
            }
        }
        write_txn.commit()?;
        Ok(removed)
    }

    /// Total number of stored rows.
    pub fn count(&self) -> Result<usize> {
        use redb::ReadableTableMetadata;
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HEALTH_TABLE)?;
        Ok(table.len()? as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, HealthStore) {
        let temp_dir = tempdir().unwrap();
        let store = HealthStore::open(&temp_dir.path().join("health.db")).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_list_for_bot_is_chronological_and_scoped() {
        let (_dir, store) = open_store();

        store.append("support-bot", 2_000, b"w2").unwrap();
        store.append("support-bot", 1_000, b"w1").unwrap();
        store.append("sales-bot", 1_500, b"other").unwrap();

        let rows = store.list_for_bot("support-bot").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], (1_000, b"w1".to_vec()));
        assert_eq!(rows[1], (2_000, b"w2".to_vec()));
    }

    #[test]
    fn test_latest_for_bot() {
        let (_dir, store) = open_store();

        store.append("support-bot", 1_000, b"w1").unwrap();
        store.append("support-bot", 3_000, b"w3").unwrap();

        let latest = store.latest_for_bot("support-bot").unwrap();
        assert_eq!(latest.unwrap(), b"w3");
        assert!(store.latest_for_bot("missing-bot").unwrap().is_none());
    }

    #[test]
    fn test_prune_before() {
        let (_dir, store) = open_store();

        store.append("support-bot", 1_000, b"old").unwrap();
        store.append("support-bot", 5_000, b"fresh").unwrap();
        store.append("sales-bot", 500, b"older").unwrap();

        let removed = store.prune_before(2_000).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.list_for_bot("support-bot").unwrap().len(), 1);
    }
}
