use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::sync::Arc;

/// Trait for simple key-value storage modules.
///
/// Provides default implementations for common CRUD operations plus prefix
/// scans for composite keys ("{bot_id}:{suffix}"). Implementors only need to
/// specify the table definition and database reference.
pub trait SimpleStorage: Send + Sync {
    /// The table definition for this storage type.
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]>;

    /// Get reference to the database.
    fn db(&self) -> &Arc<Database>;

    /// Store raw bytes by key.
    fn put_raw(&self, key: &str, data: &[u8]) -> Result<()> {
        let write_txn = self.db().begin_write()?;
        {
            let mut table = write_txn.open_table(Self::TABLE)?;
            table.insert(key, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get raw bytes by key.
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;

        if let Some(value) = table.get(key)? {
            Ok(Some(value.value().to_vec()))
        } else {
            Ok(None)
        }
    }

    /// List all entries as (key, data) pairs.
    fn list_raw(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;

        let mut items = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            items.push((key.value().to_string(), value.value().to_vec()));
        }

        Ok(items)
    }

    /// List entries whose key starts with the given prefix.
    fn list_prefix_raw(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;

        let mut items = Vec::new();
        for item in table.range(prefix..)? {
            let (key, value) = item?;
            let key = key.value().to_string();
            if !key.starts_with(prefix) {
                break;
            }
            items.push((key, value.value().to_vec()));
        }

        Ok(items)
    }

    /// Delete by key, returns true if it existed.
    fn delete(&self, key: &str) -> Result<bool> {
        let write_txn = self.db().begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(Self::TABLE)?;
            table.remove(key)?.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Delete every entry whose key starts with the given prefix.
    /// Returns the number of removed entries.
    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys: Vec<String> = self
            .list_prefix_raw(prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        let write_txn = self.db().begin_write()?;
        let mut removed = 0;
        {
            let mut table = write_txn.open_table(Self::TABLE)?;
            for key in &keys {
                if table.remove(key.as_str())?.is_some() {
                    removed += 1;
                }
            }
        }
        write_txn.commit()?;
        Ok(removed)
    }

    /// Check if a key exists.
    fn exists(&self, key: &str) -> Result<bool> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;
        Ok(table.get(key)?.is_some())
    }

    /// Count all entries.
    fn count(&self) -> Result<usize> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;
        Ok(table.len()? as usize)
    }
}

/// Macro to generate a simple storage struct with common implementations.
#[macro_export]
macro_rules! define_simple_storage {
    ( $(#[$meta:meta])* $vis:vis struct $name:ident { table: $table_name:literal } ) => {
        const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> =
            redb::TableDefinition::new($table_name);

        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            db: std::sync::Arc<redb::Database>,
        }

        impl $name {
            pub fn new(db: std::sync::Arc<redb::Database>) -> anyhow::Result<Self> {
                let write_txn = db.begin_write()?;
                write_txn.open_table(TABLE)?;
                write_txn.commit()?;

                Ok(Self { db })
            }

            pub fn put_raw(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
                <Self as $crate::SimpleStorage>::put_raw(self, key, data)
            }

            pub fn get_raw(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
                <Self as $crate::SimpleStorage>::get_raw(self, key)
            }

            pub fn list_raw(&self) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
                <Self as $crate::SimpleStorage>::list_raw(self)
            }

            pub fn list_prefix_raw(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
                <Self as $crate::SimpleStorage>::list_prefix_raw(self, prefix)
            }

            pub fn delete(&self, key: &str) -> anyhow::Result<bool> {
                <Self as $crate::SimpleStorage>::delete(self, key)
            }

            pub fn delete_prefix(&self, prefix: &str) -> anyhow::Result<usize> {
                <Self as $crate::SimpleStorage>::delete_prefix(self, prefix)
            }

            pub fn exists(&self, key: &str) -> anyhow::Result<bool> {
                <Self as $crate::SimpleStorage>::exists(self, key)
            }

            pub fn count(&self) -> anyhow::Result<usize> {
                <Self as $crate::SimpleStorage>::count(self)
            }
        }

        impl $crate::SimpleStorage for $name {
            const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> = TABLE;

            fn db(&self) -> &std::sync::Arc<redb::Database> {
                &self.db
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    define_simple_storage! {
        /// Scratch storage for trait-level tests
        struct ScratchStorage { table: "scratch" }
    }

    fn open_scratch() -> (tempfile::TempDir, ScratchStorage) {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Arc::new(Database::create(db_path).unwrap());
        let storage = ScratchStorage::new(db).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_list_prefix_raw_stops_at_prefix_boundary() {
        let (_dir, storage) = open_scratch();

        storage.put_raw("bot-a:1", b"a1").unwrap();
        storage.put_raw("bot-a:2", b"a2").unwrap();
        storage.put_raw("bot-b:1", b"b1").unwrap();

        let items = storage.list_prefix_raw("bot-a:").unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|(k, _)| k.starts_with("bot-a:")));
    }

    #[test]
    fn test_delete_prefix_removes_only_matching_keys() {
        let (_dir, storage) = open_scratch();

        storage.put_raw("bot-a:1", b"a1").unwrap();
        storage.put_raw("bot-a:2", b"a2").unwrap();
        storage.put_raw("bot-b:1", b"b1").unwrap();

        let removed = storage.delete_prefix("bot-a:").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(storage.count().unwrap(), 1);
        assert!(storage.exists("bot-b:1").unwrap());
    }
}
