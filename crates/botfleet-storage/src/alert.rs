//! Health alert storage - byte-level API for raised alerts.
//!
//! Keys are composite: "{raised_at:020}:{alert_id}" so iteration order is
//! chronological and pruning can compare on the key alone.

use crate::define_simple_storage;
use anyhow::Result;

define_simple_storage! {
    /// Low-level health alert storage with byte-level API
    pub struct AlertStore { table: "health_alerts" }
}

impl AlertStore {
    /// Build the chronological composite key for an alert.
    pub fn alert_key(raised_at_ms: i64, alert_id: &str) -> String {
        format!("{:020}:{}", raised_at_ms.max(0), alert_id)
    }

    /// Remove alerts raised before the cutoff. Returns the number removed.
    pub fn prune_before(&self, cutoff_ms: i64) -> Result<usize> {
        let cutoff_key = format!("{:020}", cutoff_ms.max(0));
        let stale: Vec<String> = self
            .list_raw()?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.as_str() < cutoff_key.as_str())
            .collect();

        let mut removed = 0;
        for key in &stale {
            if self.delete(key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
