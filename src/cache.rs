//! On-disk key/value cache for idempotency bookkeeping.
//!
//! The agent remembers which schema hash it has applied and which workers
//! and tables it has already checked, so a restarted process doesn't redo
//! finished migrations. Read whole at startup, written whole on each store.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;
use tracing::warn;

use crate::error::Result;

/// Well-known cache keys.
pub const TABLE_HASH: &str = "table_hash";
pub const CHECKED_WORKERS: &str = "checked_workers";
pub const CHECKED_TABLES: &str = "checked_tables";

/// Filesystem-backed cache. A missing or unparsable file is an empty cache.
pub struct StateCache {
    path: PathBuf,
    entries: BTreeMap<String, Value>,
}

impl StateCache {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        Self { path, entries }
    }

    pub fn store(&mut self, key: &str, value: Value) -> Result<()> {
        self.entries.insert(key.to_string(), value);

        let serialized = serde_json::to_string(&self.entries)?;
        if let Err(error) = std::fs::write(&self.path, serialized) {
            warn!(path = %self.path.display(), error = %error, "cache write failed");
        }
        Ok(())
    }

    /// Stored value, or `Null` when the key was never written.
    pub fn get(&self, key: &str) -> Value {
        self.entries.get(key).cloned().unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table_hash.dat");

        let mut cache = StateCache::open(&path);
        assert_eq!(cache.get(TABLE_HASH), Value::Null);

        cache.store(TABLE_HASH, json!("abc123")).unwrap();
        cache
            .store(CHECKED_WORKERS, json!(["worker-0", "worker-1"]))
            .unwrap();

        let reopened = StateCache::open(&path);
        assert_eq!(reopened.get(TABLE_HASH), json!("abc123"));
        assert_eq!(reopened.get(CHECKED_WORKERS), json!(["worker-0", "worker-1"]));
    }

    #[test]
    fn unparsable_file_is_an_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table_hash.dat");
        std::fs::write(&path, "not-json").unwrap();

        let cache = StateCache::open(&path);
        assert_eq!(cache.get(CHECKED_TABLES), Value::Null);
    }
}
