//! The persistent key/value contract every limit adapter writes through.
//!
//! Values are stored as text, the same shape the SQLite `kv` table uses, and
//! decoded on read by the typed accessors.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::StoreError;

/// Key/value store holding per-feature integers, timestamps and flags.
///
/// Implementations must survive process restarts if they back a real
/// session; [`MemoryStore`] is the ephemeral variant.
pub trait StateStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set_raw(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Delete every key starting with `prefix`. Returns how many were removed.
    fn clear_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    fn get_int(&self, key: &str) -> Result<Option<u32>, StoreError> {
        decode(key, self.get_raw(key)?)
    }

    fn set_int(&self, key: &str, value: u32) -> Result<(), StoreError> {
        self.set_raw(key, &value.to_string())
    }

    fn get_i64(&self, key: &str) -> Result<Option<i64>, StoreError> {
        decode(key, self.get_raw(key)?)
    }

    fn set_i64(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.set_raw(key, &value.to_string())
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        decode(key, self.get_raw(key)?)
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        self.set_raw(key, if value { "true" } else { "false" })
    }
}

fn decode<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>, StoreError> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| StoreError::Corrupt {
                key: key.to_string(),
                value,
            }),
    }
}

/// In-process store. Used by tests and by sessions that need no persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }
}

impl StateStore for MemoryStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values().get(key).cloned())
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values().remove(key);
        Ok(())
    }

    fn clear_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut values = self.values();
        let before = values.len();
        values.retain(|k, _| !k.starts_with(prefix));
        Ok(before - values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get_int("a").unwrap(), None);
        store.set_int("a", 3).unwrap();
        store.set_i64("b", -7).unwrap();
        store.set_bool("c", true).unwrap();
        assert_eq!(store.get_int("a").unwrap(), Some(3));
        assert_eq!(store.get_i64("b").unwrap(), Some(-7));
        assert_eq!(store.get_bool("c").unwrap(), Some(true));
    }

    #[test]
    fn corrupt_value_is_reported() {
        let store = MemoryStore::new();
        store.set_raw("a", "not a number").unwrap();
        assert!(matches!(
            store.get_int("a"),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn clear_prefix_only_touches_matching_keys() {
        let store = MemoryStore::new();
        store.set_int("limits.search.usage", 1).unwrap();
        store.set_int("limits.filter.usage", 1).unwrap();
        store.set_bool("moderation.shadow_ban.active", true).unwrap();
        assert_eq!(store.clear_prefix("limits.").unwrap(), 2);
        assert_eq!(store.len(), 1);
    }
}
