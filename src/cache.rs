//! Last-known value per key.
//!
//! The cache is the single source of truth consumers read from between polls.
//! Each entry carries a version that is bumped on every successful poll, even
//! when the value did not change, so staleness can be judged independently of
//! value equality.

use crate::registry::Key;
use crate::source::Value;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CacheEntry {
    pub key: Key,
    /// `None` until the first successful poll.
    pub value: Option<Value>,
    pub version: u64,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn empty(key: Key) -> Self {
        Self {
            key,
            value: None,
            version: 0,
            last_polled_at: None,
        }
    }
}

#[derive(Default)]
pub struct ValueCache {
    entries: HashMap<Key, CacheEntry>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Key) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Current value of `key`, if it has been polled at least once.
    pub fn value(&self, key: &Key) -> Option<Value> {
        self.entries.get(key).and_then(|e| e.value)
    }

    /// Overwrite the value of `key` and bump its version.
    ///
    /// Returns the new version, or `None` when the key has no entry (its last
    /// subscriber left while the read was in flight); the entry is not revived.
    pub fn update(&mut self, key: &Key, value: Value) -> Option<u64> {
        let entry = self.entries.get_mut(key)?;
        entry.value = Some(value);
        entry.version += 1;
        entry.last_polled_at = Some(Utc::now());
        Some(entry.version)
    }

    /// Create an empty entry for a newly subscribed key.
    pub(crate) fn insert(&mut self, key: Key) {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::empty(key));
    }

    /// Drop the entry for a key that lost its last subscriber.
    pub(crate) fn remove(&mut self, key: &Key) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::canonicalize;

    fn key() -> Key {
        canonicalize("L:A32NX_ELEC_BAT_1_POTENTIAL", "Volts").unwrap()
    }

    #[test]
    fn test_new_entry_is_empty() {
        let mut cache = ValueCache::new();
        cache.insert(key());
        let entry = cache.get(&key()).unwrap();
        assert_eq!(entry.value, None);
        assert_eq!(entry.version, 0);
        assert!(entry.last_polled_at.is_none());
    }

    #[test]
    fn test_update_always_bumps_version() {
        let mut cache = ValueCache::new();
        cache.insert(key());

        assert_eq!(cache.update(&key(), Value::Number(24.1)), Some(1));
        assert_eq!(cache.update(&key(), Value::Number(24.1)), Some(2));
        assert_eq!(cache.update(&key(), Value::Number(23.9)), Some(3));
        assert_eq!(cache.value(&key()), Some(Value::Number(23.9)));
        assert!(cache.get(&key()).unwrap().last_polled_at.is_some());
    }

    #[test]
    fn test_update_does_not_revive_removed_entry() {
        let mut cache = ValueCache::new();
        cache.insert(key());
        cache.remove(&key());

        assert_eq!(cache.update(&key(), Value::Number(24.1)), None);
        assert!(!cache.contains(&key()));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_keeps_existing_entry() {
        let mut cache = ValueCache::new();
        cache.insert(key());
        cache.update(&key(), Value::Number(1.0));
        cache.insert(key());
        assert_eq!(cache.get(&key()).unwrap().version, 1);
    }
}
