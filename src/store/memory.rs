//! In-memory store implementation for development and testing.
//!
//! Nothing survives a restart; use [`FileStore`](crate::store::FileStore) for
//! sessions that must outlive the process.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;

use crate::store::{expiry_from_now, KeyValueStore, StoreError, StoreResult, StoredValue};

/// In-memory, TTL-aware key/value store.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until next write.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::DatabaseError("lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let entries = self.entries.read().map_err(poisoned)?;
        let now = Utc::now();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live_at(now))
            .map(|entry| entry.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let now = Utc::now();
        entries.retain(|_, entry| entry.is_live_at(now));
        entries.insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    fn del(&self, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let now = Utc::now();
        match entries.get_mut(key).filter(|entry| entry.is_live_at(now)) {
            Some(entry) => {
                entry.expires_at = Some(expiry_from_now(ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let entries = self.entries.read().map_err(poisoned)?;
        let now = Utc::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn apply_batch(
        &self,
        batch: &[(String, Option<String>)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        for (key, value) in batch {
            match value {
                Some(value) => {
                    entries.insert(key.clone(), StoredValue::new(value.as_str(), ttl));
                }
                None => {
                    entries.remove(key);
                }
            }
        }
        Ok(())
    }
}
