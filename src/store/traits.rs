//! Key/value store interface used for credentials, key material and caches.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    DatabaseError(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}

impl From<crate::crypto::CipherError> for StoreError {
    fn from(err: crate::crypto::CipherError) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A value with an optional absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredValue {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    pub fn new(value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            value: value.into(),
            expires_at: ttl.map(expiry_from_now),
        }
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

pub(crate) fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// String key/value store with per-key TTL.
///
/// A single `set`, `del` or `apply_batch` call is all-or-nothing: readers see
/// either the previous or the new state, never a partial write.
pub trait KeyValueStore: Send + Sync {
    /// Get a live value.
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store a value, replacing any previous one. `None` keeps it forever.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete a key; deleting a missing key is not an error.
    fn del(&self, key: &str) -> StoreResult<()>;

    /// Whether a live value exists.
    fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Reset the TTL of a live key. Returns false when the key is absent.
    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Live keys starting with `prefix`.
    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Apply writes (`Some`) and deletes (`None`) as one unit.
    fn apply_batch(
        &self,
        entries: &[(String, Option<String>)],
        ttl: Option<Duration>,
    ) -> StoreResult<()>;
}
