//! Auth-state persistence: credentials and key material on a [`KeyValueStore`].
//!
//! Reads never fail the caller. A missing or unreadable credential set yields a
//! fresh one (which leads the transport into QR pairing); unreadable key
//! material is left out of the result. Every access refreshes the TTL so a
//! session in active use never silently expires from the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::crypto::Sealer;
use crate::store::{Credentials, KeyValueStore, StoreKeys, StoreResult};

/// Key material updates: `type -> id -> material`, `None` deletes.
pub type KeyBatch = BTreeMap<String, BTreeMap<String, Option<Value>>>;

/// Durable credential and key-material storage for one session.
pub struct AuthState {
    store: Arc<dyn KeyValueStore>,
    keys: StoreKeys,
    ttl: Duration,
    sealer: Option<Sealer>,
}

impl AuthState {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: StoreKeys,
        ttl: Duration,
        sealer: Option<Sealer>,
    ) -> Self {
        Self {
            store,
            keys,
            ttl,
            sealer,
        }
    }

    /// Stored credentials, or a freshly generated set when none are usable.
    pub fn load(&self) -> Credentials {
        let key = self.keys.credentials();
        match self.read::<Credentials>(&key) {
            Ok(Some(creds)) => {
                self.touch(&key);
                debug!(
                    "loaded credentials (noise key {}, registered: {})",
                    creds.noise_key.fingerprint(),
                    creds.is_registered()
                );
                creds
            }
            Ok(None) => {
                info!("no stored credentials, generating a fresh set");
                Credentials::generate()
            }
            Err(err) => {
                warn!("stored credentials unreadable ({err}), generating a fresh set");
                Credentials::generate()
            }
        }
    }

    /// Whether a credential set is stored (readable or not).
    pub fn has_credentials(&self) -> bool {
        self.store
            .exists(&self.keys.credentials())
            .unwrap_or(false)
    }

    pub fn save(&self, creds: &Credentials) -> StoreResult<()> {
        let key = self.keys.credentials();
        let value = self.encode(&key, creds)?;
        self.store.set(&key, &value, Some(self.ttl))
    }

    /// Material for `ids` of one key type. Ids that are missing or unreadable
    /// are absent from the result.
    pub fn get_keys(&self, kind: &str, ids: &[String]) -> HashMap<String, Value> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            let key = self.keys.key(kind, id);
            match self.read::<Value>(&key) {
                Ok(Some(value)) => {
                    self.touch(&key);
                    found.insert(id.clone(), value);
                }
                Ok(None) => {}
                Err(err) => warn!("skipping unreadable {kind} key {id}: {err}"),
            }
        }
        found
    }

    /// Write and delete key material as one batch.
    pub fn set_keys(&self, batch: &KeyBatch) -> StoreResult<()> {
        let mut entries = Vec::new();
        for (kind, ids) in batch {
            for (id, value) in ids {
                let key = self.keys.key(kind, id);
                let value = match value {
                    Some(value) => Some(self.encode(&key, value)?),
                    None => None,
                };
                entries.push((key, value));
            }
        }
        self.store.apply_batch(&entries, Some(self.ttl))
    }

    /// Remove credentials and all key material (after logout).
    pub fn clear(&self) -> StoreResult<()> {
        let mut entries: Vec<(String, Option<String>)> = self
            .store
            .keys_with_prefix(&self.keys.key_space())?
            .into_iter()
            .map(|key| (key, None))
            .collect();
        entries.push((self.keys.credentials(), None));

        info!("clearing {} stored auth entries", entries.len());
        self.store.apply_batch(&entries, None)
    }

    fn touch(&self, key: &str) {
        if let Err(err) = self.store.expire(key, self.ttl) {
            warn!("failed to refresh TTL of {key}: {err}");
        }
    }

    fn encode<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<String> {
        let json = serde_json::to_vec(value)?;
        match &self.sealer {
            Some(sealer) => Ok(sealer.seal(key, &json)?),
            None => Ok(String::from_utf8_lossy(&json).into_owned()),
        }
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let Some(raw) = self.store.get(key)? else {
            return Ok(None);
        };
        let value = match &self.sealer {
            Some(sealer) => serde_json::from_slice(&sealer.open(key, &raw)?)?,
            None => serde_json::from_str(&raw)?,
        };
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn auth(store: Arc<MemoryStore>, sealer: Option<Sealer>) -> AuthState {
        AuthState::new(
            store,
            StoreKeys::new("wa", "test"),
            Duration::from_secs(3600),
            sealer,
        )
    }

    fn batch(kind: &str, entries: &[(&str, Option<Value>)]) -> KeyBatch {
        let mut ids = BTreeMap::new();
        for (id, value) in entries {
            ids.insert(id.to_string(), value.clone());
        }
        BTreeMap::from([(kind.to_string(), ids)])
    }

    #[test]
    fn test_load_generates_when_absent() {
        let store = Arc::new(MemoryStore::new());
        let auth = auth(store.clone(), None);

        let creds = auth.load();
        assert!(!creds.is_registered());
        assert!(!auth.has_credentials());
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let store = Arc::new(MemoryStore::new());
        let auth = auth(store, None);

        let mut creds = Credentials::generate();
        creds.me = Some("5543991402403@s.whatsapp.net".into());
        creds.registered = true;
        auth.save(&creds).unwrap();

        assert!(auth.has_credentials());
        assert_eq!(auth.load(), creds);
    }

    #[test]
    fn test_unreadable_credentials_fall_back_to_fresh() {
        let store = Arc::new(MemoryStore::new());
        store.set("wa:test:creds", "{broken", None).unwrap();
        let auth = auth(store, None);

        assert!(!auth.load().is_registered());
    }

    #[test]
    fn test_sealed_values_are_not_plaintext() {
        let store = Arc::new(MemoryStore::new());
        let auth = auth(store.clone(), Some(Sealer::from_secret("secret")));
        let creds = Credentials::generate();
        auth.save(&creds).unwrap();

        let raw = store.get("wa:test:creds").unwrap().unwrap();
        assert!(!raw.contains(&creds.adv_secret_key));
        assert_eq!(auth.load(), creds);
    }

    #[test]
    fn test_keys_partial_result() {
        let store = Arc::new(MemoryStore::new());
        let auth = auth(store.clone(), None);
        auth.set_keys(&batch(
            "session",
            &[("a", Some(json!({"rk": 1}))), ("b", Some(json!({"rk": 2})))],
        ))
        .unwrap();
        store.set("wa:test:keys:session:c", "garbage{", None).unwrap();

        let ids = vec!["a".to_string(), "c".to_string(), "missing".to_string()];
        let found = auth.get_keys("session", &ids);
        assert_eq!(found.len(), 1);
        assert_eq!(found["a"], json!({"rk": 1}));
    }

    #[test]
    fn test_set_keys_none_deletes() {
        let store = Arc::new(MemoryStore::new());
        let auth = auth(store, None);
        auth.set_keys(&batch("pre-key", &[("1", Some(json!("k1")))]))
            .unwrap();
        auth.set_keys(&batch("pre-key", &[("1", None)])).unwrap();

        assert!(auth.get_keys("pre-key", &["1".to_string()]).is_empty());
    }

    #[test]
    fn test_clear_removes_both_namespaces() {
        let store = Arc::new(MemoryStore::new());
        store.set("wa:test:status", "{}", None).unwrap();
        let auth = auth(store.clone(), None);
        auth.save(&Credentials::generate()).unwrap();
        auth.set_keys(&batch("session", &[("a", Some(json!(1)))]))
            .unwrap();

        auth.clear().unwrap();

        assert!(!auth.has_credentials());
        assert!(store.keys_with_prefix("wa:test:keys:").unwrap().is_empty());
        // caches outside the auth namespaces are untouched
        assert!(store.exists("wa:test:status").unwrap());
    }
}
