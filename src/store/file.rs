//! Durable key/value store backed by a single JSON file.
//!
//! Every mutation writes the whole map to a sibling temp file and renames it
//! over the original, so a crash leaves either the old or the new file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::store::{expiry_from_now, KeyValueStore, StoreError, StoreResult, StoredValue};

/// JSON-file key/value store that survives restarts.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, StoredValue>>,
}

impl FileStore {
    /// Open (or create on first write) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        log::debug!("opened store {} ({} entries)", path.display(), entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `mutate` to a copy of the map, persist it, then commit in memory.
    fn update<R>(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<String, StoredValue>) -> R,
    ) -> StoreResult<R> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::DatabaseError("lock poisoned".to_string()))?;

        let mut next = entries.clone();
        let now = Utc::now();
        next.retain(|_, entry| entry.is_live_at(now));
        let result = mutate(&mut next);

        self.persist(&next)?;
        *entries = next;
        Ok(result)
    }

    fn persist(&self, entries: &BTreeMap<String, StoredValue>) -> StoreResult<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let tmp = self.temp_path();
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// `<path>.tmp`; never the store file itself, whatever its extension.
    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn read<R>(&self, read: impl FnOnce(&BTreeMap<String, StoredValue>) -> R) -> StoreResult<R> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::DatabaseError("lock poisoned".to_string()))?;
        Ok(read(&entries))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Utc::now();
        self.read(|entries| {
            entries
                .get(key)
                .filter(|entry| entry.is_live_at(now))
                .map(|entry| entry.value.clone())
        })
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.update(|entries| {
            entries.insert(key.to_string(), StoredValue::new(value, ttl));
        })
    }

    fn del(&self, key: &str) -> StoreResult<()> {
        if !self.read(|entries| entries.contains_key(key))? {
            return Ok(());
        }
        self.update(|entries| {
            entries.remove(key);
        })
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        if !self.exists(key)? {
            return Ok(false);
        }
        self.update(|entries| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(expiry_from_now(ttl));
                true
            }
            None => false,
        })
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Utc::now();
        self.read(|entries| {
            entries
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .filter(|(_, entry)| entry.is_live_at(now))
                .map(|(key, _)| key.clone())
                .collect()
        })
    }

    fn apply_batch(
        &self,
        batch: &[(String, Option<String>)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.update(|entries| {
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
        })
    }
}
