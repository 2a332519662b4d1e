//! Redb device store.
//!
//! Provides persistent storage using the redb embedded database.

use std::num::NonZeroUsize;
use std::path::Path;

use dpbridge_core::storage::{DeviceStore, StoreResult};
use lru::LruCache;
use parking_lot::Mutex;
use redb::{Database, TableDefinition};
use serde_json::Value;

use crate::error::Result;

// Single table for all devices, keyed by (device_id, key).
const DEVICE_TABLE: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("device_store");

// Default cache capacity - number of entries
const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Configuration for [`RedbStore`].
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct RedbStoreConfig {
    /// Path to the database file.
    pub path: String,

    /// Create parent directories if they don't exist.
    #[serde(default = "default_create_dirs")]
    pub create_dirs: bool,

    /// LRU cache capacity (number of entries). 0 to disable caching.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_create_dirs() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

impl RedbStoreConfig {
    /// Create a new config with the given path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            create_dirs: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }

    /// Set whether to create parent directories.
    pub fn with_create_dirs(mut self, create_dirs: bool) -> Self {
        self.create_dirs = create_dirs;
        self
    }

    /// Set the cache capacity.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }
}

type CacheKey = (String, String);

fn cache_key(device_id: &str, key: &str) -> CacheKey {
    (device_id.to_string(), key.to_string())
}

/// redb-backed device store with an optional LRU read cache.
pub struct RedbStore {
    db: Database,
    path: String,
    cache: Option<Mutex<LruCache<CacheKey, Value>>>,
}

impl RedbStore {
    /// Open or create a store with the given configuration.
    pub fn new(config: RedbStoreConfig) -> Result<Self> {
        let path = Path::new(&config.path);
        if config.create_dirs {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let db = Database::create(path)?;

        // Make sure the table exists so read transactions never miss it.
        let txn = db.begin_write()?;
        txn.open_table(DEVICE_TABLE)?;
        txn.commit()?;

        let cache = NonZeroUsize::new(config.cache_capacity).map(|cap| Mutex::new(LruCache::new(cap)));

        tracing::debug!("Opened device store at {}", config.path);
        Ok(Self {
            db,
            path: config.path,
            cache,
        })
    }

    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(RedbStoreConfig::new(
            path.as_ref().to_string_lossy().to_string(),
        ))
    }

    /// Get the storage path.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn write(&self, device_id: &str, key: &str, value: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(DEVICE_TABLE)?;
            t.insert((device_id, key), bytes.as_slice())?;
        }
        txn.commit()?;

        if let Some(cache) = &self.cache {
            cache.lock().put(cache_key(device_id, key), value.clone());
        }
        Ok(())
    }

    fn read(&self, device_id: &str, key: &str) -> Result<Option<Value>> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.lock().get(&cache_key(device_id, key)) {
                return Ok(Some(cached.clone()));
            }
        }

        let txn = self.db.begin_read()?;
        let t = txn.open_table(DEVICE_TABLE)?;
        let value = match t.get((device_id, key))? {
            Some(guard) => Some(serde_json::from_slice::<Value>(guard.value())?),
            None => None,
        };

        if let (Some(cache), Some(value)) = (&self.cache, &value) {
            cache.lock().put(cache_key(device_id, key), value.clone());
        }
        Ok(value)
    }

    fn delete(&self, device_id: &str, key: &str) -> Result<bool> {
        if let Some(cache) = &self.cache {
            cache.lock().pop(&cache_key(device_id, key));
        }

        let txn = self.db.begin_write()?;
        let removed = {
            let mut t = txn.open_table(DEVICE_TABLE)?;
            let removed = t.remove((device_id, key))?.is_some();
            removed
        };
        txn.commit()?;
        Ok(removed)
    }

    fn scan(&self, device_id: &str) -> Result<Vec<String>> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(DEVICE_TABLE)?;

        let mut keys = Vec::new();
        for item in t.range((device_id, "")..)? {
            let (entry, _) = item?;
            let (owner, key) = entry.value();
            if owner != device_id {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}

impl DeviceStore for RedbStore {
    fn get_value(&self, device_id: &str, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.read(device_id, key)?)
    }

    fn set_value(&self, device_id: &str, key: &str, value: Value) -> StoreResult<()> {
        Ok(self.write(device_id, key, &value)?)
    }

    fn remove_value(&self, device_id: &str, key: &str) -> StoreResult<bool> {
        Ok(self.delete(device_id, key)?)
    }

    fn keys(&self, device_id: &str) -> StoreResult<Vec<String>> {
        Ok(self.scan(device_id)?)
    }

    fn is_persistent(&self) -> bool {
        true
    }
}
