//! Device store implementations for dpbridge.
//!
//! - [`MemoryStore`]: process-local, lost on restart
//! - [`RedbStore`]: persistent, backed by a single redb table with an LRU
//!   read cache

pub mod error;
pub mod memory;
pub mod redb_store;

use std::sync::Arc;

use dpbridge_core::storage::{DeviceStore, StoreError, StoreResult};
use serde_json::Value;

pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use redb_store::{RedbStore, RedbStoreConfig};

/// Create a store by type identifier.
///
/// ```no_run
/// use dpbridge_storage::create_store;
/// use serde_json::json;
///
/// let store = create_store("redb", &json!({ "path": "./data/devices.redb" })).unwrap();
/// assert!(store.is_persistent());
/// ```
pub fn create_store(store_type: &str, config: &Value) -> StoreResult<Arc<dyn DeviceStore>> {
    match store_type {
        "redb" => {
            let cfg: RedbStoreConfig = serde_json::from_value(config.clone())
                .map_err(|e| StoreError::Configuration(format!("Invalid redb config: {}", e)))?;
            Ok(Arc::new(RedbStore::new(cfg)?))
        }
        "memory" => Ok(Arc::new(MemoryStore::new())),
        _ => Err(StoreError::Configuration(format!(
            "Unknown store type: {}. Available stores: {}",
            store_type,
            available_stores().join(", ")
        ))),
    }
}

/// Store types understood by [`create_store`].
pub fn available_stores() -> Vec<&'static str> {
    vec!["memory", "redb"]
}
