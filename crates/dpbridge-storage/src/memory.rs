//! In-memory device store.

use dashmap::DashMap;
use dpbridge_core::storage::{DeviceStore, StoreResult};
use serde_json::Value;

/// Process-local store. Values are keyed by `(device_id, key)`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<(String, String), Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values across all devices.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl DeviceStore for MemoryStore {
    fn get_value(&self, device_id: &str, key: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .values
            .get(&(device_id.to_string(), key.to_string()))
            .map(|v| v.value().clone()))
    }

    fn set_value(&self, device_id: &str, key: &str, value: Value) -> StoreResult<()> {
        self.values
            .insert((device_id.to_string(), key.to_string()), value);
        Ok(())
    }

    fn remove_value(&self, device_id: &str, key: &str) -> StoreResult<bool> {
        Ok(self
            .values
            .remove(&(device_id.to_string(), key.to_string()))
            .is_some())
    }

    fn keys(&self, device_id: &str) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|entry| entry.key().0 == device_id)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
