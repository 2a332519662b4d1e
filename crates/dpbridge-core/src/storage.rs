//! Per-device key-value persistence.
//!
//! The store is best-effort: callers log failures and carry on with
//! in-memory state.

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Backend error.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Key-value store scoped per device.
///
/// Values are JSON so records and cached readings share one format.
pub trait DeviceStore: Send + Sync {
    /// Read a value for a device.
    fn get_value(&self, device_id: &str, key: &str) -> StoreResult<Option<serde_json::Value>>;

    /// Write a value for a device.
    fn set_value(&self, device_id: &str, key: &str, value: serde_json::Value) -> StoreResult<()>;

    /// Delete a value. Returns whether it existed.
    fn remove_value(&self, device_id: &str, key: &str) -> StoreResult<bool>;

    /// List the keys stored for a device.
    fn keys(&self, device_id: &str) -> StoreResult<Vec<String>>;

    /// Check if this store survives restarts.
    fn is_persistent(&self) -> bool;
}
