//! Crate-wide error type.

use crate::sink::SinkError;
use crate::storage::StoreError;
use crate::transport::TransportError;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can cross crate boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Capability sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
