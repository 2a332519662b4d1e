//! Capability sink exposed by the host.

use async_trait::async_trait;

use crate::value::CapabilityValue;

/// Capability sink error types.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SinkError {
    /// The host does not know this capability.
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    /// The host refused the value or the capability.
    #[error("Capability {capability} rejected: {reason}")]
    Rejected { capability: String, reason: String },

    /// The host side is unavailable (device object deleted, app shutting down).
    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// Host-side view of a device's capabilities.
///
/// The engine tolerates every method failing: failures are logged and the
/// device context keeps running.
#[async_trait]
pub trait CapabilitySink: Send + Sync {
    /// Push a new value to a capability.
    async fn set_capability_value(
        &self,
        capability: &str,
        value: CapabilityValue,
    ) -> Result<(), SinkError>;

    /// Whether the capability currently exists on the device.
    fn has_capability(&self, capability: &str) -> bool;

    /// Add a capability to the device. Only called for inferred bindings.
    async fn add_capability(&self, capability: &str) -> Result<(), SinkError>;
}
