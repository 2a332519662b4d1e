//! Core traits and types for dpbridge.
//!
//! This crate defines the value model and the narrow interfaces the device
//! engine consumes (transport, persistence) and produces (capability sink).

pub mod config;
pub mod error;
pub mod eventbus;
pub mod sink;
pub mod storage;
pub mod transport;
pub mod value;

pub use error::{Error, Result};
pub use eventbus::{
    DEFAULT_CHANNEL_CAPACITY, DeviceReceiver, InboundBus, InboundEvent, InboundPayload,
    InboundReceiver,
};
pub use sink::{CapabilitySink, SinkError};
pub use storage::{DeviceStore, StoreError, StoreResult};
pub use transport::{ClusterId, EndpointId, ReportingSpec, Transport, TransportError};
pub use value::{AttributeValue, CapabilityValue};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{clusters, defaults, env_vars};
    pub use crate::error::{Error, Result};
    pub use crate::eventbus::{InboundBus, InboundEvent, InboundPayload};
    pub use crate::sink::{CapabilitySink, SinkError};
    pub use crate::storage::{DeviceStore, StoreError};
    pub use crate::transport::{ClusterId, EndpointId, ReportingSpec, Transport, TransportError};
    pub use crate::value::{AttributeValue, CapabilityValue};
}
