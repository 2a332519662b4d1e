//! Transport interface consumed by the device engine.
//!
//! The engine never assumes a transport call succeeds. Every read and
//! configure call made on behalf of a device is wrapped by the retry layer
//! in `dpbridge-devices`, which classifies [`TransportError`]s as transient
//! or fatal.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::value::AttributeValue;

/// Numeric cluster id.
pub type ClusterId = u16;

/// Device endpoint number.
pub type EndpointId = u8;

/// Transport error types.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The device did not answer in time.
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// The radio or the device reported it is busy.
    #[error("Device busy")]
    Busy,

    /// The device or network is not yet ready (still joining, sleeping).
    #[error("Not yet ready: {0}")]
    NotReady(String),

    /// The cluster or attribute is not supported by the device.
    #[error("Unsupported attribute {attribute} on cluster 0x{cluster:04X}")]
    Unsupported { cluster: ClusterId, attribute: String },

    /// The device rejected the request.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The device is no longer reachable through this transport.
    #[error("Device gone")]
    Gone,

    /// Anything else, described by the transport.
    #[error("Transport error: {0}")]
    Other(String),
}

/// Reporting configuration for one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportingSpec {
    /// Attribute name, as understood by the transport.
    pub attribute: String,
    /// Minimum interval between reports, in seconds.
    pub min_interval_secs: u16,
    /// Maximum interval between reports, in seconds.
    pub max_interval_secs: u16,
    /// Minimum change (raw units) that triggers a report.
    pub min_change: f64,
}

impl ReportingSpec {
    pub fn new(
        attribute: impl Into<String>,
        min_interval_secs: u16,
        max_interval_secs: u16,
        min_change: f64,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            min_interval_secs,
            max_interval_secs,
            min_change,
        }
    }
}

/// Attribute-cluster transport for one device.
///
/// Implementations are scoped to a single device; the engine never passes a
/// device address.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read one attribute from a cluster on an endpoint.
    async fn read_attribute(
        &self,
        endpoint: EndpointId,
        cluster: ClusterId,
        attribute: &str,
    ) -> Result<AttributeValue, TransportError>;

    /// Write one attribute on a cluster on an endpoint.
    async fn write_attribute(
        &self,
        endpoint: EndpointId,
        cluster: ClusterId,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<(), TransportError>;

    /// Ask the device to report an attribute on its own.
    async fn configure_reporting(
        &self,
        endpoint: EndpointId,
        cluster: ClusterId,
        spec: &ReportingSpec,
    ) -> Result<(), TransportError>;

    /// Send an opaque payload on a cluster (used for the proprietary
    /// DataPoint overlay).
    async fn send_frame(
        &self,
        endpoint: EndpointId,
        cluster: ClusterId,
        payload: &[u8],
    ) -> Result<(), TransportError>;
}
