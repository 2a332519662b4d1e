//! Inbound event bus for unsolicited reports and proprietary frames.
//!
//! The transport publishes everything it hears here; each device context
//! subscribes with a filter on its own device id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::transport::{ClusterId, EndpointId};
use crate::value::AttributeValue;

/// Default channel capacity for the inbound bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// What arrived from the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundPayload {
    /// Raw bytes received on the proprietary cluster.
    Frame { cluster: ClusterId, bytes: Vec<u8> },
    /// A typed attribute report on a native cluster.
    Attribute {
        cluster: ClusterId,
        attribute: String,
        value: AttributeValue,
    },
}

/// One unsolicited event for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub device_id: String,
    pub endpoint: EndpointId,
    pub payload: InboundPayload,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn frame(
        device_id: impl Into<String>,
        endpoint: EndpointId,
        cluster: ClusterId,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            endpoint,
            payload: InboundPayload::Frame { cluster, bytes },
            received_at: Utc::now(),
        }
    }

    pub fn attribute(
        device_id: impl Into<String>,
        endpoint: EndpointId,
        cluster: ClusterId,
        attribute: impl Into<String>,
        value: AttributeValue,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            endpoint,
            payload: InboundPayload::Attribute {
                cluster,
                attribute: attribute.into(),
                value,
            },
            received_at: Utc::now(),
        }
    }
}

/// Broadcast bus for inbound device traffic.
#[derive(Clone)]
pub struct InboundBus {
    tx: broadcast::Sender<InboundEvent>,
}

impl InboundBus {
    /// Create a new bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new bus with the specified capacity.
    ///
    /// The capacity determines how many events are buffered for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event. Returns `true` if there was at least one subscriber.
    pub fn publish(&self, event: InboundEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> InboundReceiver {
        InboundReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to the events of a single device.
    pub fn subscribe_device(&self, device_id: impl Into<String>) -> DeviceReceiver {
        DeviceReceiver {
            rx: self.tx.subscribe(),
            device_id: device_id.into(),
        }
    }
}

impl Default for InboundBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all inbound events.
pub struct InboundReceiver {
    rx: broadcast::Receiver<InboundEvent>,
}

impl InboundReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the bus is closed.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Inbound receiver lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        self.rx.try_recv().ok()
    }
}

/// Receiver for the inbound events of one device.
pub struct DeviceReceiver {
    rx: broadcast::Receiver<InboundEvent>,
    device_id: String,
}

impl DeviceReceiver {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Receive the next event for this device.
    ///
    /// Returns `None` if the bus is closed.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.device_id == self.device_id {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        device_id = %self.device_id,
                        "Device receiver lagged, {} events dropped",
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        while let Ok(event) = self.rx.try_recv() {
            if event.device_id == self.device_id {
                return Some(event);
            }
        }
        None
    }
}
