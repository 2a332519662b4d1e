//! In-memory fakes for the transport and the capability sink.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dpbridge_core::{
    AttributeValue, CapabilitySink, CapabilityValue, ClusterId, EndpointId, ReportingSpec,
    SinkError, Transport, TransportError,
};
use dpbridge_devices::RetryPolicy;
use parking_lot::Mutex;

type AttrKey = (EndpointId, ClusterId, String);

fn key(endpoint: EndpointId, cluster: ClusterId, attribute: &str) -> AttrKey {
    (endpoint, cluster, attribute.to_string())
}

/// Scriptable transport. Reads of unknown attributes fail as unsupported.
#[derive(Default)]
pub struct FakeTransport {
    attributes: Mutex<HashMap<AttrKey, AttributeValue>>,
    failures: Mutex<HashMap<AttrKey, VecDeque<TransportError>>>,
    read_delay: Mutex<Option<Duration>>,
    pub reads: AtomicUsize,
    pub frames: Mutex<Vec<(EndpointId, ClusterId, Vec<u8>)>>,
    pub writes: Mutex<Vec<(EndpointId, ClusterId, String, AttributeValue)>>,
    pub reporting: Mutex<Vec<(EndpointId, ClusterId, ReportingSpec)>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, endpoint: EndpointId, cluster: ClusterId, attribute: &str, value: AttributeValue) {
        self.attributes
            .lock()
            .insert(key(endpoint, cluster, attribute), value);
    }

    pub fn remove(&self, endpoint: EndpointId, cluster: ClusterId, attribute: &str) {
        self.attributes.lock().remove(&key(endpoint, cluster, attribute));
    }

    /// Queue errors returned by the next reads of an attribute.
    pub fn fail_next(
        &self,
        endpoint: EndpointId,
        cluster: ClusterId,
        attribute: &str,
        errors: impl IntoIterator<Item = TransportError>,
    ) {
        self.failures
            .lock()
            .entry(key(endpoint, cluster, attribute))
            .or_default()
            .extend(errors);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = Some(delay);
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn sent_frames(&self) -> Vec<(EndpointId, ClusterId, Vec<u8>)> {
        self.frames.lock().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn read_attribute(
        &self,
        endpoint: EndpointId,
        cluster: ClusterId,
        attribute: &str,
    ) -> Result<AttributeValue, TransportError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let k = key(endpoint, cluster, attribute);
        if let Some(error) = self.failures.lock().get_mut(&k).and_then(|q| q.pop_front()) {
            return Err(error);
        }
        self.attributes
            .lock()
            .get(&k)
            .cloned()
            .ok_or_else(|| TransportError::Unsupported {
                cluster,
                attribute: attribute.to_string(),
            })
    }

    async fn write_attribute(
        &self,
        endpoint: EndpointId,
        cluster: ClusterId,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<(), TransportError> {
        self.writes
            .lock()
            .push((endpoint, cluster, attribute.to_string(), value));
        Ok(())
    }

    async fn configure_reporting(
        &self,
        endpoint: EndpointId,
        cluster: ClusterId,
        spec: &ReportingSpec,
    ) -> Result<(), TransportError> {
        self.reporting.lock().push((endpoint, cluster, spec.clone()));
        Ok(())
    }

    async fn send_frame(
        &self,
        endpoint: EndpointId,
        cluster: ClusterId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.frames.lock().push((endpoint, cluster, payload.to_vec()));
        Ok(())
    }
}

/// Recording capability sink.
#[derive(Default)]
pub struct FakeSink {
    capabilities: Mutex<BTreeSet<String>>,
    rejected: Mutex<BTreeSet<String>>,
    values: Mutex<Vec<(String, CapabilityValue)>>,
    fail_set: Mutex<bool>,
}

impl FakeSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_capabilities(capabilities: &[&str]) -> Arc<Self> {
        let sink = Self::default();
        sink.capabilities
            .lock()
            .extend(capabilities.iter().map(|c| c.to_string()));
        Arc::new(sink)
    }

    /// Make `add_capability` fail for a capability.
    pub fn reject(&self, capability: &str) {
        self.rejected.lock().insert(capability.to_string());
    }

    pub fn fail_sets(&self, fail: bool) {
        *self.fail_set.lock() = fail;
    }

    pub fn capabilities(&self) -> BTreeSet<String> {
        self.capabilities.lock().clone()
    }

    pub fn values(&self) -> Vec<(String, CapabilityValue)> {
        self.values.lock().clone()
    }

    pub fn last(&self, capability: &str) -> Option<CapabilityValue> {
        self.values
            .lock()
            .iter()
            .rev()
            .find(|(c, _)| c == capability)
            .map(|(_, v)| v.clone())
    }
}

#[async_trait]
impl CapabilitySink for FakeSink {
    async fn set_capability_value(
        &self,
        capability: &str,
        value: CapabilityValue,
    ) -> Result<(), SinkError> {
        if *self.fail_set.lock() {
            return Err(SinkError::Unavailable("host offline".to_string()));
        }
        self.values.lock().push((capability.to_string(), value));
        Ok(())
    }

    fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.lock().contains(capability)
    }

    async fn add_capability(&self, capability: &str) -> Result<(), SinkError> {
        if self.rejected.lock().contains(capability) {
            return Err(SinkError::Rejected {
                capability: capability.to_string(),
                reason: "not valid for this device class".to_string(),
            });
        }
        self.capabilities.lock().insert(capability.to_string());
        Ok(())
    }
}

/// Retry policy with millisecond delays.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default().with_delays(1, 5)
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
