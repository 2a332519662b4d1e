//! Per-device runtime context.
//!
//! A [`DeviceContext`] owns everything the engine keeps for one attached
//! device: identity, protocol decision, binding registry, enrichment
//! scanner, report cache and background tasks. All failures towards the
//! host are non-fatal; each public operation documents what it does when a
//! collaborator fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dpbridge_core::config::clusters;
use dpbridge_core::{
    AttributeValue, CapabilitySink, CapabilityValue, DeviceStore, InboundBus, InboundEvent,
    InboundPayload, Transport, TransportError,
};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::binding::{BindingRegistry, CapabilityBinding, Resolution, SourceKey};
use crate::classifier::{Classifier, Protocol, ProtocolDecision};
use crate::codec::{self, DpType, DpValue, EncodeError};
use crate::commands::{query_frame, time_sync_frame, Envelope, SequenceCounter};
use crate::config::EngineConfig;
use crate::enrichment::{EnrichmentScanner, ScanEnv, ScanError, ScanReport, TrustPolicy};
use crate::ias_zone::{ZoneStatus, ZONE_STATUS_ATTRIBUTE};
use crate::identity::DeviceIdentity;
use crate::profiles::{derived_sources, DeviceProfile};
use crate::resilience::{
    read_with_fallback, with_retry, FailureReason, FallbackChain, FallbackSource, Liveness,
    OperationOutcome,
};
use crate::role::DeviceRole;

/// Store key of the "overlay traffic seen" flag.
pub const OVERLAY_SEEN_KEY: &str = "overlay.seen";

/// Store key prefix of last known-good capability values.
pub const LAST_KNOWN_GOOD_PREFIX: &str = "lkg.";

/// Device operation error types.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("Device already attached: {0}")]
    AlreadyAttached(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device detached")]
    Detached,

    #[error("No binding for capability {0}")]
    UnknownCapability(String),

    #[error("Capability {0} is read-only")]
    NotWritable(String),

    #[error("Value {value} cannot be written to {capability}")]
    InvalidValue { capability: String, value: String },

    #[error("Overlay protocol not in use")]
    OverlayInactive,

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Operation failed: {0}")]
    Failed(#[from] FailureReason),
}

/// External collaborators of a device.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub sink: Arc<dyn CapabilitySink>,
    pub store: Option<Arc<dyn DeviceStore>>,
}

impl Collaborators {
    pub fn new(transport: Arc<dyn Transport>, sink: Arc<dyn CapabilitySink>) -> Self {
        Self {
            transport,
            sink,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn DeviceStore>) -> Self {
        self.store = Some(store);
        self
    }
}

/// Last value reported for a capability.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedReport {
    pub value: CapabilityValue,
    pub at: Instant,
    /// Came from a native attribute report rather than an overlay frame.
    pub native: bool,
}

/// What happened to one inbound event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleReport {
    /// Values pushed to the host.
    pub applied: usize,
    /// Values dropped by hybrid arbitration or the sanity guard.
    pub suppressed: usize,
    /// Unbound sources, non-finite values and sink failures.
    pub ignored: usize,
    pub decode_errors: usize,
}

/// Runtime state of one attached device.
pub struct DeviceContext {
    device_id: String,
    profile: DeviceProfile,
    config: EngineConfig,
    classifier: Classifier,
    identity: RwLock<DeviceIdentity>,
    decision: RwLock<ProtocolDecision>,
    registry: BindingRegistry,
    scanner: EnrichmentScanner,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn CapabilitySink>,
    store: Option<Arc<dyn DeviceStore>>,
    liveness: Liveness,
    reports: Mutex<HashMap<String, CachedReport>>,
    seq: SequenceCounter,
    overlay_seen: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceContext {
    /// Build the context for a freshly attached device.
    ///
    /// Installs the profile's declared bindings, classifies the device and
    /// restores the enrichment record. Store failures are logged and treated
    /// as an empty store.
    pub fn attach(
        device_id: impl Into<String>,
        identity: DeviceIdentity,
        profile: DeviceProfile,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Arc<Self> {
        let device_id = device_id.into();
        let ambiguity = profile
            .ambiguity
            .clone()
            .unwrap_or_else(|| config.ambiguity.clone());
        let registry = BindingRegistry::new(device_id.clone())
            .with_declared_capabilities(profile.capabilities.iter().cloned())
            .with_ambiguity(ambiguity);
        for binding in &profile.bindings {
            if let Err(e) = registry.insert(binding.clone()) {
                warn!(device_id = %device_id, "Profile binding rejected: {}", e);
            }
        }

        let store = collaborators.store;
        let overlay_seen = store
            .as_deref()
            .and_then(|store| load_value::<bool>(store, &device_id, OVERLAY_SEEN_KEY))
            .unwrap_or(false);

        let classifier = Classifier::new(config.classifier.clone());
        let decision = classifier.classify_with_session(&identity, overlay_seen);

        let scanner = EnrichmentScanner::new(
            device_id.clone(),
            profile.role,
            TrustPolicy::for_tier(profile.trust),
        );
        if let Err(e) = scanner.restore(&registry, store.as_deref()) {
            warn!(device_id = %device_id, "Enrichment record not restored: {}", e);
        }

        info!(
            device_id = %device_id,
            vendor = identity.vendor(),
            model = identity.model(),
            "Attached as {} ({}), protocol {}{}",
            profile.name,
            profile.role,
            decision.protocol,
            if decision.passive { ", passive" } else { "" }
        );

        Arc::new(Self {
            device_id,
            profile,
            config,
            classifier,
            identity: RwLock::new(identity),
            decision: RwLock::new(decision),
            registry,
            scanner,
            transport: collaborators.transport,
            sink: collaborators.sink,
            store,
            liveness: Liveness::new(),
            reports: Mutex::new(HashMap::new()),
            seq: SequenceCounter::new(),
            overlay_seen: AtomicBool::new(overlay_seen),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn decision(&self) -> ProtocolDecision {
        *self.decision.read()
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity.read().clone()
    }

    pub fn registry(&self) -> &BindingRegistry {
        &self.registry
    }

    pub fn scanner(&self) -> &EnrichmentScanner {
        &self.scanner
    }

    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// Last cached report for a capability, regardless of age.
    pub fn cached(&self, capability: &str) -> Option<CachedReport> {
        self.reports.lock().get(capability).cloned()
    }

    /// Spawn the inbound listener, the overlay clock task and, when enabled,
    /// the scan schedule.
    ///
    /// Overlay and hybrid devices get a time sync right away, a query for
    /// each configured start-up DataPoint after a short delay, and a clock
    /// resync every `overlay.time_sync_interval_secs`. Tasks hold a weak
    /// reference, so dropping the last `Arc` also ends them.
    pub fn start(self: &Arc<Self>, bus: &InboundBus) {
        let mut handles = Vec::with_capacity(3);

        let mut rx = bus.subscribe_device(self.device_id.clone());
        let weak: Weak<Self> = Arc::downgrade(self);
        handles.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(ctx) = weak.upgrade() else { break };
                if !ctx.is_alive() {
                    break;
                }
                ctx.handle_event(&event).await;
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        let overlay = self.config.overlay.clone();
        let startup = self.decision().uses_overlay();
        handles.push(tokio::spawn(async move {
            if startup {
                let Some(ctx) = weak.upgrade() else { return };
                if let Err(e) = ctx.sync_time().await {
                    debug!(device_id = %ctx.device_id, "Start-up time sync failed: {}", e);
                }
                drop(ctx);

                tokio::time::sleep(Duration::from_secs(overlay.startup_query_delay_secs)).await;
                let Some(ctx) = weak.upgrade() else { return };
                ctx.query_data_points(&overlay.startup_queries).await;
            }

            if overlay.time_sync_interval_secs == 0 {
                return;
            }
            let period = Duration::from_secs(overlay.time_sync_interval_secs);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(ctx) = weak.upgrade() else { break };
                if !ctx.is_alive() {
                    break;
                }
                match ctx.sync_time().await {
                    Ok(()) | Err(DeviceError::OverlayInactive) => {}
                    Err(e) => debug!(device_id = %ctx.device_id, "Time resync failed: {}", e),
                }
            }
        }));

        if self.config.scan.enabled {
            let weak: Weak<Self> = Arc::downgrade(self);
            let initial_delay = Duration::from_secs(self.config.scan.initial_delay_secs);
            let period = Duration::from_secs(self.config.scan.interval_secs.max(1));
            handles.push(tokio::spawn(async move {
                let start = tokio::time::Instant::now() + initial_delay;
                let mut ticker = tokio::time::interval_at(start, period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let Some(ctx) = weak.upgrade() else { break };
                    match ctx.run_scan().await {
                        Ok(report) => {
                            if report.interrupted {
                                break;
                            }
                        }
                        Err(ScanError::Stopped) => break,
                        Err(e) => debug!(device_id = %ctx.device_id, "Scheduled scan skipped: {}", e),
                    }
                }
            }));
        }

        self.tasks.lock().extend(handles);
        debug!(device_id = %self.device_id, "Device tasks started");
    }

    /// Process one inbound event.
    ///
    /// Malformed frames are logged and skipped; the rest of the batch is
    /// still applied. Sink failures are logged and leave the host value
    /// unchanged.
    pub async fn handle_event(&self, event: &InboundEvent) -> HandleReport {
        let mut report = HandleReport::default();
        if !self.is_alive() || event.device_id != self.device_id {
            return report;
        }

        match &event.payload {
            InboundPayload::Frame { cluster, bytes } => {
                if !self.config.classifier.proprietary_clusters.contains(cluster) {
                    debug!(
                        device_id = %self.device_id,
                        cluster = *cluster,
                        "Ignoring frame on non-proprietary cluster"
                    );
                    return report;
                }
                self.note_overlay_traffic();

                let decoded = codec::decode(bytes);
                for error in &decoded.errors {
                    warn!(device_id = %self.device_id, "Malformed DataPoint frame: {}", error);
                }
                report.decode_errors = decoded.errors.len();

                for frame in decoded.frames {
                    let key = SourceKey::dp(frame.id);
                    self.apply(&key, &frame.value.to_attribute(), false, &mut report)
                        .await;
                }
            }
            InboundPayload::Attribute {
                cluster,
                attribute,
                value,
            } => {
                if *cluster == clusters::IAS_ZONE && attribute == ZONE_STATUS_ATTRIBUTE {
                    self.apply_zone_status(value, &mut report).await;
                }
                let key = SourceKey::attribute(event.endpoint, *cluster, attribute.clone());
                self.apply(&key, value, true, &mut report).await;
            }
        }
        report
    }

    /// First overlay frame on a device classified native: remember it and
    /// reclassify.
    fn note_overlay_traffic(&self) {
        if self.overlay_seen.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.set_value(&self.device_id, OVERLAY_SEEN_KEY, serde_json::Value::Bool(true)) {
                warn!(device_id = %self.device_id, "Failed to persist overlay flag: {}", e);
            }
        }
        if self.decision().protocol == Protocol::Native {
            self.reclassify();
        }
    }

    fn reclassify(&self) -> ProtocolDecision {
        let identity = self.identity.read().clone();
        let next = self
            .classifier
            .classify_with_session(&identity, self.overlay_seen.load(Ordering::Acquire));
        let previous = std::mem::replace(&mut *self.decision.write(), next);
        if previous.protocol != next.protocol || previous.passive != next.passive {
            info!(
                device_id = %self.device_id,
                "Protocol changed from {} to {} ({:?})",
                previous.protocol,
                next.protocol,
                next.rule
            );
        }
        next
    }

    async fn apply_zone_status(&self, value: &AttributeValue, report: &mut HandleReport) {
        let Some(status) = ZoneStatus::from_attribute(value) else {
            return;
        };
        for (capability, value) in status.secondary_values() {
            if !self.sink.has_capability(capability) {
                continue;
            }
            self.push(capability, value, true, report).await;
        }
    }

    async fn apply(
        &self,
        key: &SourceKey,
        raw: &AttributeValue,
        native: bool,
        report: &mut HandleReport,
    ) {
        // Checked before resolve, which may bind a guessed meaning.
        if !self.is_alive() {
            return;
        }
        let Some(Resolution {
            capability, value, ..
        }) = self.registry.resolve(key, raw)
        else {
            debug!(device_id = %self.device_id, "No value for {} from {:?}", key, raw);
            report.ignored += 1;
            return;
        };

        if !native && self.native_is_fresh(&capability) {
            debug!(
                device_id = %self.device_id,
                capability = %capability,
                "Overlay value dropped, native report is fresher"
            );
            report.suppressed += 1;
            return;
        }

        self.push(&capability, value, native, report).await;
    }

    /// Hybrid arbitration: whether a native report for `capability` is
    /// still inside the freshness window.
    fn native_is_fresh(&self, capability: &str) -> bool {
        let decision = self.decision();
        if decision.protocol != Protocol::Hybrid || !decision.prefer_native_on_conflict {
            return false;
        }
        let window = Duration::from_secs(self.config.hybrid.native_freshness_secs);
        self.reports
            .lock()
            .get(capability)
            .map(|r| r.native && r.at.elapsed() < window)
            .unwrap_or(false)
    }

    /// Calibrate, sanity check, send to the host and cache.
    async fn push(
        &self,
        capability: &str,
        value: CapabilityValue,
        native: bool,
        report: &mut HandleReport,
    ) {
        let Some(value) = self.settle(capability, value) else {
            report.suppressed += 1;
            return;
        };

        self.remember(capability, value.clone(), native);

        match self.sink.set_capability_value(capability, value).await {
            Ok(()) => report.applied += 1,
            Err(e) => {
                warn!(device_id = %self.device_id, capability, "Failed to set value: {}", e);
                report.ignored += 1;
            }
        }
    }

    /// Calibrate, then apply the sanity guard. `None` when the value is
    /// implausible for this device.
    fn settle(&self, capability: &str, value: CapabilityValue) -> Option<CapabilityValue> {
        let value = calibrate(value, self.profile.offset(capability));
        if !is_plausible(self.profile.role, capability, &value) {
            debug!(
                device_id = %self.device_id,
                capability,
                "Implausible value {} dropped",
                value
            );
            return None;
        }
        Some(value)
    }

    fn remember(&self, capability: &str, value: CapabilityValue, native: bool) {
        if let Some(store) = &self.store {
            match serde_json::to_value(&value) {
                Ok(json) => {
                    let key = format!("{}{}", LAST_KNOWN_GOOD_PREFIX, capability);
                    if let Err(e) = store.set_value(&self.device_id, &key, json) {
                        debug!(device_id = %self.device_id, "Failed to persist {}: {}", key, e);
                    }
                }
                Err(e) => debug!(device_id = %self.device_id, "Unserializable value: {}", e),
            }
        }
        self.reports.lock().insert(
            capability.to_string(),
            CachedReport {
                value,
                at: Instant::now(),
                native,
            },
        );
    }

    fn fresh_cached(&self, capability: &str) -> Option<CapabilityValue> {
        let max_age = Duration::from_secs(self.config.hybrid.report_cache_max_age_secs);
        self.reports
            .lock()
            .get(capability)
            .filter(|r| r.at.elapsed() <= max_age)
            .map(|r| r.value.clone())
    }

    fn last_known_good(&self, capability: &str) -> Option<CapabilityValue> {
        let store = self.store.as_deref()?;
        let key = format!("{}{}", LAST_KNOWN_GOOD_PREFIX, capability);
        load_value(store, &self.device_id, &key)
    }

    /// Read a capability from the device.
    ///
    /// Live and derived values pass the same calibration and sanity guard as
    /// reported ones; an implausible read counts as a failed read.
    /// Native attribute bindings are read with retry; on failure the chain
    /// falls back to the cached report, a derived value, then the last
    /// known-good value. DataPoint-only capabilities get a query frame and
    /// answer from the fallbacks; the device replies asynchronously. A
    /// successful or degraded value is pushed to the host; a failed read
    /// leaves the host value untouched.
    pub async fn refresh(&self, capability: &str) -> OperationOutcome<CapabilityValue> {
        if !self.is_alive() {
            return OperationOutcome::Failed(FailureReason::Detached);
        }

        let bindings = self.registry.bindings_for(capability);
        let native_binding = bindings.iter().find(|b| !b.key.is_data_point()).cloned();
        let dp_binding = bindings.iter().find(|b| b.key.is_data_point()).cloned();

        let mut chain = FallbackChain::new()
            .with_cached(self.fresh_cached(capability))
            .with_last_known_good(self.last_known_good(capability));
        if let Some(derived) = self.derived_read(capability) {
            chain = chain.with_derived(derived.boxed());
        }

        let outcome = match native_binding {
            Some(binding) => self.read_native(&binding, chain).await,
            None => {
                if let Some(binding) = &dp_binding {
                    self.query_data_point(binding).await;
                }
                chain
                    .resolve(FailureReason::Unreadable(capability.to_string()))
                    .await
            }
        };

        let pushed = match &outcome {
            OperationOutcome::Success(v) => Some((v.clone(), true)),
            OperationOutcome::Degraded { value, .. } => Some((value.clone(), false)),
            OperationOutcome::Failed(reason) => {
                debug!(device_id = %self.device_id, capability, "Refresh failed: {}", reason);
                None
            }
        };
        let Some((value, is_live)) = pushed else {
            return outcome;
        };
        if !self.is_alive() {
            return OperationOutcome::Failed(FailureReason::Detached);
        }
        if is_live {
            self.remember(capability, value.clone(), true);
        }
        if let Err(e) = self.sink.set_capability_value(capability, value).await {
            warn!(device_id = %self.device_id, capability, "Failed to set value: {}", e);
        }
        outcome
    }

    async fn read_native(
        &self,
        binding: &CapabilityBinding,
        chain: FallbackChain<'_, CapabilityValue>,
    ) -> OperationOutcome<CapabilityValue> {
        let SourceKey::Attribute {
            endpoint,
            cluster,
            attribute,
        } = &binding.key
        else {
            return chain
                .resolve(FailureReason::Unreadable(binding.capability.clone()))
                .await;
        };
        let transport = &self.transport;
        read_with_fallback(
            &self.config.retry,
            &self.liveness,
            || async move {
                let raw = transport.read_attribute(*endpoint, *cluster, attribute).await?;
                binding
                    .transform
                    .apply(&raw)
                    .and_then(|value| self.settle(&binding.capability, value))
                    .ok_or_else(|| {
                        TransportError::Rejected(format!("unusable value {:?} for {}", raw, attribute))
                    })
            },
            chain,
        )
        .await
    }

    /// Secondary-signal read for a capability, if the device has one.
    fn derived_read(
        &self,
        capability: &str,
    ) -> Option<impl std::future::Future<Output = Option<CapabilityValue>> + Send + '_> {
        let source = derived_sources()
            .into_iter()
            .find(|d| d.capability == capability)?;
        let endpoint = self.identity.read().endpoint_for(source.cluster)?;
        Some(async move {
            let raw = with_retry(&self.config.retry, &self.liveness, || {
                self.transport
                    .read_attribute(endpoint, source.cluster, &source.attribute)
            })
            .await
            .into_value()?;
            let value = source.transform.apply(&raw)?;
            self.settle(&source.capability, value)
        })
    }

    async fn query_data_point(&self, binding: &CapabilityBinding) {
        let SourceKey::DataPoint { dp } = binding.key else {
            return;
        };
        if !self.decision().uses_overlay() {
            return;
        }
        if let Err(e) = self.send_frames(vec![query_frame(dp)]).await {
            debug!(device_id = %self.device_id, dp, "Query not sent: {}", e);
        }
    }

    /// Ask the device to report each DataPoint, one command per point.
    async fn query_data_points(&self, dps: &[u8]) {
        if dps.is_empty() || !self.decision().uses_overlay() {
            return;
        }
        let mut sent = 0usize;
        for &dp in dps {
            if !self.is_alive() {
                return;
            }
            match self.send_frames(vec![query_frame(dp)]).await {
                Ok(()) => sent += 1,
                Err(e) => debug!(device_id = %self.device_id, dp, "Query not sent: {}", e),
            }
        }
        debug!(device_id = %self.device_id, "Queried {} of {} start-up DataPoints", sent, dps.len());
    }

    async fn send_frames(&self, frames: Vec<codec::DataPointFrame>) -> Result<(), DeviceError> {
        let payload = Envelope::new(self.seq.next(), frames).encode()?;
        let endpoint = self.overlay_endpoint();
        with_retry(&self.config.retry, &self.liveness, || {
            self.transport
                .send_frame(endpoint, clusters::TUYA_PROPRIETARY, &payload)
        })
        .await
        .into_result()?;
        Ok(())
    }

    fn overlay_endpoint(&self) -> u8 {
        let identity = self.identity.read();
        self.config
            .classifier
            .proprietary_clusters
            .iter()
            .find_map(|c| identity.endpoint_for(*c))
            .unwrap_or(1)
    }

    /// Write a capability value to the device.
    ///
    /// Overlay devices get a sequenced DataPoint frame, native devices an
    /// attribute write; both run with retry. Fails without touching the
    /// device when no writable binding exists.
    pub async fn write_capability(
        &self,
        capability: &str,
        value: CapabilityValue,
    ) -> Result<(), DeviceError> {
        if !self.is_alive() {
            return Err(DeviceError::Detached);
        }
        let bindings = self.registry.bindings_for(capability);
        if bindings.is_empty() {
            return Err(DeviceError::UnknownCapability(capability.to_string()));
        }
        let prefer_overlay = !self.decision().uses_native_reads();
        let binding = bindings
            .iter()
            .find(|b| b.key.is_data_point() == prefer_overlay)
            .or_else(|| bindings.first())
            .cloned()
            .ok_or_else(|| DeviceError::UnknownCapability(capability.to_string()))?;

        let raw = binding
            .transform
            .invert(&value)
            .ok_or_else(|| DeviceError::NotWritable(capability.to_string()))?;
        let invalid = || DeviceError::InvalidValue {
            capability: capability.to_string(),
            value: value.to_string(),
        };

        match &binding.key {
            SourceKey::DataPoint { dp } => {
                let ty = binding.dp_type.unwrap_or_else(|| infer_dp_type(&raw));
                let dp_value = DpValue::from_attribute(ty, &raw).ok_or_else(invalid)?;
                self.send_frames(vec![codec::DataPointFrame::new(*dp, dp_value)])
                    .await?;
            }
            SourceKey::Attribute {
                endpoint,
                cluster,
                attribute,
            } => {
                with_retry(&self.config.retry, &self.liveness, || {
                    self.transport
                        .write_attribute(*endpoint, *cluster, attribute, raw.clone())
                })
                .await
                .into_result()?;
            }
        }
        debug!(device_id = %self.device_id, capability, "Wrote {} via {}", value, binding.key);
        Ok(())
    }

    /// Send the current local time to an overlay device.
    pub async fn sync_time(&self) -> Result<(), DeviceError> {
        if !self.decision().uses_overlay() {
            return Err(DeviceError::OverlayInactive);
        }
        self.send_frames(vec![time_sync_frame(&chrono::Local::now())])
            .await
    }

    /// Replace the identity after a re-announce. Returns `true` when vendor
    /// or model changed and the device was reclassified.
    pub fn update_identity(&self, identity: DeviceIdentity) -> bool {
        let changed = {
            let mut current = self.identity.write();
            let changed = current.fingerprint_differs(&identity);
            *current = identity;
            changed
        };
        if changed {
            self.reclassify();
        }
        changed
    }

    /// Run one enrichment scan now.
    pub async fn run_scan(&self) -> Result<ScanReport, ScanError> {
        if !self.is_alive() {
            return Err(ScanError::Stopped);
        }
        let identity = self.identity();
        let env = ScanEnv {
            identity: &identity,
            registry: &self.registry,
            sink: self.sink.as_ref(),
            transport: self.transport.as_ref(),
            store: self.store.as_deref(),
            retry: &self.config.retry,
            liveness: &self.liveness,
        };
        let report = self.scanner.scan(&env).await?;
        if !report.added.is_empty() {
            info!(
                device_id = %self.device_id,
                "Enrichment added {}",
                report.added.join(", ")
            );
        }
        Ok(report)
    }

    /// Stop everything for this device. In-flight operations see the
    /// liveness flag and stop before touching the registry.
    pub fn detach(&self) {
        self.liveness.kill();
        self.scanner.stop();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        info!(device_id = %self.device_id, "Detached");
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn load_value<T: serde::de::DeserializeOwned>(
    store: &dyn DeviceStore,
    device_id: &str,
    key: &str,
) -> Option<T> {
    match store.get_value(device_id, key) {
        Ok(Some(value)) => serde_json::from_value(value).ok(),
        Ok(None) => None,
        Err(e) => {
            debug!(device_id, "Failed to read {}: {}", key, e);
            None
        }
    }
}

fn calibrate(value: CapabilityValue, offset: f64) -> CapabilityValue {
    match value {
        CapabilityValue::Number(n) if offset != 0.0 => {
            CapabilityValue::Number(((n + offset) * 100.0).round() / 100.0)
        }
        other => other,
    }
}

/// Value sanity guard.
///
/// Presence radars put unrelated data on the DataPoints other sensors use
/// for temperature and humidity.
fn is_plausible(role: DeviceRole, capability: &str, value: &CapabilityValue) -> bool {
    if role == DeviceRole::Presence
        && matches!(capability, "measure_temperature" | "measure_humidity")
    {
        return false;
    }
    match (capability, value.as_f64()) {
        ("measure_battery" | "measure_humidity", Some(v)) => (0.0..=100.0).contains(&v),
        ("measure_temperature", Some(v)) => (-60.0..=125.0).contains(&v),
        _ => true,
    }
}

fn infer_dp_type(raw: &AttributeValue) -> DpType {
    match raw {
        AttributeValue::Bool(_) => DpType::Bool,
        AttributeValue::Int(_) | AttributeValue::Float(_) => DpType::Value,
        AttributeValue::Text(_) => DpType::String,
        AttributeValue::Bytes(_) => DpType::Raw,
    }
}
