//! Enrichment scanner.
//!
//! Periodically probes the native attribute surface of a device and binds
//! capabilities the driver did not declare. The scanner only adds: it never
//! removes a capability or replaces a declared binding.
//!
//! ```text
//! Uninitialized --restore--> Idle <--> Scanning
//!                              \          \
//!                               +----------+--stop--> Stopped
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU8, Ordering};

use dpbridge_core::config::clusters;
use dpbridge_core::{CapabilitySink, ClusterId, DeviceStore, ReportingSpec, Transport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::binding::{BindingRegistry, CapabilityBinding, SourceKey};
use crate::identity::DeviceIdentity;
use crate::resilience::{with_retry, Liveness, OperationOutcome, RetryPolicy};
use crate::role::{DeviceRole, PowerSource};
use crate::transform::ValueTransform;

/// Store key of the persisted [`EnrichmentRecord`].
pub const RECORD_KEY: &str = "enrichment.record";

/// How much the scanner may add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    /// Read-only measurements from the allow-list.
    Safe,
    /// Any candidate, including controls. Used by the generic driver.
    Full,
}

/// Why a candidate was not added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Capability already on the device.
    Present,
    /// Source already bound.
    Bound,
    /// Irrelevant for the device role.
    RoleExcluded,
    /// Not on the measurement allow-list of the safe tier.
    NotAllowed,
    /// The attribute could not be read.
    ProbeFailed,
    /// A declared binding owns the source.
    Conflict,
    /// The host refused the capability.
    SinkRejected,
}

/// A cluster attribute that can back a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentCandidate {
    pub cluster: ClusterId,
    pub attribute: String,
    pub capability: String,
    pub transform: ValueTransform,
    #[serde(default)]
    pub reporting: Option<ReportingSpec>,
}

impl EnrichmentCandidate {
    pub fn new(
        cluster: ClusterId,
        attribute: &str,
        capability: &str,
        transform: ValueTransform,
    ) -> Self {
        Self {
            cluster,
            attribute: attribute.to_string(),
            capability: capability.to_string(),
            transform,
            reporting: None,
        }
    }

    pub fn with_reporting(mut self, min_interval_secs: u16, max_interval_secs: u16, min_change: f64) -> Self {
        self.reporting = Some(ReportingSpec::new(
            self.attribute.clone(),
            min_interval_secs,
            max_interval_secs,
            min_change,
        ));
        self
    }
}

/// Native cluster attributes the scanner knows how to map.
pub fn default_candidates() -> Vec<EnrichmentCandidate> {
    vec![
        EnrichmentCandidate::new(
            clusters::TEMPERATURE_MEASUREMENT,
            "measuredValue",
            "measure_temperature",
            ValueTransform::DivideRound { divisor: 100.0, decimals: 1 },
        )
        .with_reporting(60, 3600, 10.0),
        EnrichmentCandidate::new(
            clusters::RELATIVE_HUMIDITY,
            "measuredValue",
            "measure_humidity",
            ValueTransform::DivideRound { divisor: 100.0, decimals: 1 },
        )
        .with_reporting(60, 3600, 100.0),
        EnrichmentCandidate::new(
            clusters::POWER_CONFIGURATION,
            "batteryPercentageRemaining",
            "measure_battery",
            ValueTransform::BatteryHalfPercent,
        )
        .with_reporting(3600, 43200, 2.0),
        EnrichmentCandidate::new(
            clusters::ILLUMINANCE_MEASUREMENT,
            "measuredValue",
            "measure_luminance",
            ValueTransform::LogLux,
        )
        .with_reporting(10, 3600, 1000.0),
        EnrichmentCandidate::new(
            clusters::PRESSURE_MEASUREMENT,
            "measuredValue",
            "measure_pressure",
            ValueTransform::Identity,
        ),
        EnrichmentCandidate::new(
            clusters::CARBON_DIOXIDE,
            "measuredValue",
            "measure_co2",
            ValueTransform::Linear { scale: 1_000_000.0, offset: 0.0 },
        ),
        EnrichmentCandidate::new(
            clusters::PM25_MEASUREMENT,
            "measuredValue",
            "measure_pm25",
            ValueTransform::Identity,
        ),
        EnrichmentCandidate::new(
            clusters::ELECTRICAL_MEASUREMENT,
            "activePower",
            "measure_power",
            ValueTransform::divide(10.0),
        )
        .with_reporting(10, 300, 5.0),
        EnrichmentCandidate::new(
            clusters::ELECTRICAL_MEASUREMENT,
            "rmsVoltage",
            "measure_voltage",
            ValueTransform::divide(10.0),
        ),
        EnrichmentCandidate::new(
            clusters::ELECTRICAL_MEASUREMENT,
            "rmsCurrent",
            "measure_current",
            ValueTransform::divide(1000.0),
        ),
        EnrichmentCandidate::new(
            clusters::METERING,
            "currentSummationDelivered",
            "meter_power",
            ValueTransform::divide(1000.0),
        ),
        EnrichmentCandidate::new(
            clusters::OCCUPANCY_SENSING,
            "occupancy",
            "alarm_motion",
            ValueTransform::BitMask { mask: 0x01 },
        ),
        EnrichmentCandidate::new(clusters::ON_OFF, "onOff", "onoff", ValueTransform::Boolean),
        EnrichmentCandidate::new(
            clusters::LEVEL_CONTROL,
            "currentLevel",
            "dim",
            ValueTransform::LevelToUnit,
        ),
    ]
}

fn default_measurement_allow_list() -> BTreeSet<String> {
    [
        "measure_temperature",
        "measure_humidity",
        "measure_battery",
        "measure_luminance",
        "measure_pressure",
        "measure_co2",
        "measure_pm25",
        "measure_power",
        "measure_voltage",
        "measure_current",
        "meter_power",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Capabilities that drive the device rather than report on it.
const CONTROL_CAPABILITIES: &[&str] = &["onoff", "dim"];

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_role_exclusions() -> BTreeMap<DeviceRole, BTreeSet<String>> {
    BTreeMap::from([
        (
            DeviceRole::Switch,
            set(&["measure_luminance", "measure_battery", "alarm_motion"]),
        ),
        (DeviceRole::Plug, set(&["measure_luminance", "measure_battery"])),
        (DeviceRole::Light, set(&["measure_battery"])),
        (DeviceRole::Cover, set(&["measure_luminance", "dim"])),
        (
            DeviceRole::Presence,
            set(&["measure_battery", "measure_temperature", "measure_humidity"]),
        ),
        (
            DeviceRole::Button,
            set(&["onoff", "dim", "measure_power", "meter_power"]),
        ),
        (DeviceRole::Sensor, set(&["onoff", "dim", "measure_power", "meter_power"])),
    ])
}

/// Trust tier plus the exclusion lists that go with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustPolicy {
    pub tier: TrustTier,
    /// Capabilities the safe tier may add.
    #[serde(default = "default_measurement_allow_list")]
    pub measurement_allow_list: BTreeSet<String>,
    /// Capabilities never added for a role, in any tier.
    #[serde(default = "default_role_exclusions")]
    pub role_exclusions: BTreeMap<DeviceRole, BTreeSet<String>>,
}

impl TrustPolicy {
    pub fn safe() -> Self {
        Self {
            tier: TrustTier::Safe,
            measurement_allow_list: default_measurement_allow_list(),
            role_exclusions: default_role_exclusions(),
        }
    }

    pub fn full() -> Self {
        Self {
            tier: TrustTier::Full,
            ..Self::safe()
        }
    }

    pub fn for_tier(tier: TrustTier) -> Self {
        match tier {
            TrustTier::Safe => Self::safe(),
            TrustTier::Full => Self::full(),
        }
    }

    /// Whether the policy lets the scanner add `capability` to a `role` device.
    pub fn check(&self, role: DeviceRole, capability: &str) -> Result<(), SkipReason> {
        if self
            .role_exclusions
            .get(&role)
            .map(|excluded| excluded.contains(capability))
            .unwrap_or(false)
        {
            return Err(SkipReason::RoleExcluded);
        }
        // Mains-powered devices have no battery to report.
        if capability == "measure_battery" && role.power_source() == PowerSource::Mains {
            return Err(SkipReason::RoleExcluded);
        }
        if CONTROL_CAPABILITIES.contains(&capability)
            && role != DeviceRole::Generic
            && !role.is_actuator()
        {
            return Err(SkipReason::RoleExcluded);
        }
        if self.tier == TrustTier::Safe && !self.measurement_allow_list.contains(capability) {
            return Err(SkipReason::NotAllowed);
        }
        Ok(())
    }
}

/// Capability added by inference and the source backing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedSource {
    pub capability: String,
    pub key: SourceKey,
}

/// Persisted, append-only set of inferred capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub sources: Vec<RecordedSource>,
}

impl EnrichmentRecord {
    /// Add a capability. Returns `false` if it was already recorded.
    pub fn insert(&mut self, capability: &str, key: SourceKey) -> bool {
        if !self.capabilities.insert(capability.to_string()) {
            return false;
        }
        self.sources.push(RecordedSource {
            capability: capability.to_string(),
            key,
        });
        true
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

/// Scanner lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Uninitialized,
    Idle,
    Scanning,
    Stopped,
}

const UNINITIALIZED: u8 = 0;
const IDLE: u8 = 1;
const SCANNING: u8 = 2;
const STOPPED: u8 = 3;

impl ScanState {
    fn from_u8(v: u8) -> Self {
        match v {
            UNINITIALIZED => ScanState::Uninitialized,
            IDLE => ScanState::Idle,
            SCANNING => ScanState::Scanning,
            _ => ScanState::Stopped,
        }
    }
}

/// Scan error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("Scanner not restored yet")]
    NotRestored,

    #[error("Scan already in progress")]
    AlreadyScanning,

    #[error("Scanner stopped")]
    Stopped,

    #[error("Scanner already restored")]
    AlreadyRestored,
}

/// Result of one scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub added: Vec<String>,
    pub skipped: BTreeMap<SkipReason, usize>,
    /// The device was detached mid-scan.
    pub interrupted: bool,
}

impl ScanReport {
    fn skip(&mut self, reason: SkipReason) {
        *self.skipped.entry(reason).or_insert(0) += 1;
    }

    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }
}

/// Collaborators a scan runs against.
pub struct ScanEnv<'a> {
    pub identity: &'a DeviceIdentity,
    pub registry: &'a BindingRegistry,
    pub sink: &'a dyn CapabilitySink,
    pub transport: &'a dyn Transport,
    pub store: Option<&'a dyn DeviceStore>,
    pub retry: &'a RetryPolicy,
    pub liveness: &'a Liveness,
}

/// Resets `Scanning` to `Idle` when a scan ends, including when its future
/// is dropped. A concurrent `stop()` wins.
struct ScanGuard<'a>(&'a AtomicU8);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .0
            .compare_exchange(SCANNING, IDLE, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Per-device enrichment scanner.
pub struct EnrichmentScanner {
    device_id: String,
    role: DeviceRole,
    policy: TrustPolicy,
    candidates: Vec<EnrichmentCandidate>,
    state: AtomicU8,
    record: Mutex<EnrichmentRecord>,
}

impl EnrichmentScanner {
    pub fn new(device_id: impl Into<String>, role: DeviceRole, policy: TrustPolicy) -> Self {
        Self {
            device_id: device_id.into(),
            role,
            policy,
            candidates: default_candidates(),
            state: AtomicU8::new(UNINITIALIZED),
            record: Mutex::new(EnrichmentRecord::default()),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<EnrichmentCandidate>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn state(&self) -> ScanState {
        ScanState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    pub fn record(&self) -> EnrichmentRecord {
        self.record.lock().clone()
    }

    /// Stop for good. Running scans finish their current step and return.
    pub fn stop(&self) {
        self.state.store(STOPPED, Ordering::Release);
    }

    /// Load the persisted record and re-create the bindings it lists.
    ///
    /// Store failures are logged and treated as an empty record.
    pub fn restore(
        &self,
        registry: &BindingRegistry,
        store: Option<&dyn DeviceStore>,
    ) -> Result<EnrichmentRecord, ScanError> {
        if let Err(state) =
            self.state
                .compare_exchange(UNINITIALIZED, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(match state {
                STOPPED => ScanError::Stopped,
                _ => ScanError::AlreadyRestored,
            });
        }

        let record = store
            .map(|store| self.load_record(store))
            .unwrap_or_default();

        for source in &record.sources {
            let candidate = self.candidates.iter().find(|c| match &source.key {
                SourceKey::Attribute {
                    cluster, attribute, ..
                } => {
                    c.cluster == *cluster
                        && &c.attribute == attribute
                        && c.capability == source.capability
                }
                SourceKey::DataPoint { .. } => false,
            });
            let Some(candidate) = candidate else {
                debug!(
                    device_id = %self.device_id,
                    "No candidate for recorded {} on {}",
                    source.capability,
                    source.key
                );
                continue;
            };
            let binding = CapabilityBinding::inferred(
                source.key.clone(),
                candidate.capability.clone(),
                candidate.transform.clone(),
            );
            if let Err(e) = registry.insert(binding) {
                debug!(device_id = %self.device_id, "Recorded binding not restored: {}", e);
            }
        }

        if !record.is_empty() {
            info!(
                device_id = %self.device_id,
                "Restored {} enriched capabilities",
                record.len()
            );
        }
        *self.record.lock() = record.clone();
        Ok(record)
    }

    fn load_record(&self, store: &dyn DeviceStore) -> EnrichmentRecord {
        match store.get_value(&self.device_id, RECORD_KEY) {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(device_id = %self.device_id, "Discarding unreadable enrichment record: {}", e);
                EnrichmentRecord::default()
            }),
            Ok(None) => EnrichmentRecord::default(),
            Err(e) => {
                warn!(device_id = %self.device_id, "Failed to load enrichment record: {}", e);
                EnrichmentRecord::default()
            }
        }
    }

    fn persist_record(&self, store: &dyn DeviceStore) {
        let record = self.record();
        let value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(e) => {
                warn!(device_id = %self.device_id, "Failed to encode enrichment record: {}", e);
                return;
            }
        };
        if let Err(e) = store.set_value(&self.device_id, RECORD_KEY, value) {
            warn!(device_id = %self.device_id, "Failed to persist enrichment record: {}", e);
        }
    }

    /// Run one scan. Never overlaps with another scan of the same device.
    pub async fn scan(&self, env: &ScanEnv<'_>) -> Result<ScanReport, ScanError> {
        if let Err(state) =
            self.state
                .compare_exchange(IDLE, SCANNING, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(match state {
                UNINITIALIZED => ScanError::NotRestored,
                SCANNING => ScanError::AlreadyScanning,
                _ => ScanError::Stopped,
            });
        }
        let _guard = ScanGuard(&self.state);

        let report = self.scan_endpoints(env).await;

        if !report.added.is_empty() {
            if let Some(store) = env.store {
                self.persist_record(store);
            }
        }
        debug!(
            device_id = %self.device_id,
            "Scan finished: {} added, {:?} skipped",
            report.added.len(),
            report.skipped
        );
        Ok(report)
    }

    fn still_running(&self, env: &ScanEnv<'_>) -> bool {
        env.liveness.is_alive() && self.state.load(Ordering::Acquire) == SCANNING
    }

    async fn scan_endpoints(&self, env: &ScanEnv<'_>) -> ScanReport {
        let mut report = ScanReport::default();

        for (endpoint, present) in env.identity.endpoints() {
            let endpoint = *endpoint;
            for candidate in self.candidates.iter().filter(|c| present.contains(&c.cluster)) {
                if !self.still_running(env) {
                    report.interrupted = true;
                    return report;
                }

                let capability = candidate.capability.as_str();
                if let Err(reason) = self.policy.check(self.role, capability) {
                    report.skip(reason);
                    continue;
                }
                if env.sink.has_capability(capability) {
                    report.skip(SkipReason::Present);
                    continue;
                }
                let key = SourceKey::attribute(endpoint, candidate.cluster, candidate.attribute.clone());
                if env.registry.contains(&key) {
                    report.skip(SkipReason::Bound);
                    continue;
                }

                let probe = with_retry(env.retry, env.liveness, || {
                    env.transport
                        .read_attribute(endpoint, candidate.cluster, &candidate.attribute)
                })
                .await;
                let raw = match probe {
                    OperationOutcome::Failed(reason) => {
                        debug!(
                            device_id = %self.device_id,
                            "Probe of {} failed: {}",
                            key,
                            reason
                        );
                        report.skip(SkipReason::ProbeFailed);
                        continue;
                    }
                    other => match other.into_value() {
                        Some(raw) => raw,
                        None => continue,
                    },
                };

                // The device may have gone while the probe was in flight.
                if !self.still_running(env) {
                    report.interrupted = true;
                    return report;
                }

                let binding = CapabilityBinding::inferred(
                    key.clone(),
                    candidate.capability.clone(),
                    candidate.transform.clone(),
                );
                let previous = match env.registry.insert(binding.clone()) {
                    Ok(previous) => previous,
                    Err(e) => {
                        debug!(device_id = %self.device_id, "Skipping {}: {}", capability, e);
                        report.skip(SkipReason::Conflict);
                        continue;
                    }
                };

                if let Err(e) = env.sink.add_capability(capability).await {
                    debug!(
                        device_id = %self.device_id,
                        "Host refused {}: {}",
                        capability,
                        e
                    );
                    if !env.registry.revert(&binding, previous) {
                        debug!(device_id = %self.device_id, "{} rebound meanwhile, keeping it", key);
                    }
                    report.skip(SkipReason::SinkRejected);
                    continue;
                }

                if let Some(spec) = &candidate.reporting {
                    let outcome = with_retry(env.retry, env.liveness, || {
                        env.transport
                            .configure_reporting(endpoint, candidate.cluster, spec)
                    })
                    .await;
                    if let OperationOutcome::Failed(reason) = outcome {
                        debug!(
                            device_id = %self.device_id,
                            "Reporting for {} not configured: {}",
                            key,
                            reason
                        );
                    }
                }

                if let Some(resolved) = env.registry.resolve(&key, &raw) {
                    if let Err(e) = env
                        .sink
                        .set_capability_value(&resolved.capability, resolved.value)
                        .await
                    {
                        debug!(device_id = %self.device_id, "Initial value for {} not set: {}", capability, e);
                    }
                }

                self.record.lock().insert(capability, key.clone());
                report.added.push(capability.to_string());
                info!(
                    device_id = %self.device_id,
                    "Enriched with {} from {}",
                    capability,
                    key
                );
            }
        }
        report
    }
}
