//! Enrichment scanner driven through a device context.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dpbridge_core::config::clusters;
use dpbridge_core::{AttributeValue, CapabilityValue, DeviceStore};
use dpbridge_devices::enrichment::RECORD_KEY;
use dpbridge_devices::profiles::{self, DeviceProfile};
use dpbridge_devices::{
    BindingOrigin, Collaborators, DeviceContext, DeviceIdentity, DeviceRole, EngineConfig,
    EnrichmentRecord, ScanError, ScanState, SkipReason, SourceKey, TrustTier,
};
use dpbridge_storage::{MemoryStore, RedbStore};
use proptest::prelude::*;

use common::{eventually, fast_retry, FakeSink, FakeTransport};

const DEVICE: &str = "dev-scan";

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry = fast_retry();
    config.scan.enabled = false;
    config
}

fn sensor_identity() -> DeviceIdentity {
    DeviceIdentity::builder("_TZ3000_xr3htd96", "TS0201")
        .clusters(
            1,
            &[
                clusters::BASIC,
                clusters::POWER_CONFIGURATION,
                clusters::TEMPERATURE_MEASUREMENT,
                clusters::RELATIVE_HUMIDITY,
                clusters::ON_OFF,
            ],
        )
        .build()
}

fn populate(transport: &FakeTransport) {
    transport.set(1, clusters::TEMPERATURE_MEASUREMENT, "measuredValue", AttributeValue::Int(2150));
    transport.set(1, clusters::RELATIVE_HUMIDITY, "measuredValue", AttributeValue::Int(4500));
    transport.set(1, clusters::POWER_CONFIGURATION, "batteryPercentageRemaining", AttributeValue::Int(180));
    transport.set(1, clusters::ON_OFF, "onOff", AttributeValue::Bool(true));
}

fn attach(
    profile: DeviceProfile,
    transport: &Arc<FakeTransport>,
    sink: &Arc<FakeSink>,
    store: Option<Arc<dyn DeviceStore>>,
    config: EngineConfig,
) -> Arc<DeviceContext> {
    let mut collaborators = Collaborators::new(transport.clone(), sink.clone());
    if let Some(store) = store {
        collaborators = collaborators.with_store(store);
    }
    DeviceContext::attach(DEVICE, sensor_identity(), profile, collaborators, config)
}

fn bare_sensor() -> DeviceProfile {
    DeviceProfile::new("bare_sensor", DeviceRole::Sensor)
}

#[tokio::test]
async fn test_scan_adds_measurements() {
    let transport = FakeTransport::new();
    populate(&transport);
    let sink = FakeSink::new();
    let store: Arc<dyn DeviceStore> = Arc::new(MemoryStore::new());
    let ctx = attach(bare_sensor(), &transport, &sink, Some(store.clone()), test_config());
    assert_eq!(ctx.scanner().state(), ScanState::Idle);

    let report = ctx.run_scan().await.unwrap();
    assert_eq!(
        report.added,
        vec!["measure_temperature", "measure_humidity", "measure_battery"]
    );
    // Sensors never get relay controls, whatever the tier.
    assert_eq!(report.skipped_for(SkipReason::RoleExcluded), 1);
    assert!(!report.interrupted);

    assert_eq!(sink.last("measure_temperature"), Some(CapabilityValue::Number(21.5)));
    assert_eq!(sink.last("measure_humidity"), Some(CapabilityValue::Number(45.0)));
    assert_eq!(sink.last("measure_battery"), Some(CapabilityValue::Number(90.0)));
    assert_eq!(transport.reporting.lock().len(), 3);

    let binding = ctx
        .registry()
        .get(&SourceKey::attribute(1, clusters::TEMPERATURE_MEASUREMENT, "measuredValue"))
        .unwrap();
    assert_eq!(binding.origin, BindingOrigin::Inferred);

    let stored = store.get_value(DEVICE, RECORD_KEY).unwrap().unwrap();
    let record: EnrichmentRecord = serde_json::from_value(stored).unwrap();
    assert_eq!(record.len(), 3);
    assert!(record.contains("measure_battery"));
    assert_eq!(ctx.scanner().state(), ScanState::Idle);
}

#[tokio::test]
async fn test_rescan_skips_present_capabilities() {
    let transport = FakeTransport::new();
    populate(&transport);
    let sink = FakeSink::new();
    let ctx = attach(bare_sensor(), &transport, &sink, None, test_config());

    ctx.run_scan().await.unwrap();
    let before = sink.capabilities();
    let report = ctx.run_scan().await.unwrap();
    assert!(report.added.is_empty());
    assert_eq!(report.skipped_for(SkipReason::Present), 3);
    assert_eq!(sink.capabilities(), before);
}

#[tokio::test]
async fn test_full_tier_adds_controls() {
    let transport = FakeTransport::new();
    populate(&transport);
    let sink = FakeSink::new();
    let ctx = attach(profiles::generic(), &transport, &sink, None, test_config());
    assert_eq!(ctx.profile().trust, TrustTier::Full);

    let report = ctx.run_scan().await.unwrap();
    assert!(report.added.contains(&"onoff".to_string()));
    assert_eq!(sink.last("onoff"), Some(CapabilityValue::Bool(true)));
}

#[tokio::test]
async fn test_declared_sources_are_left_alone() {
    let transport = FakeTransport::new();
    populate(&transport);
    let sink = FakeSink::with_capabilities(&["measure_temperature", "measure_humidity", "measure_battery"]);
    let ctx = attach(profiles::climate_sensor(), &transport, &sink, None, test_config());

    let report = ctx.run_scan().await.unwrap();
    assert!(report.added.is_empty());
    assert_eq!(report.skipped_for(SkipReason::Present), 3);

    // Host lost the capability, but the driver still owns the source.
    let sink = FakeSink::new();
    let ctx = attach(profiles::climate_sensor(), &transport, &sink, None, test_config());
    let report = ctx.run_scan().await.unwrap();
    assert!(report.added.is_empty());
    assert_eq!(report.skipped_for(SkipReason::Bound), 3);
    let binding = ctx
        .registry()
        .get(&SourceKey::attribute(1, clusters::TEMPERATURE_MEASUREMENT, "measuredValue"))
        .unwrap();
    assert_eq!(binding.origin, BindingOrigin::Declared);
}

#[tokio::test]
async fn test_probe_and_sink_failures_are_skipped() {
    let transport = FakeTransport::new();
    transport.set(1, clusters::TEMPERATURE_MEASUREMENT, "measuredValue", AttributeValue::Int(2150));
    transport.set(1, clusters::RELATIVE_HUMIDITY, "measuredValue", AttributeValue::Int(4500));
    let sink = FakeSink::new();
    sink.reject("measure_humidity");
    let ctx = attach(bare_sensor(), &transport, &sink, None, test_config());

    let report = ctx.run_scan().await.unwrap();
    assert_eq!(report.added, vec!["measure_temperature"]);
    assert_eq!(report.skipped_for(SkipReason::SinkRejected), 1);
    assert_eq!(report.skipped_for(SkipReason::ProbeFailed), 1);
    assert!(!ctx
        .registry()
        .contains(&SourceKey::attribute(1, clusters::RELATIVE_HUMIDITY, "measuredValue")));
}

#[tokio::test]
async fn test_scans_never_overlap() {
    let transport = FakeTransport::new();
    populate(&transport);
    transport.set_read_delay(Duration::from_millis(30));
    let sink = FakeSink::new();
    let ctx = attach(bare_sensor(), &transport, &sink, None, test_config());

    let (a, b) = tokio::join!(ctx.run_scan(), ctx.run_scan());
    let errors: Vec<ScanError> = [a.clone().err(), b.clone().err()].into_iter().flatten().collect();
    assert_eq!(errors, vec![ScanError::AlreadyScanning]);
    let added = a.map(|r| r.added.len()).unwrap_or(0) + b.map(|r| r.added.len()).unwrap_or(0);
    assert_eq!(added, 3);
    assert_eq!(ctx.scanner().state(), ScanState::Idle);
}

#[tokio::test]
async fn test_detach_interrupts_scan() {
    let transport = FakeTransport::new();
    populate(&transport);
    transport.set_read_delay(Duration::from_millis(40));
    let sink = FakeSink::new();
    let ctx = attach(bare_sensor(), &transport, &sink, None, test_config());

    let scanning = ctx.clone();
    let handle = tokio::spawn(async move { scanning.run_scan().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    ctx.detach();

    let report = handle.await.unwrap().unwrap();
    assert!(report.interrupted);
    assert!(report.added.is_empty());
    assert!(ctx.registry().is_empty());
    assert!(sink.capabilities().is_empty());
    assert_eq!(ctx.scanner().state(), ScanState::Stopped);
    assert_eq!(ctx.run_scan().await.unwrap_err(), ScanError::Stopped);
}

#[tokio::test]
async fn test_record_survives_restart_in_redb() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.redb");
    let transport = FakeTransport::new();
    populate(&transport);

    {
        let store: Arc<dyn DeviceStore> = Arc::new(RedbStore::open(&path).unwrap());
        let sink = FakeSink::new();
        let ctx = attach(bare_sensor(), &transport, &sink, Some(store), test_config());
        assert_eq!(ctx.run_scan().await.unwrap().added.len(), 3);
        ctx.detach();
    }

    let store: Arc<dyn DeviceStore> = Arc::new(RedbStore::open(&path).unwrap());
    let sink = FakeSink::with_capabilities(&["measure_temperature", "measure_humidity", "measure_battery"]);
    let ctx = attach(bare_sensor(), &transport, &sink, Some(store), test_config());

    let restored = ctx.scanner().record();
    assert_eq!(
        restored.capabilities,
        ["measure_battery", "measure_humidity", "measure_temperature"]
            .iter()
            .map(|s| s.to_string())
            .collect::<BTreeSet<_>>()
    );
    let binding = ctx
        .registry()
        .get(&SourceKey::attribute(1, clusters::RELATIVE_HUMIDITY, "measuredValue"))
        .unwrap();
    assert_eq!(binding.capability, "measure_humidity");
    assert_eq!(binding.origin, BindingOrigin::Inferred);

    let reads = transport.read_count();
    let report = ctx.run_scan().await.unwrap();
    assert!(report.added.is_empty());
    assert_eq!(transport.read_count(), reads);
}

#[tokio::test]
async fn test_scheduled_scan_runs_after_start() {
    let transport = FakeTransport::new();
    populate(&transport);
    let sink = FakeSink::new();
    let mut config = test_config();
    config.scan.enabled = true;
    config.scan.initial_delay_secs = 0;
    let ctx = attach(bare_sensor(), &transport, &sink, None, config);

    ctx.start(&dpbridge_core::InboundBus::new());
    assert!(eventually(|| sink.capabilities().len() == 3).await);
    ctx.detach();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_capabilities_never_shrink(cycles in prop::collection::vec(any::<[bool; 3]>(), 1..6)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let transport = FakeTransport::new();
            let sink = FakeSink::new();
            let ctx = attach(bare_sensor(), &transport, &sink, None, test_config());
            let sources = [
                (clusters::TEMPERATURE_MEASUREMENT, "measuredValue", AttributeValue::Int(2000)),
                (clusters::RELATIVE_HUMIDITY, "measuredValue", AttributeValue::Int(5000)),
                (clusters::POWER_CONFIGURATION, "batteryPercentageRemaining", AttributeValue::Int(100)),
            ];

            let mut seen = BTreeSet::new();
            for available in cycles {
                for ((cluster, attribute, value), on) in sources.iter().zip(available) {
                    if on {
                        transport.set(1, *cluster, attribute, value.clone());
                    } else {
                        transport.remove(1, *cluster, attribute);
                    }
                }
                ctx.run_scan().await.unwrap();
                let now = sink.capabilities();
                assert!(now.is_superset(&seen));
                seen = now;
            }
        });
    }
}
