//! Shared constants and environment helpers.
//!
//! Cluster ids and aliases, engine defaults and environment variable names
//! live here so every crate uses the same values.

use crate::transport::ClusterId;

/// Well-known cluster ids.
pub mod clusters {
    use super::ClusterId;

    pub const BASIC: ClusterId = 0x0000;
    pub const POWER_CONFIGURATION: ClusterId = 0x0001;
    pub const ON_OFF: ClusterId = 0x0006;
    pub const LEVEL_CONTROL: ClusterId = 0x0008;
    pub const WINDOW_COVERING: ClusterId = 0x0102;
    pub const THERMOSTAT: ClusterId = 0x0201;
    pub const COLOR_CONTROL: ClusterId = 0x0300;
    pub const ILLUMINANCE_MEASUREMENT: ClusterId = 0x0400;
    pub const TEMPERATURE_MEASUREMENT: ClusterId = 0x0402;
    pub const PRESSURE_MEASUREMENT: ClusterId = 0x0403;
    pub const RELATIVE_HUMIDITY: ClusterId = 0x0405;
    pub const OCCUPANCY_SENSING: ClusterId = 0x0406;
    pub const SOIL_MOISTURE: ClusterId = 0x0408;
    pub const CARBON_DIOXIDE: ClusterId = 0x040D;
    pub const PM25_MEASUREMENT: ClusterId = 0x042A;
    pub const IAS_ZONE: ClusterId = 0x0500;
    pub const METERING: ClusterId = 0x0702;
    pub const ELECTRICAL_MEASUREMENT: ClusterId = 0x0B04;

    /// Proprietary cluster carrying the DataPoint overlay.
    pub const TUYA_PROPRIETARY: ClusterId = 0xEF00;

    /// Clusters whose presence means the device measures climate or power
    /// through the native protocol.
    pub const NATIVE_CLIMATE_POWER: &[ClusterId] = &[
        TEMPERATURE_MEASUREMENT,
        RELATIVE_HUMIDITY,
        PRESSURE_MEASUREMENT,
        ILLUMINANCE_MEASUREMENT,
        SOIL_MOISTURE,
        CARBON_DIOXIDE,
        ELECTRICAL_MEASUREMENT,
        METERING,
    ];

    /// Alias names used by hosts and firmware dumps.
    const ALIASES: &[(&str, ClusterId)] = &[
        ("basic", BASIC),
        ("genBasic", BASIC),
        ("powerConfiguration", POWER_CONFIGURATION),
        ("genPowerCfg", POWER_CONFIGURATION),
        ("onOff", ON_OFF),
        ("genOnOff", ON_OFF),
        ("levelControl", LEVEL_CONTROL),
        ("genLevelCtrl", LEVEL_CONTROL),
        ("windowCovering", WINDOW_COVERING),
        ("closuresWindowCovering", WINDOW_COVERING),
        ("thermostat", THERMOSTAT),
        ("hvacThermostat", THERMOSTAT),
        ("colorControl", COLOR_CONTROL),
        ("lightingColorCtrl", COLOR_CONTROL),
        ("illuminanceMeasurement", ILLUMINANCE_MEASUREMENT),
        ("msIlluminanceMeasurement", ILLUMINANCE_MEASUREMENT),
        ("temperatureMeasurement", TEMPERATURE_MEASUREMENT),
        ("msTemperatureMeasurement", TEMPERATURE_MEASUREMENT),
        ("pressureMeasurement", PRESSURE_MEASUREMENT),
        ("msPressureMeasurement", PRESSURE_MEASUREMENT),
        ("relativeHumidity", RELATIVE_HUMIDITY),
        ("relativeHumidityMeasurement", RELATIVE_HUMIDITY),
        ("msRelativeHumidity", RELATIVE_HUMIDITY),
        ("occupancySensing", OCCUPANCY_SENSING),
        ("msOccupancySensing", OCCUPANCY_SENSING),
        ("soilMoisture", SOIL_MOISTURE),
        ("msSoilMoisture", SOIL_MOISTURE),
        ("carbonDioxide", CARBON_DIOXIDE),
        ("msCO2", CARBON_DIOXIDE),
        ("pm25Measurement", PM25_MEASUREMENT),
        ("iasZone", IAS_ZONE),
        ("ssIasZone", IAS_ZONE),
        ("metering", METERING),
        ("seMetering", METERING),
        ("electricalMeasurement", ELECTRICAL_MEASUREMENT),
        ("haElectricalMeasurement", ELECTRICAL_MEASUREMENT),
        ("tuya", TUYA_PROPRIETARY),
        ("tuyaManufacturer", TUYA_PROPRIETARY),
        ("tuyaSpecific", TUYA_PROPRIETARY),
        ("manuSpecificTuya", TUYA_PROPRIETARY),
        ("ef00", TUYA_PROPRIETARY),
    ];

    /// Resolve a cluster alias, a decimal id (`"61184"`) or a hex id
    /// (`"0xEF00"`) to a numeric cluster id.
    pub fn resolve(name: &str) -> Option<ClusterId> {
        let name = name.trim();
        if let Some(hex) = name
            .strip_prefix("0x")
            .or_else(|| name.strip_prefix("0X"))
        {
            return ClusterId::from_str_radix(hex, 16).ok();
        }
        if let Ok(id) = name.parse::<ClusterId>() {
            return Some(id);
        }
        ALIASES
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
            .map(|(_, id)| *id)
    }

    /// Canonical alias for a cluster id, if it has one.
    pub fn name_of(id: ClusterId) -> Option<&'static str> {
        ALIASES
            .iter()
            .find(|(_, cluster)| *cluster == id)
            .map(|(alias, _)| *alias)
    }
}

/// Engine defaults.
pub mod defaults {
    /// Delay before the first enrichment scan after attach.
    pub const SCAN_INITIAL_DELAY_SECS: u64 = 30;
    /// Interval between enrichment scans.
    pub const SCAN_INTERVAL_SECS: u64 = 3600;
    /// Total attempts for a transport operation.
    pub const RETRY_MAX_ATTEMPTS: u32 = 3;
    /// First backoff delay.
    pub const RETRY_BASE_DELAY_MS: u64 = 1000;
    /// Backoff cap.
    pub const RETRY_MAX_DELAY_MS: u64 = 30_000;
    /// Backoff multiplier.
    pub const RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;
    /// How long a native report shadows overlay values in hybrid mode.
    pub const HYBRID_NATIVE_FRESHNESS_SECS: u64 = 600;
    /// Cached reports older than this are not used as fallback.
    pub const REPORT_CACHE_MAX_AGE_SECS: u64 = 3600;
    /// Interval between overlay clock resyncs.
    pub const TIME_SYNC_INTERVAL_SECS: u64 = 86_400;
    /// Delay between the startup time sync and the critical DataPoint queries.
    pub const STARTUP_QUERY_DELAY_SECS: u64 = 3;
}

/// Environment variable names.
pub mod env_vars {
    use super::defaults;

    pub const SCAN_INITIAL_DELAY_SECS: &str = "DPBRIDGE_SCAN_INITIAL_DELAY_SECS";
    pub const SCAN_INTERVAL_SECS: &str = "DPBRIDGE_SCAN_INTERVAL_SECS";
    pub const RETRY_MAX_ATTEMPTS: &str = "DPBRIDGE_RETRY_MAX_ATTEMPTS";
    pub const RETRY_BASE_DELAY_MS: &str = "DPBRIDGE_RETRY_BASE_DELAY_MS";
    pub const RETRY_MAX_DELAY_MS: &str = "DPBRIDGE_RETRY_MAX_DELAY_MS";
    pub const HYBRID_NATIVE_FRESHNESS_SECS: &str = "DPBRIDGE_HYBRID_NATIVE_FRESHNESS_SECS";

    fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
        std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
    }

    /// Scan initial delay from the environment, or the default.
    pub fn scan_initial_delay_secs() -> u64 {
        parsed(SCAN_INITIAL_DELAY_SECS).unwrap_or(defaults::SCAN_INITIAL_DELAY_SECS)
    }

    /// Scan interval from the environment, or the default.
    pub fn scan_interval_secs() -> u64 {
        parsed(SCAN_INTERVAL_SECS).unwrap_or(defaults::SCAN_INTERVAL_SECS)
    }

    /// Retry attempts from the environment, or the default.
    pub fn retry_max_attempts() -> u32 {
        parsed(RETRY_MAX_ATTEMPTS).unwrap_or(defaults::RETRY_MAX_ATTEMPTS)
    }

    /// Retry base delay from the environment, or the default.
    pub fn retry_base_delay_ms() -> u64 {
        parsed(RETRY_BASE_DELAY_MS).unwrap_or(defaults::RETRY_BASE_DELAY_MS)
    }

    /// Retry delay cap from the environment, or the default.
    pub fn retry_max_delay_ms() -> u64 {
        parsed(RETRY_MAX_DELAY_MS).unwrap_or(defaults::RETRY_MAX_DELAY_MS)
    }

    /// Native freshness window from the environment, or the default.
    pub fn hybrid_native_freshness_secs() -> u64 {
        parsed(HYBRID_NATIVE_FRESHNESS_SECS).unwrap_or(defaults::HYBRID_NATIVE_FRESHNESS_SECS)
    }
}
