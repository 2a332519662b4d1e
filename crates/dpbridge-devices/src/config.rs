//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! [`EngineConfig::from_env`] and [`EngineConfig::load`] overlay the
//! `DPBRIDGE_*` environment variables on top.

use std::path::Path;

use dpbridge_core::config::{defaults, env_vars};
use serde::{Deserialize, Serialize};

use crate::binding::AmbiguityTable;
use crate::classifier::ClassifierRules;
use crate::commands::CRITICAL_DATA_POINTS;
use crate::resilience::RetryPolicy;

fn default_true() -> bool {
    true
}

fn default_initial_delay_secs() -> u64 {
    defaults::SCAN_INITIAL_DELAY_SECS
}

fn default_interval_secs() -> u64 {
    defaults::SCAN_INTERVAL_SECS
}

fn default_native_freshness_secs() -> u64 {
    defaults::HYBRID_NATIVE_FRESHNESS_SECS
}

fn default_report_cache_max_age_secs() -> u64 {
    defaults::REPORT_CACHE_MAX_AGE_SECS
}

/// Enrichment scan schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Delay before the first scan after start.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_secs: default_initial_delay_secs(),
            interval_secs: default_interval_secs(),
        }
    }
}

/// Hybrid arbitration and report cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridConfig {
    /// While a native report is younger than this, overlay values for the
    /// same capability are dropped.
    #[serde(default = "default_native_freshness_secs")]
    pub native_freshness_secs: u64,
    /// Cached reports older than this are not used as a read fallback.
    #[serde(default = "default_report_cache_max_age_secs")]
    pub report_cache_max_age_secs: u64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            native_freshness_secs: default_native_freshness_secs(),
            report_cache_max_age_secs: default_report_cache_max_age_secs(),
        }
    }
}

fn default_time_sync_interval_secs() -> u64 {
    defaults::TIME_SYNC_INTERVAL_SECS
}

fn default_startup_query_delay_secs() -> u64 {
    defaults::STARTUP_QUERY_DELAY_SECS
}

fn default_startup_queries() -> Vec<u8> {
    CRITICAL_DATA_POINTS.to_vec()
}

/// Overlay start-up and clock settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Resync period; 0 sends only the start-up sync.
    #[serde(default = "default_time_sync_interval_secs")]
    pub time_sync_interval_secs: u64,
    #[serde(default = "default_startup_query_delay_secs")]
    pub startup_query_delay_secs: u64,
    /// DataPoints queried after start; empty disables the queries.
    #[serde(default = "default_startup_queries")]
    pub startup_queries: Vec<u8>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            time_sync_interval_secs: default_time_sync_interval_secs(),
            startup_query_delay_secs: default_startup_query_delay_secs(),
            startup_queries: default_startup_queries(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub classifier: ClassifierRules,
    #[serde(default)]
    pub hybrid: HybridConfig,
    #[serde(default)]
    pub ambiguity: AmbiguityTable,
    #[serde(default)]
    pub overlay: OverlayConfig,
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<ConfigError> for dpbridge_core::Error {
    fn from(e: ConfigError) -> Self {
        dpbridge_core::Error::Config(e.to_string())
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Read a JSON config file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_json(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Overlay the environment variables that are set.
    pub fn apply_env(&mut self) {
        if std::env::var_os(env_vars::SCAN_INITIAL_DELAY_SECS).is_some() {
            self.scan.initial_delay_secs = env_vars::scan_initial_delay_secs();
        }
        if std::env::var_os(env_vars::SCAN_INTERVAL_SECS).is_some() {
            self.scan.interval_secs = env_vars::scan_interval_secs();
        }
        if std::env::var_os(env_vars::RETRY_MAX_ATTEMPTS).is_some() {
            self.retry.max_attempts = env_vars::retry_max_attempts();
        }
        if std::env::var_os(env_vars::RETRY_BASE_DELAY_MS).is_some() {
            self.retry.base_delay_ms = env_vars::retry_base_delay_ms();
        }
        if std::env::var_os(env_vars::RETRY_MAX_DELAY_MS).is_some() {
            self.retry.max_delay_ms = env_vars::retry_max_delay_ms();
        }
        if std::env::var_os(env_vars::HYBRID_NATIVE_FRESHNESS_SECS).is_some() {
            self.hybrid.native_freshness_secs = env_vars::hybrid_native_freshness_secs();
        }
    }
}
