//! Device roles.

use serde::{Deserialize, Serialize};

/// Closed set of device kinds. Drives enrichment exclusions and value
/// sanity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Switch,
    Plug,
    Light,
    Cover,
    Sensor,
    /// Mains-powered presence radar.
    Presence,
    Button,
    Thermostat,
    Generic,
}

/// How a role is usually powered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerSource {
    Mains,
    Battery,
    Unknown,
}

impl DeviceRole {
    pub fn power_source(self) -> PowerSource {
        match self {
            DeviceRole::Switch
            | DeviceRole::Plug
            | DeviceRole::Light
            | DeviceRole::Cover
            | DeviceRole::Presence => PowerSource::Mains,
            DeviceRole::Sensor | DeviceRole::Button | DeviceRole::Thermostat => PowerSource::Battery,
            DeviceRole::Generic => PowerSource::Unknown,
        }
    }

    /// Whether the role drives a load.
    pub fn is_actuator(self) -> bool {
        matches!(
            self,
            DeviceRole::Switch
                | DeviceRole::Plug
                | DeviceRole::Light
                | DeviceRole::Cover
                | DeviceRole::Thermostat
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceRole::Switch => "switch",
            DeviceRole::Plug => "plug",
            DeviceRole::Light => "light",
            DeviceRole::Cover => "cover",
            DeviceRole::Sensor => "sensor",
            DeviceRole::Presence => "presence",
            DeviceRole::Button => "button",
            DeviceRole::Thermostat => "thermostat",
            DeviceRole::Generic => "generic",
        }
    }
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
