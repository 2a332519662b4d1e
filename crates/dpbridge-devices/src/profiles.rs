//! Device profiles.
//!
//! A profile is the static description a driver hands to the engine at
//! attach: role, declared capabilities, declared bindings, enrichment trust
//! tier and calibration offsets. Profiles are plain serde data so hosts can
//! ship their own as JSON:
//!
//! ```json
//! {
//!   "name": "climate_sensor",
//!   "role": "sensor",
//!   "capabilities": ["measure_temperature", "measure_humidity"],
//!   "bindings": [
//!     {
//!       "key": {"source": "data_point", "dp": 1},
//!       "capability": "measure_temperature",
//!       "transform": {"kind": "divide", "divisor": 10.0},
//!       "origin": "declared",
//!       "dp_type": "value"
//!     }
//!   ],
//!   "trust": "safe",
//!   "calibration": {"measure_temperature": -0.5}
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use dpbridge_core::config::clusters;
use dpbridge_core::ClusterId;
use serde::{Deserialize, Serialize};

use crate::binding::{AmbiguityTable, CapabilityBinding, SourceKey};
use crate::codec::DpType;
use crate::enrichment::TrustTier;
use crate::ias_zone::ZONE_STATUS_ATTRIBUTE;
use crate::role::DeviceRole;
use crate::transform::ValueTransform;

/// Largest gang count a switch profile supports.
pub const MAX_GANGS: u8 = 8;

fn default_trust() -> TrustTier {
    TrustTier::Safe
}

/// Static device description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub role: DeviceRole,
    /// Capabilities the driver creates itself.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub bindings: Vec<CapabilityBinding>,
    #[serde(default = "default_trust")]
    pub trust: TrustTier,
    /// Offsets added to numeric values before they reach the host.
    #[serde(default)]
    pub calibration: BTreeMap<String, f64>,
    /// Overloaded keys for this profile; the engine default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ambiguity: Option<AmbiguityTable>,
}

impl DeviceProfile {
    pub fn new(name: impl Into<String>, role: DeviceRole) -> Self {
        Self {
            name: name.into(),
            role,
            capabilities: BTreeSet::new(),
            bindings: Vec::new(),
            trust: TrustTier::Safe,
            calibration: BTreeMap::new(),
            ambiguity: None,
        }
    }

    /// Declare a DataPoint binding and its capability.
    pub fn dp(mut self, dp: u8, ty: DpType, capability: &str, transform: ValueTransform) -> Self {
        self.capabilities.insert(capability.to_string());
        self.bindings.push(
            CapabilityBinding::declared(SourceKey::dp(dp), capability, transform).with_dp_type(ty),
        );
        self
    }

    /// Declare a native attribute binding and its capability.
    pub fn attribute(
        mut self,
        endpoint: u8,
        cluster: ClusterId,
        attribute: &str,
        capability: &str,
        transform: ValueTransform,
    ) -> Self {
        self.capabilities.insert(capability.to_string());
        self.bindings.push(CapabilityBinding::declared(
            SourceKey::attribute(endpoint, cluster, attribute),
            capability,
            transform,
        ));
        self
    }

    /// Declare a capability without a binding.
    pub fn capability(mut self, capability: &str) -> Self {
        self.capabilities.insert(capability.to_string());
        self
    }

    pub fn with_trust(mut self, trust: TrustTier) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_calibration(mut self, capability: &str, offset: f64) -> Self {
        self.calibration.insert(capability.to_string(), offset);
        self
    }

    pub fn with_ambiguity(mut self, ambiguity: AmbiguityTable) -> Self {
        self.ambiguity = Some(ambiguity);
        self
    }

    /// Calibration offset for a capability, zero when none is set.
    pub fn offset(&self, capability: &str) -> f64 {
        self.calibration.get(capability).copied().unwrap_or(0.0)
    }

    /// Parse a profile from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Temperature/humidity sensor on the overlay, with native fallbacks for
/// hybrid firmware.
pub fn climate_sensor() -> DeviceProfile {
    DeviceProfile::new("climate_sensor", DeviceRole::Sensor)
        .dp(1, DpType::Value, "measure_temperature", ValueTransform::divide(10.0))
        .dp(2, DpType::Value, "measure_humidity", ValueTransform::Identity)
        .dp(4, DpType::Value, "measure_battery", ValueTransform::Identity)
        .dp(14, DpType::Enum, "alarm_battery", ValueTransform::Boolean)
        .attribute(
            1,
            clusters::TEMPERATURE_MEASUREMENT,
            "measuredValue",
            "measure_temperature",
            ValueTransform::DivideRound { divisor: 100.0, decimals: 1 },
        )
        .attribute(
            1,
            clusters::RELATIVE_HUMIDITY,
            "measuredValue",
            "measure_humidity",
            ValueTransform::DivideRound { divisor: 100.0, decimals: 1 },
        )
        .attribute(
            1,
            clusters::POWER_CONFIGURATION,
            "batteryPercentageRemaining",
            "measure_battery",
            ValueTransform::BatteryHalfPercent,
        )
}

pub fn soil_sensor() -> DeviceProfile {
    DeviceProfile::new("soil_sensor", DeviceRole::Sensor)
        .dp(3, DpType::Value, "measure_humidity", ValueTransform::Identity)
        .dp(5, DpType::Value, "measure_temperature", ValueTransform::divide(10.0))
        .dp(15, DpType::Value, "measure_battery", ValueTransform::Identity)
}

/// Mains-powered mmWave presence radar.
pub fn radar_presence() -> DeviceProfile {
    let states = BTreeMap::from([
        (0, "none".to_string()),
        (1, "presence".to_string()),
        (2, "move".to_string()),
    ]);
    DeviceProfile::new("radar_presence", DeviceRole::Presence)
        .dp(1, DpType::Bool, "alarm_motion", ValueTransform::Boolean)
        .dp(9, DpType::Value, "measure_distance", ValueTransform::divide(100.0))
        .dp(101, DpType::Enum, "radar_presence_state", ValueTransform::EnumLabel { labels: states })
        .dp(104, DpType::Value, "measure_luminance", ValueTransform::Identity)
}

/// IAS zone contact sensor. Tamper and low battery come from the same
/// zone status word.
pub fn contact_sensor() -> DeviceProfile {
    DeviceProfile::new("contact_sensor", DeviceRole::Sensor)
        .attribute(
            1,
            clusters::IAS_ZONE,
            ZONE_STATUS_ATTRIBUTE,
            "alarm_contact",
            ValueTransform::BitMask { mask: 0x0003 },
        )
        .capability("alarm_tamper")
        .capability("alarm_battery")
        .attribute(
            1,
            clusters::POWER_CONFIGURATION,
            "batteryPercentageRemaining",
            "measure_battery",
            ValueTransform::BatteryHalfPercent,
        )
}

/// Wall switch with `gangs` relays. Gang 1 is `onoff`, the others
/// `onoff.gangN`. Each gang has a boolean DataPoint and an On/Off endpoint.
pub fn switch_gangs(gangs: u8) -> DeviceProfile {
    let gangs = gangs.clamp(1, MAX_GANGS);
    let mut profile = DeviceProfile::new(format!("switch_{}gang", gangs), DeviceRole::Switch);
    for gang in 1..=gangs {
        let capability = gang_capability(gang);
        profile = profile
            .dp(gang, DpType::Bool, &capability, ValueTransform::Boolean)
            .attribute(gang, clusters::ON_OFF, "onOff", &capability, ValueTransform::Boolean);
    }
    profile
}

/// Capability name of a switch gang.
pub fn gang_capability(gang: u8) -> String {
    if gang <= 1 {
        "onoff".to_string()
    } else {
        format!("onoff.gang{}", gang)
    }
}

/// Metering plug.
pub fn smart_plug() -> DeviceProfile {
    DeviceProfile::new("smart_plug", DeviceRole::Plug)
        .dp(1, DpType::Bool, "onoff", ValueTransform::Boolean)
        .dp(17, DpType::Value, "measure_current", ValueTransform::divide(1000.0))
        .dp(18, DpType::Value, "measure_power", ValueTransform::divide(10.0))
        .dp(19, DpType::Value, "measure_voltage", ValueTransform::divide(10.0))
        .attribute(1, clusters::ON_OFF, "onOff", "onoff", ValueTransform::Boolean)
}

/// Fallback driver for unknown hardware: nothing declared, full enrichment.
pub fn generic() -> DeviceProfile {
    DeviceProfile::new("generic", DeviceRole::Generic).with_trust(TrustTier::Full)
}

/// Names accepted by [`builtin`].
pub fn builtin_names() -> Vec<&'static str> {
    vec![
        "climate_sensor",
        "soil_sensor",
        "radar_presence",
        "contact_sensor",
        "switch_1gang",
        "switch_2gang",
        "switch_3gang",
        "switch_4gang",
        "smart_plug",
        "generic",
    ]
}

/// Look up a built-in profile by name.
pub fn builtin(name: &str) -> Option<DeviceProfile> {
    match name {
        "climate_sensor" => Some(climate_sensor()),
        "soil_sensor" => Some(soil_sensor()),
        "radar_presence" => Some(radar_presence()),
        "contact_sensor" => Some(contact_sensor()),
        "smart_plug" => Some(smart_plug()),
        "generic" => Some(generic()),
        other => other
            .strip_prefix("switch_")
            .and_then(|rest| rest.strip_suffix("gang"))
            .and_then(|n| n.parse::<u8>().ok())
            .filter(|n| (1..=MAX_GANGS).contains(n))
            .map(switch_gangs),
    }
}

/// A secondary signal a capability can be computed from when its direct
/// read fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedSource {
    pub capability: String,
    pub cluster: ClusterId,
    pub attribute: String,
    pub transform: ValueTransform,
}

/// Known secondary signals.
pub fn derived_sources() -> Vec<DerivedSource> {
    vec![DerivedSource {
        capability: "measure_battery".to_string(),
        cluster: clusters::POWER_CONFIGURATION,
        attribute: "batteryVoltage".to_string(),
        transform: ValueTransform::battery_voltage(),
    }]
}
