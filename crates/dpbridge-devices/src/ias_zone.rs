//! IAS zone status bits.

use dpbridge_core::{AttributeValue, CapabilityValue};

/// Cluster attribute carrying the zone status bitmap.
pub const ZONE_STATUS_ATTRIBUTE: &str = "zoneStatus";

/// Decoded IAS zone status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ZoneStatus(pub u16);

impl ZoneStatus {
    const ALARM_1: u16 = 0x0001;
    const ALARM_2: u16 = 0x0002;
    const TAMPER: u16 = 0x0004;
    const BATTERY_LOW: u16 = 0x0008;

    pub fn from_attribute(value: &AttributeValue) -> Option<Self> {
        let raw = value.as_f64()?;
        if raw < 0.0 || raw > u16::MAX as f64 || raw.fract() != 0.0 {
            return None;
        }
        Some(Self(raw as u16))
    }

    /// Either alarm bit set.
    pub fn alarm(self) -> bool {
        self.0 & (Self::ALARM_1 | Self::ALARM_2) != 0
    }

    pub fn tamper(self) -> bool {
        self.0 & Self::TAMPER != 0
    }

    pub fn battery_low(self) -> bool {
        self.0 & Self::BATTERY_LOW != 0
    }

    /// Secondary capabilities carried alongside the primary alarm.
    pub fn secondary_values(self) -> [(&'static str, CapabilityValue); 2] {
        [
            ("alarm_tamper", CapabilityValue::Bool(self.tamper())),
            ("alarm_battery", CapabilityValue::Bool(self.battery_low())),
        ]
    }
}
