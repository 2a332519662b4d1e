//! Value transforms between raw values and capability values.

use std::collections::BTreeMap;

use dpbridge_core::{AttributeValue, CapabilityValue};
use serde::{Deserialize, Serialize};

/// Pure mapping from a raw value to a capability value.
///
/// `apply` returns `None` when the raw value has the wrong shape or the
/// result is not finite; callers drop such values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueTransform {
    /// Pass numbers, booleans and text through unchanged.
    Identity,
    /// `v / divisor`
    Divide { divisor: f64 },
    /// `v / divisor`, rounded to `decimals` places.
    DivideRound { divisor: f64, decimals: u32 },
    /// `v * scale + offset`
    Linear { scale: f64, offset: f64 },
    /// Any nonzero value is `true`.
    Boolean,
    /// Any nonzero value is `false`.
    InvertBoolean,
    /// Battery percentage reported in half-percent steps (0..=200).
    BatteryHalfPercent,
    /// Battery percentage derived from a voltage reading.
    /// `raw / divisor` gives volts; `empty_v..full_v` maps to 0..100 %.
    BatteryVoltage {
        divisor: f64,
        empty_v: f64,
        full_v: f64,
    },
    /// `true` when any bit of `mask` is set.
    BitMask { mask: u32 },
    /// Level 0..=254 to 0.0..=1.0.
    LevelToUnit,
    /// Illuminance in `10000 * log10(lux) + 1` units to lux.
    LogLux,
    /// Enumerated value to a text label.
    EnumLabel { labels: BTreeMap<i64, String> },
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

fn finite_number(value: f64) -> Option<CapabilityValue> {
    if value.is_finite() {
        Some(CapabilityValue::Number(value))
    } else {
        None
    }
}

fn int_or_float(value: f64) -> Option<AttributeValue> {
    if !value.is_finite() {
        return None;
    }
    let rounded = value.round();
    if (value - rounded).abs() < 1e-9 && rounded.abs() < i64::MAX as f64 {
        Some(AttributeValue::Int(rounded as i64))
    } else {
        Some(AttributeValue::Float(value))
    }
}

impl ValueTransform {
    pub fn divide(divisor: f64) -> Self {
        ValueTransform::Divide { divisor }
    }

    /// Default battery voltage curve for CR2032/AAA cells: 2.0 V empty,
    /// 3.0 V full, reported in decivolts.
    pub fn battery_voltage() -> Self {
        ValueTransform::BatteryVoltage {
            divisor: 10.0,
            empty_v: 2.0,
            full_v: 3.0,
        }
    }

    /// Whether the transform yields booleans.
    pub fn is_boolean(&self) -> bool {
        matches!(
            self,
            ValueTransform::Boolean | ValueTransform::InvertBoolean | ValueTransform::BitMask { .. }
        )
    }

    pub fn apply(&self, raw: &AttributeValue) -> Option<CapabilityValue> {
        match self {
            ValueTransform::Identity => match raw {
                AttributeValue::Bool(b) => Some(CapabilityValue::Bool(*b)),
                AttributeValue::Text(s) => Some(CapabilityValue::Text(s.clone())),
                AttributeValue::Bytes(_) => None,
                other => other.as_f64().and_then(finite_number),
            },
            ValueTransform::Divide { divisor } => {
                raw.as_f64().and_then(|v| finite_number(v / divisor))
            }
            ValueTransform::DivideRound { divisor, decimals } => raw
                .as_f64()
                .and_then(|v| finite_number(round_to(v / divisor, *decimals))),
            ValueTransform::Linear { scale, offset } => {
                raw.as_f64().and_then(|v| finite_number(v * scale + offset))
            }
            ValueTransform::Boolean => raw.as_bool().map(CapabilityValue::Bool),
            ValueTransform::InvertBoolean => raw.as_bool().map(|b| CapabilityValue::Bool(!b)),
            ValueTransform::BatteryHalfPercent => raw
                .as_f64()
                .filter(|v| v.is_finite())
                .map(|v| CapabilityValue::Number((v / 2.0).clamp(0.0, 100.0).round())),
            ValueTransform::BatteryVoltage {
                divisor,
                empty_v,
                full_v,
            } => {
                let volts = raw.as_f64()? / divisor;
                let pct = (volts - empty_v) / (full_v - empty_v) * 100.0;
                if pct.is_finite() {
                    Some(CapabilityValue::Number(pct.clamp(0.0, 100.0).round()))
                } else {
                    None
                }
            }
            ValueTransform::BitMask { mask } => raw
                .as_f64()
                .filter(|v| *v >= 0.0 && v.fract() == 0.0 && *v <= u32::MAX as f64)
                .map(|v| CapabilityValue::Bool((v as u32) & mask != 0)),
            ValueTransform::LevelToUnit => raw
                .as_f64()
                .and_then(|v| finite_number(round_to((v / 254.0).clamp(0.0, 1.0), 3))),
            ValueTransform::LogLux => raw.as_f64().and_then(|v| {
                if v <= 0.0 {
                    return Some(CapabilityValue::Number(0.0));
                }
                finite_number(10f64.powf((v - 1.0) / 10000.0).round())
            }),
            ValueTransform::EnumLabel { labels } => {
                let key = raw.as_f64().filter(|v| v.fract() == 0.0)? as i64;
                labels.get(&key).cloned().map(CapabilityValue::Text)
            }
        }
    }

    /// Map a capability value back to a raw value, for writes.
    ///
    /// Returns `None` for read-only transforms.
    pub fn invert(&self, value: &CapabilityValue) -> Option<AttributeValue> {
        match self {
            ValueTransform::Identity => match value {
                CapabilityValue::Bool(b) => Some(AttributeValue::Bool(*b)),
                CapabilityValue::Number(n) => int_or_float(*n),
                CapabilityValue::Text(s) => Some(AttributeValue::Text(s.clone())),
            },
            ValueTransform::Divide { divisor } | ValueTransform::DivideRound { divisor, .. } => {
                value.as_f64().and_then(|v| int_or_float((v * divisor).round()))
            }
            ValueTransform::Linear { scale, offset } => {
                if *scale == 0.0 {
                    return None;
                }
                value.as_f64().and_then(|v| int_or_float((v - offset) / scale))
            }
            ValueTransform::Boolean => value.as_bool().map(AttributeValue::Bool),
            ValueTransform::InvertBoolean => value.as_bool().map(|b| AttributeValue::Bool(!b)),
            ValueTransform::LevelToUnit => value
                .as_f64()
                .and_then(|v| int_or_float((v.clamp(0.0, 1.0) * 254.0).round())),
            ValueTransform::EnumLabel { labels } => match value {
                CapabilityValue::Text(label) => labels
                    .iter()
                    .find(|(_, l)| *l == label)
                    .map(|(k, _)| AttributeValue::Int(*k)),
                _ => None,
            },
            ValueTransform::BatteryHalfPercent
            | ValueTransform::BatteryVoltage { .. }
            | ValueTransform::BitMask { .. }
            | ValueTransform::LogLux => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divide() {
        let t = ValueTransform::divide(10.0);
        assert_eq!(t.apply(&AttributeValue::Int(150)), Some(CapabilityValue::Number(15.0)));
        assert_eq!(t.invert(&CapabilityValue::Number(21.5)), Some(AttributeValue::Int(215)));
    }

    #[test]
    fn test_non_finite_is_dropped() {
        let t = ValueTransform::divide(0.0);
        assert_eq!(t.apply(&AttributeValue::Int(5)), None);
        assert_eq!(t.apply(&AttributeValue::Int(0)), None);
        assert_eq!(
            ValueTransform::Identity.apply(&AttributeValue::Float(f64::NAN)),
            None
        );
    }

    #[test]
    fn test_divide_round() {
        let t = ValueTransform::DivideRound {
            divisor: 100.0,
            decimals: 1,
        };
        assert_eq!(t.apply(&AttributeValue::Int(2156)), Some(CapabilityValue::Number(21.6)));
    }

    #[test]
    fn test_boolean_transforms() {
        assert_eq!(
            ValueTransform::Boolean.apply(&AttributeValue::Int(2)),
            Some(CapabilityValue::Bool(true))
        );
        assert_eq!(
            ValueTransform::InvertBoolean.apply(&AttributeValue::Bool(true)),
            Some(CapabilityValue::Bool(false))
        );
        assert_eq!(
            ValueTransform::InvertBoolean.invert(&CapabilityValue::Bool(true)),
            Some(AttributeValue::Bool(false))
        );
    }

    #[test]
    fn test_battery_transforms() {
        assert_eq!(
            ValueTransform::BatteryHalfPercent.apply(&AttributeValue::Int(200)),
            Some(CapabilityValue::Number(100.0))
        );
        assert_eq!(
            ValueTransform::BatteryHalfPercent.apply(&AttributeValue::Int(97)),
            Some(CapabilityValue::Number(49.0))
        );
        let t = ValueTransform::battery_voltage();
        assert_eq!(t.apply(&AttributeValue::Int(25)), Some(CapabilityValue::Number(50.0)));
        assert_eq!(t.apply(&AttributeValue::Int(35)), Some(CapabilityValue::Number(100.0)));
        assert_eq!(t.apply(&AttributeValue::Int(18)), Some(CapabilityValue::Number(0.0)));
        assert_eq!(t.invert(&CapabilityValue::Number(50.0)), None);
    }

    #[test]
    fn test_bit_mask() {
        let t = ValueTransform::BitMask { mask: 0x03 };
        assert_eq!(t.apply(&AttributeValue::Int(0x02)), Some(CapabilityValue::Bool(true)));
        assert_eq!(t.apply(&AttributeValue::Int(0x04)), Some(CapabilityValue::Bool(false)));
        assert!(t.is_boolean());
    }

    #[test]
    fn test_level_to_unit() {
        let t = ValueTransform::LevelToUnit;
        assert_eq!(t.apply(&AttributeValue::Int(254)), Some(CapabilityValue::Number(1.0)));
        assert_eq!(t.invert(&CapabilityValue::Number(0.5)), Some(AttributeValue::Int(127)));
    }

    #[test]
    fn test_log_lux() {
        let t = ValueTransform::LogLux;
        assert_eq!(t.apply(&AttributeValue::Int(0)), Some(CapabilityValue::Number(0.0)));
        assert_eq!(t.apply(&AttributeValue::Int(20001)), Some(CapabilityValue::Number(100.0)));
    }

    #[test]
    fn test_enum_label() {
        let t = ValueTransform::EnumLabel {
            labels: BTreeMap::from([(0, "low".to_string()), (1, "high".to_string())]),
        };
        assert_eq!(
            t.apply(&AttributeValue::Int(1)),
            Some(CapabilityValue::Text("high".into()))
        );
        assert_eq!(t.apply(&AttributeValue::Int(7)), None);
        assert_eq!(
            t.invert(&CapabilityValue::Text("low".into())),
            Some(AttributeValue::Int(0))
        );
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_value(ValueTransform::divide(10.0)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "divide", "divisor": 10.0}));
    }
}
