//! Raw attribute values and semantic capability values.

use serde::{Deserialize, Serialize};

/// A raw value as delivered by the transport, before any transform.
///
/// Overlay frames are lowered into this type as well, so bindings from
/// either protocol path are resolved through the same transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl AttributeValue {
    /// Numeric view of the value. Booleans map to 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            AttributeValue::Int(i) => Some(*i as f64),
            AttributeValue::Float(f) => Some(*f),
            AttributeValue::Text(s) => s.trim().parse().ok(),
            AttributeValue::Bytes(_) => None,
        }
    }

    /// Truthiness: any nonzero number is true.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            AttributeValue::Bytes(b) => Some(b.iter().any(|byte| *byte != 0)),
            AttributeValue::Text(s) => match s.trim() {
                "true" | "on" | "1" => Some(true),
                "false" | "off" | "0" => Some(false),
                _ => None,
            },
            other => other.as_f64().map(|v| v != 0.0),
        }
    }

    /// True when the value could only carry an on/off meaning.
    pub fn is_boolean_like(&self) -> bool {
        match self {
            AttributeValue::Bool(_) => true,
            AttributeValue::Int(i) => *i == 0 || *i == 1,
            AttributeValue::Float(f) => *f == 0.0 || *f == 1.0,
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Int(_) => "int",
            AttributeValue::Float(_) => "float",
            AttributeValue::Text(_) => "text",
            AttributeValue::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Int(v as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

/// A value pushed to a capability channel on the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CapabilityValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CapabilityValue::Number(n) => Some(*n),
            CapabilityValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            CapabilityValue::Text(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CapabilityValue::Bool(b) => Some(*b),
            CapabilityValue::Number(n) => Some(*n != 0.0),
            CapabilityValue::Text(_) => None,
        }
    }

    /// Numbers must be finite; other variants always are.
    pub fn is_finite(&self) -> bool {
        match self {
            CapabilityValue::Number(n) => n.is_finite(),
            _ => true,
        }
    }
}

impl From<bool> for CapabilityValue {
    fn from(v: bool) -> Self {
        CapabilityValue::Bool(v)
    }
}

impl From<f64> for CapabilityValue {
    fn from(v: f64) -> Self {
        CapabilityValue::Number(v)
    }
}

impl From<String> for CapabilityValue {
    fn from(v: String) -> Self {
        CapabilityValue::Text(v)
    }
}

impl std::fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityValue::Bool(b) => write!(f, "{}", b),
            CapabilityValue::Number(n) => write!(f, "{}", n),
            CapabilityValue::Text(s) => write!(f, "{}", s),
        }
    }
}
