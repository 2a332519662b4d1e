//! DataPoint codec for the proprietary overlay protocol.
//!
//! Frames are packed back-to-back inside the payload of the proprietary
//! cluster:
//!
//! ```text
//! +--------+----------+----------------------+-------------------+
//! | id: u8 | type: u8 | len: u16 BE | u8     | payload: [u8; len] |
//! +--------+----------+----------------------+-------------------+
//! ```
//!
//! The length field is two bytes (big-endian) for `Value` and `Bitmap`
//! frames and one byte for every other type. Numeric payloads are
//! big-endian. Decoding never panics and never reads past the buffer: a
//! declared length that overruns the buffer ends iteration with
//! [`DecodeError::Truncated`].

use dpbridge_core::AttributeValue;
use serde::{Deserialize, Serialize};

/// DataPoint type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DpType {
    Raw = 0,
    Bool = 1,
    Value = 2,
    String = 3,
    Enum = 4,
    Bitmap = 5,
}

impl DpType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DpType::Raw),
            1 => Some(DpType::Bool),
            2 => Some(DpType::Value),
            3 => Some(DpType::String),
            4 => Some(DpType::Enum),
            5 => Some(DpType::Bitmap),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Whether the length field is two bytes wide.
    pub fn has_wide_length(self) -> bool {
        matches!(self, DpType::Value | DpType::Bitmap)
    }

    fn length_field_size(self) -> usize {
        if self.has_wide_length() {
            2
        } else {
            1
        }
    }

    fn accepts_length(self, len: usize) -> bool {
        match self {
            DpType::Raw | DpType::String => true,
            DpType::Bool | DpType::Enum => len == 1,
            DpType::Value => len == 4,
            DpType::Bitmap => matches!(len, 1 | 2 | 4),
        }
    }
}

impl std::str::FromStr for DpType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(DpType::Raw),
            "bool" => Ok(DpType::Bool),
            "value" => Ok(DpType::Value),
            "string" => Ok(DpType::String),
            "enum" => Ok(DpType::Enum),
            "bitmap" => Ok(DpType::Bitmap),
            other => Err(format!("unknown DP type: {}", other)),
        }
    }
}

/// Typed DataPoint payload. The variant determines the type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum DpValue {
    Raw(Vec<u8>),
    Bool(bool),
    Value(i32),
    /// Raw bytes; encoding is not validated.
    String(Vec<u8>),
    Enum(u8),
    Bitmap(u32),
}

impl DpValue {
    pub fn dp_type(&self) -> DpType {
        match self {
            DpValue::Raw(_) => DpType::Raw,
            DpValue::Bool(_) => DpType::Bool,
            DpValue::Value(_) => DpType::Value,
            DpValue::String(_) => DpType::String,
            DpValue::Enum(_) => DpType::Enum,
            DpValue::Bitmap(_) => DpType::Bitmap,
        }
    }

    /// Parse a payload whose length has already been bounds-checked.
    /// Returns `None` when the length does not fit the type.
    fn from_payload(ty: DpType, payload: &[u8]) -> Option<Self> {
        if !ty.accepts_length(payload.len()) {
            return None;
        }
        let value = match ty {
            DpType::Raw => DpValue::Raw(payload.to_vec()),
            DpType::Bool => DpValue::Bool(payload[0] != 0),
            DpType::Value => {
                DpValue::Value(i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
            }
            DpType::String => DpValue::String(payload.to_vec()),
            DpType::Enum => DpValue::Enum(payload[0]),
            DpType::Bitmap => DpValue::Bitmap(
                payload
                    .iter()
                    .fold(0u32, |acc, byte| (acc << 8) | *byte as u32),
            ),
        };
        Some(value)
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            DpValue::Raw(bytes) | DpValue::String(bytes) => bytes.clone(),
            DpValue::Bool(b) => vec![u8::from(*b)],
            DpValue::Value(v) => v.to_be_bytes().to_vec(),
            DpValue::Enum(e) => vec![*e],
            DpValue::Bitmap(b) => b.to_be_bytes().to_vec(),
        }
    }

    /// Lower into the attribute value model shared with native reports.
    ///
    /// String payloads that are valid UTF-8 become text, others stay bytes.
    pub fn to_attribute(&self) -> AttributeValue {
        match self {
            DpValue::Raw(bytes) => AttributeValue::Bytes(bytes.clone()),
            DpValue::Bool(b) => AttributeValue::Bool(*b),
            DpValue::Value(v) => AttributeValue::Int(*v as i64),
            DpValue::String(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => AttributeValue::Text(s.to_string()),
                Err(_) => AttributeValue::Bytes(bytes.clone()),
            },
            DpValue::Enum(e) => AttributeValue::Int(*e as i64),
            DpValue::Bitmap(b) => AttributeValue::Int(*b as i64),
        }
    }

    /// Build a value of the given type from an attribute value, for writes.
    pub fn from_attribute(ty: DpType, value: &AttributeValue) -> Option<Self> {
        match ty {
            DpType::Bool => value.as_bool().map(DpValue::Bool),
            DpType::Value => value
                .as_f64()
                .filter(|v| v.is_finite())
                .map(|v| DpValue::Value(v.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32)),
            DpType::Enum => value
                .as_f64()
                .filter(|v| (0.0..=255.0).contains(v))
                .map(|v| DpValue::Enum(v as u8)),
            DpType::Bitmap => value
                .as_f64()
                .filter(|v| (0.0..=u32::MAX as f64).contains(v))
                .map(|v| DpValue::Bitmap(v as u32)),
            DpType::String => match value {
                AttributeValue::Text(s) => Some(DpValue::String(s.as_bytes().to_vec())),
                AttributeValue::Bytes(b) => Some(DpValue::String(b.clone())),
                _ => None,
            },
            DpType::Raw => match value {
                AttributeValue::Bytes(b) => Some(DpValue::Raw(b.clone())),
                _ => None,
            },
        }
    }
}

/// A single decoded DataPoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataPointFrame {
    pub id: u8,
    pub value: DpValue,
}

impl DataPointFrame {
    pub fn new(id: u8, value: DpValue) -> Self {
        Self { id, value }
    }

    pub fn dp_type(&self) -> DpType {
        self.value.dp_type()
    }
}

/// Decode error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The buffer ends before the frame does.
    #[error("Truncated frame at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Type tag outside the known set.
    #[error("Unknown type tag 0x{tag:02X} for DP {dp} at offset {offset}")]
    UnknownType { offset: usize, dp: u8, tag: u8 },

    /// Complete frame whose length does not fit its type.
    #[error("Invalid length {len} for {ty:?} DP {dp} at offset {offset}")]
    InvalidLength {
        offset: usize,
        dp: u8,
        ty: DpType,
        len: usize,
    },
}

impl DecodeError {
    /// Whether iteration stops after this error.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DecodeError::InvalidLength { .. })
    }
}

/// Encode error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("Payload of {len} bytes for DP {dp} exceeds {max} bytes")]
    PayloadTooLong { dp: u8, len: usize, max: usize },
}

/// Lazy iterator over the frames of a buffer.
///
/// Yields `Err` for malformed frames. After a terminal error (truncation,
/// unknown type) it yields `None`. Cloning restarts from the clone point;
/// [`FrameIter::new`] restarts from the beginning.
#[derive(Debug, Clone)]
pub struct FrameIter<'a> {
    buf: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> FrameIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            done: false,
        }
    }

    /// Byte offset of the next frame.
    pub fn offset(&self) -> usize {
        self.pos
    }

    fn fail(&mut self, err: DecodeError) -> Option<Result<DataPointFrame, DecodeError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<DataPointFrame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.buf.len() {
            return None;
        }

        let offset = self.pos;
        let rest = &self.buf[offset..];
        if rest.len() < 2 {
            return self.fail(DecodeError::Truncated {
                offset,
                needed: 2,
                available: rest.len(),
            });
        }

        let id = rest[0];
        let ty = match DpType::from_tag(rest[1]) {
            Some(ty) => ty,
            None => {
                return self.fail(DecodeError::UnknownType {
                    offset,
                    dp: id,
                    tag: rest[1],
                })
            }
        };

        let header = 2 + ty.length_field_size();
        if rest.len() < header {
            return self.fail(DecodeError::Truncated {
                offset,
                needed: header,
                available: rest.len(),
            });
        }

        let len = if ty.has_wide_length() {
            u16::from_be_bytes([rest[2], rest[3]]) as usize
        } else {
            rest[2] as usize
        };
        let total = header + len;
        if rest.len() < total {
            return self.fail(DecodeError::Truncated {
                offset,
                needed: total,
                available: rest.len(),
            });
        }

        self.pos += total;
        match DpValue::from_payload(ty, &rest[header..total]) {
            Some(value) => Some(Ok(DataPointFrame { id, value })),
            None => Some(Err(DecodeError::InvalidLength {
                offset,
                dp: id,
                ty,
                len,
            })),
        }
    }
}

/// Frames and errors from one buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeReport {
    pub frames: Vec<DataPointFrame>,
    pub errors: Vec<DecodeError>,
}

impl DecodeReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Strict view: all frames, or the first error.
    pub fn into_result(self) -> Result<Vec<DataPointFrame>, DecodeError> {
        match self.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(self.frames),
        }
    }
}

/// Iterate the frames of a buffer lazily.
pub fn frames(buf: &[u8]) -> FrameIter<'_> {
    FrameIter::new(buf)
}

/// Decode a whole buffer, keeping every well-formed frame.
pub fn decode(buf: &[u8]) -> DecodeReport {
    let mut report = DecodeReport::default();
    for item in FrameIter::new(buf) {
        match item {
            Ok(frame) => report.frames.push(frame),
            Err(err) => report.errors.push(err),
        }
    }
    report
}

/// Encode one DataPoint.
pub fn encode(id: u8, value: &DpValue) -> Result<Vec<u8>, EncodeError> {
    let ty = value.dp_type();
    let payload = value.payload();
    let max = if ty.has_wide_length() {
        u16::MAX as usize
    } else {
        u8::MAX as usize
    };
    if payload.len() > max {
        return Err(EncodeError::PayloadTooLong {
            dp: id,
            len: payload.len(),
            max,
        });
    }

    let mut out = Vec::with_capacity(2 + ty.length_field_size() + payload.len());
    out.push(id);
    out.push(ty.tag());
    if ty.has_wide_length() {
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.push(payload.len() as u8);
    }
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Encode several frames back-to-back.
pub fn encode_frames(frames: &[DataPointFrame]) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend(encode(frame.id, &frame.value)?);
    }
    Ok(out)
}
