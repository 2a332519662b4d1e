//! Outbound overlay commands.
//!
//! Commands sent on the proprietary cluster carry a 16-bit big-endian
//! sequence number followed by packed DataPoint frames:
//!
//! ```text
//! +-----------+----------------------------+
//! | seq: u16  | frame | frame | ...        |
//! +-----------+----------------------------+
//! ```

use std::sync::atomic::{AtomicU16, Ordering};

use chrono::{DateTime, Datelike, TimeZone, Timelike};

use crate::codec::{self, DataPointFrame, DecodeError, DecodeReport, DpValue, EncodeError};

/// DataPoint used for the clock synchronisation payload.
pub const TIME_SYNC_DP: u8 = 0x24;

/// DataPoints queried once after start so overlay and hybrid devices report
/// their climate, soil, presence and battery state without waiting for the
/// next unsolicited frame.
pub const CRITICAL_DATA_POINTS: &[u8] = &[1, 2, 3, 4, 5, 9, 14, 15, 101, 102];

/// Sequence number source for one device.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU16);

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number, wrapping at `u16::MAX`.
    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Sequenced command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub seq: u16,
    pub frames: Vec<DataPointFrame>,
}

impl Envelope {
    pub fn new(seq: u16, frames: Vec<DataPointFrame>) -> Self {
        Self { seq, frames }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = self.seq.to_be_bytes().to_vec();
        out.extend(codec::encode_frames(&self.frames)?);
        Ok(out)
    }

    /// Decode an envelope. Frame errors are reported alongside the frames.
    pub fn decode(buf: &[u8]) -> Result<(u16, DecodeReport), DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::Truncated {
                offset: 0,
                needed: 2,
                available: buf.len(),
            });
        }
        let seq = u16::from_be_bytes([buf[0], buf[1]]);
        Ok((seq, codec::decode(&buf[2..])))
    }
}

/// Frame asking the device to report the current value of a DataPoint.
pub fn query_frame(dp: u8) -> DataPointFrame {
    DataPointFrame::new(dp, DpValue::Raw(Vec::new()))
}

/// Clock synchronisation frame.
///
/// Payload: `[year - 2000, month, day, hour, minute, second, weekday]`
/// with Monday as weekday 0.
pub fn time_sync_frame<Tz: TimeZone>(now: &DateTime<Tz>) -> DataPointFrame {
    let year = (now.year() - 2000).clamp(0, u8::MAX as i32) as u8;
    let payload = vec![
        year,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
        now.weekday().num_days_from_monday() as u8,
    ];
    DataPointFrame::new(TIME_SYNC_DP, DpValue::Raw(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_envelope_layout() {
        let env = Envelope::new(0x0102, vec![DataPointFrame::new(1, DpValue::Bool(true))]);
        let bytes = env.encode().unwrap();
        assert_eq!(bytes, vec![0x01, 0x02, 0x01, 0x01, 0x01, 0x01]);

        let (seq, report) = Envelope::decode(&bytes).unwrap();
        assert_eq!(seq, 0x0102);
        assert_eq!(report.frames, env.frames);
    }

    #[test]
    fn test_envelope_too_short() {
        assert!(matches!(
            Envelope::decode(&[0x01]),
            Err(DecodeError::Truncated { needed: 2, .. })
        ));
    }

    #[test]
    fn test_sequence_wraps() {
        let counter = SequenceCounter(AtomicU16::new(u16::MAX));
        assert_eq!(counter.next(), u16::MAX);
        assert_eq!(counter.next(), 0);
    }

    #[test]
    fn test_time_sync_payload() {
        // 2024-03-04 was a Monday.
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 13, 5, 9).unwrap();
        let frame = time_sync_frame(&now);
        assert_eq!(frame.id, TIME_SYNC_DP);
        assert_eq!(frame.value, DpValue::Raw(vec![24, 3, 4, 13, 5, 9, 0]));
    }

    #[test]
    fn test_query_frame_encoding() {
        let bytes = codec::encode(7, &query_frame(7).value).unwrap();
        assert_eq!(bytes, vec![0x07, 0x00, 0x00]);
    }
}
