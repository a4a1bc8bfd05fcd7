//! Measurement samples and the compact measurement codec.
//!
//! The compact format carries one flags byte, the 32-bit runtime id, the
//! value as a 32-bit float, and a timestamp that shrinks to a 2-byte
//! millisecond or 4-byte microsecond offset whenever a base-time offset
//! applies; otherwise the full 8-byte tick value (leap bits included) is
//! sent and the base-time flag is cleared.

use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

use crate::ticks;
use crate::{Error, Result};

/// One time-series sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Measurement {
    pub signal_id: Uuid,
    /// Ticks; bits 62-63 may carry leap-second metadata.
    pub timestamp: i64,
    pub flags: u32,
    pub value: f64,
}

/// Quality and provenance flags carried with each measurement.
pub mod state_flags {
    pub const NORMAL: u32 = 0x0000;
    pub const BAD_DATA: u32 = 0x0001;
    pub const SUSPECT_DATA: u32 = 0x0002;
    pub const OVER_RANGE_ERROR: u32 = 0x0004;
    pub const UNDER_RANGE_ERROR: u32 = 0x0008;
    pub const ALARM_HIGH: u32 = 0x0010;
    pub const ALARM_LOW: u32 = 0x0020;
    pub const WARNING_HIGH: u32 = 0x0040;
    pub const WARNING_LOW: u32 = 0x0080;
    pub const FLATLINE_ALARM: u32 = 0x0100;
    pub const COMPARISON_ALARM: u32 = 0x0200;
    pub const ROC_ALARM: u32 = 0x0400;
    pub const RECEIVED_AS_BAD: u32 = 0x0800;
    pub const CALCULATED_VALUE: u32 = 0x1000;
    pub const DISCARDED_VALUE: u32 = 0x2000;
    pub const RESERVED_QUALITY: u32 = 0x4000;
    pub const BAD_TIME: u32 = 0x8000;
    pub const SUSPECT_TIME: u32 = 0x1_0000;
}

/// Bits of the compact-format flags byte.
pub mod compact_flags {
    pub const DATA_RANGE: u8 = 0x01;
    pub const DATA_QUALITY: u8 = 0x02;
    pub const TIME_QUALITY: u8 = 0x04;
    pub const SYSTEM_ISSUE: u8 = 0x08;
    pub const CALCULATED_VALUE: u8 = 0x10;
    pub const DISCARDED_VALUE: u8 = 0x20;
    pub const BASE_TIME_OFFSET: u8 = 0x40;
    pub const TIME_INDEX: u8 = 0x80;
}

/// Compact measurement serializer bound to one subscription's time settings.
#[derive(Clone, Copy, Debug)]
pub struct CompactMeasurement {
    base_time_offsets: [i64; 2],
    include_time: bool,
    use_millisecond_resolution: bool,
    time_index: u32,
}

impl CompactMeasurement {
    pub fn new(
        base_time_offsets: [i64; 2],
        include_time: bool,
        use_millisecond_resolution: bool,
        time_index: u32,
    ) -> Self {
        Self {
            base_time_offsets,
            include_time,
            use_millisecond_resolution,
            time_index: time_index & 1,
        }
    }

    /// Worst-case serialized size of one measurement.
    pub fn max_length(&self) -> usize {
        1 + 4 + 4 + if self.include_time { 8 } else { 0 }
    }

    /// Append one measurement to `out`, returning the serialized length.
    pub fn serialize(&self, measurement: &Measurement, runtime_id: i32, out: &mut BytesMut) -> usize {
        let start = out.len();
        let timestamp = measurement.timestamp;
        let base = self.base_time_offsets[self.time_index as usize];

        let mut flags = compress_state_flags(measurement.flags);
        let mut offset_time: Option<TimeField> = None;

        if self.include_time && base > 0 {
            let offset = (timestamp & ticks::VALUE_MASK) - base;
            if offset >= 0 {
                if self.use_millisecond_resolution {
                    let millis = offset / ticks::PER_MILLISECOND;
                    if millis <= i64::from(u16::MAX) {
                        offset_time = Some(TimeField::Millis(millis as u16));
                    }
                } else {
                    let micros = offset / ticks::PER_MICROSECOND;
                    if micros <= i64::from(u32::MAX) {
                        offset_time = Some(TimeField::Micros(micros as u32));
                    }
                }
            }
        }

        if offset_time.is_some() {
            flags |= compact_flags::BASE_TIME_OFFSET;
            if self.time_index == 1 {
                flags |= compact_flags::TIME_INDEX;
            }
        }

        out.put_u8(flags);
        out.put_i32(runtime_id);
        out.put_f32(measurement.value as f32);

        if self.include_time {
            match offset_time {
                Some(TimeField::Millis(millis)) => out.put_u16(millis),
                Some(TimeField::Micros(micros)) => out.put_u32(micros),
                None => out.put_u64(timestamp as u64),
            }
        }

        out.len() - start
    }

    /// Decode one measurement from `buf`. Returns the runtime id and the
    /// reconstructed sample with a nil signal id; the caller resolves the id
    /// through its signal index cache.
    pub fn deserialize(&self, buf: &mut impl Buf) -> Result<(i32, Measurement)> {
        if buf.remaining() < 9 {
            return Err(Error::MalformedPacket("truncated compact measurement".into()));
        }
        let flags = buf.get_u8();
        let runtime_id = buf.get_i32();
        let value = f64::from(buf.get_f32());

        let mut timestamp = 0i64;
        if self.include_time {
            if flags & compact_flags::BASE_TIME_OFFSET != 0 {
                let index = usize::from(flags & compact_flags::TIME_INDEX != 0);
                let base = self.base_time_offsets[index];
                if self.use_millisecond_resolution {
                    if buf.remaining() < 2 {
                        return Err(Error::MalformedPacket("truncated time offset".into()));
                    }
                    timestamp = base + i64::from(buf.get_u16()) * ticks::PER_MILLISECOND;
                } else {
                    if buf.remaining() < 4 {
                        return Err(Error::MalformedPacket("truncated time offset".into()));
                    }
                    timestamp = base + i64::from(buf.get_u32()) * ticks::PER_MICROSECOND;
                }
            } else {
                if buf.remaining() < 8 {
                    return Err(Error::MalformedPacket("truncated timestamp".into()));
                }
                timestamp = buf.get_u64() as i64;
            }
        }

        Ok((
            runtime_id,
            Measurement {
                signal_id: Uuid::nil(),
                timestamp,
                flags: expand_state_flags(flags),
                value,
            },
        ))
    }
}

enum TimeField {
    Millis(u16),
    Micros(u32),
}

/// Collapse full state flags into the six compact quality bits.
pub fn compress_state_flags(flags: u32) -> u8 {
    let mut compact = 0u8;
    if flags & (state_flags::OVER_RANGE_ERROR | state_flags::UNDER_RANGE_ERROR) != 0 {
        compact |= compact_flags::DATA_RANGE;
    }
    if flags & (state_flags::BAD_DATA | state_flags::SUSPECT_DATA | state_flags::RECEIVED_AS_BAD)
        != 0
    {
        compact |= compact_flags::DATA_QUALITY;
    }
    if flags & (state_flags::BAD_TIME | state_flags::SUSPECT_TIME) != 0 {
        compact |= compact_flags::TIME_QUALITY;
    }
    if flags
        & (state_flags::FLATLINE_ALARM
            | state_flags::COMPARISON_ALARM
            | state_flags::ROC_ALARM
            | state_flags::RESERVED_QUALITY)
        != 0
    {
        compact |= compact_flags::SYSTEM_ISSUE;
    }
    if flags & state_flags::CALCULATED_VALUE != 0 {
        compact |= compact_flags::CALCULATED_VALUE;
    }
    if flags & state_flags::DISCARDED_VALUE != 0 {
        compact |= compact_flags::DISCARDED_VALUE;
    }
    compact
}

/// Expand compact quality bits back into representative state flags.
pub fn expand_state_flags(compact: u8) -> u32 {
    let mut flags = state_flags::NORMAL;
    if compact & compact_flags::DATA_RANGE != 0 {
        flags |= state_flags::OVER_RANGE_ERROR;
    }
    if compact & compact_flags::DATA_QUALITY != 0 {
        flags |= state_flags::BAD_DATA;
    }
    if compact & compact_flags::TIME_QUALITY != 0 {
        flags |= state_flags::BAD_TIME;
    }
    if compact & compact_flags::SYSTEM_ISSUE != 0 {
        flags |= state_flags::FLATLINE_ALARM;
    }
    if compact & compact_flags::CALCULATED_VALUE != 0 {
        flags |= state_flags::CALCULATED_VALUE;
    }
    if compact & compact_flags::DISCARDED_VALUE != 0 {
        flags |= state_flags::DISCARDED_VALUE;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(timestamp: i64, flags: u32, value: f64) -> Measurement {
        Measurement {
            signal_id: Uuid::new_v4(),
            timestamp,
            flags,
            value,
        }
    }

    #[test]
    fn full_time_round_trip() {
        let codec = CompactMeasurement::new([0, 0], true, false, 0);
        let timestamp = ticks::from_unix(1_700_000_000, 123);
        let measurement = sample(timestamp, state_flags::BAD_TIME, 59.97);

        let mut out = BytesMut::new();
        let written = codec.serialize(&measurement, 7, &mut out);
        assert_eq!(written, 1 + 4 + 4 + 8);

        let mut buf = out.freeze();
        let (runtime_id, decoded) = codec.deserialize(&mut buf).expect("decode");
        assert_eq!(runtime_id, 7);
        assert_eq!(decoded.timestamp, timestamp);
        assert_eq!(decoded.flags & state_flags::BAD_TIME, state_flags::BAD_TIME);
        assert!((decoded.value - 59.97).abs() < 1e-4);
    }

    #[test]
    fn leap_second_bits_survive_full_time_encoding() {
        let codec = CompactMeasurement::new([0, 0], true, false, 0);
        let timestamp = ticks::set_leap_second(ticks::from_unix(1_700_000_000, 0));
        let measurement = sample(timestamp, state_flags::NORMAL, 1.0);

        let mut out = BytesMut::new();
        codec.serialize(&measurement, 1, &mut out);
        let (_, decoded) = codec.deserialize(&mut out.freeze()).expect("decode");
        assert!(ticks::is_leap_second(decoded.timestamp));
        assert_eq!(decoded.timestamp, timestamp);
    }

    #[test]
    fn microsecond_offset_against_base_time() {
        let base = ticks::from_unix(1_700_000_000, 0);
        let codec = CompactMeasurement::new([base, base + ticks::PER_MINUTE], true, false, 0);
        let timestamp = base + 1_500 * ticks::PER_MILLISECOND;
        let measurement = sample(timestamp, state_flags::NORMAL, 0.5);

        let mut out = BytesMut::new();
        let written = codec.serialize(&measurement, 3, &mut out);
        assert_eq!(written, 1 + 4 + 4 + 4);
        assert_ne!(out[0] & compact_flags::BASE_TIME_OFFSET, 0);
        assert_eq!(out[0] & compact_flags::TIME_INDEX, 0);

        let (_, decoded) = codec.deserialize(&mut out.freeze()).expect("decode");
        assert_eq!(decoded.timestamp, timestamp);
    }

    #[test]
    fn millisecond_offset_uses_two_bytes_and_time_index() {
        let base = ticks::from_unix(1_700_000_000, 0);
        let codec = CompactMeasurement::new([0, base], true, true, 1);
        let timestamp = base + 250 * ticks::PER_MILLISECOND;
        let measurement = sample(timestamp, state_flags::NORMAL, 2.0);

        let mut out = BytesMut::new();
        let written = codec.serialize(&measurement, 9, &mut out);
        assert_eq!(written, 1 + 4 + 4 + 2);
        assert_ne!(out[0] & compact_flags::TIME_INDEX, 0);

        let (_, decoded) = codec.deserialize(&mut out.freeze()).expect("decode");
        assert_eq!(decoded.timestamp, timestamp);
    }

    #[test]
    fn timestamp_before_base_falls_back_to_full_time() {
        let base = ticks::from_unix(1_700_000_000, 0);
        let codec = CompactMeasurement::new([base, 0], true, false, 0);
        let timestamp = base - ticks::PER_SECOND;
        let measurement = sample(timestamp, state_flags::NORMAL, 1.0);

        let mut out = BytesMut::new();
        let written = codec.serialize(&measurement, 0, &mut out);
        assert_eq!(written, codec.max_length());
        assert_eq!(out[0] & compact_flags::BASE_TIME_OFFSET, 0);
    }

    #[test]
    fn excluded_time_writes_nine_bytes() {
        let codec = CompactMeasurement::new([0, 0], false, false, 0);
        let measurement = sample(ticks::now(), state_flags::NORMAL, 42.0);
        let mut out = BytesMut::new();
        assert_eq!(codec.serialize(&measurement, 2, &mut out), 9);
    }

    #[test]
    fn state_flag_compression_is_stable() {
        let full = state_flags::BAD_DATA | state_flags::BAD_TIME | state_flags::CALCULATED_VALUE;
        let compact = compress_state_flags(full);
        let expanded = expand_state_flags(compact);
        assert_eq!(compress_state_flags(expanded), compact);
    }
}
