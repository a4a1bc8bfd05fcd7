//! Tick time model.
//!
//! A tick is 100 ns since 0001-01-01 00:00:00 UTC, carried as a signed 64-bit
//! value. The two high bits are reserved for leap-second metadata: bit 63
//! flags a leap second (second 60) and bit 62 carries its direction. Mask
//! with [`VALUE_MASK`] before any time arithmetic.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

pub const PER_SECOND: i64 = 10_000_000;
pub const PER_MILLISECOND: i64 = PER_SECOND / 1_000;
pub const PER_MICROSECOND: i64 = PER_SECOND / 1_000_000;
pub const PER_MINUTE: i64 = 60 * PER_SECOND;
pub const PER_HOUR: i64 = 60 * PER_MINUTE;
pub const PER_DAY: i64 = 24 * PER_HOUR;

/// Ticks at 1970-01-01 00:00:00 UTC.
pub const UNIX_BASE_OFFSET: i64 = 621_355_968_000_000_000;

pub const LEAP_SECOND_FLAG: i64 = (1u64 << 63) as i64;
pub const LEAP_SECOND_DIRECTION: i64 = 1 << 62;
pub const VALUE_MASK: i64 = !(LEAP_SECOND_FLAG | LEAP_SECOND_DIRECTION);

/// Current UTC time in ticks.
pub fn now() -> i64 {
    from_datetime(Utc::now())
}

pub fn from_datetime(time: DateTime<Utc>) -> i64 {
    let seconds = time
        .timestamp()
        .saturating_mul(PER_SECOND)
        .saturating_add(UNIX_BASE_OFFSET);
    seconds.saturating_add(i64::from(time.timestamp_subsec_nanos()) / 100)
}

/// Masked tick value as a wall-clock time; `None` when out of chrono range.
pub fn to_datetime(ticks: i64) -> Option<DateTime<Utc>> {
    let unix_ticks = (ticks & VALUE_MASK) - UNIX_BASE_OFFSET;
    let seconds = unix_ticks.div_euclid(PER_SECOND);
    let nanos = (unix_ticks.rem_euclid(PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(seconds, nanos)
}

/// Unix second of century plus milliseconds.
pub fn to_unix(ticks: i64) -> (i64, u16) {
    let unix_ticks = (ticks & VALUE_MASK) - UNIX_BASE_OFFSET;
    let seconds = unix_ticks.div_euclid(PER_SECOND);
    let millis = (unix_ticks.rem_euclid(PER_SECOND) / PER_MILLISECOND) as u16;
    (seconds, millis)
}

pub fn from_unix(seconds: i64, milliseconds: u16) -> i64 {
    UNIX_BASE_OFFSET + seconds * PER_SECOND + i64::from(milliseconds) * PER_MILLISECOND
}

/// Unix second of century plus microseconds.
pub fn to_unix_micro(ticks: i64) -> (i64, u32) {
    let unix_ticks = (ticks & VALUE_MASK) - UNIX_BASE_OFFSET;
    let seconds = unix_ticks.div_euclid(PER_SECOND);
    let micros = (unix_ticks.rem_euclid(PER_SECOND) / PER_MICROSECOND) as u32;
    (seconds, micros)
}

pub fn from_unix_micro(seconds: i64, microseconds: u32) -> i64 {
    UNIX_BASE_OFFSET + seconds * PER_SECOND + i64::from(microseconds) * PER_MICROSECOND
}

/// True when the value marks a leap second, i.e. second 60.
pub fn is_leap_second(ticks: i64) -> bool {
    ticks & LEAP_SECOND_FLAG != 0
}

pub fn set_leap_second(ticks: i64) -> i64 {
    ticks | LEAP_SECOND_FLAG
}

/// True when the value marks a negative leap second, i.e. second 59 will be
/// skipped.
pub fn is_negative_leap_second(ticks: i64) -> bool {
    is_leap_second(ticks) && ticks & LEAP_SECOND_DIRECTION != 0
}

pub fn set_negative_leap_second(ticks: i64) -> i64 {
    ticks | LEAP_SECOND_FLAG | LEAP_SECOND_DIRECTION
}

/// Compare a timestamp against the local clock within the given tolerances,
/// in seconds. `lag_time` and `lead_time` must be greater than zero, but can
/// be less than one.
pub fn timestamp_is_reasonable(ticks: i64, lag_time: f64, lead_time: f64) -> bool {
    let value = ticks & VALUE_MASK;
    let current = now();
    let lag_ticks = (lag_time * PER_SECOND as f64) as i64;
    let lead_ticks = (lead_time * PER_SECOND as f64) as i64;
    value >= current - lag_ticks && value <= current + lead_ticks
}

const ABSOLUTE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m-%d-%Y %H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S%.f",
];

/// Parse an absolute or relative timestamp. Relative times are an offset to
/// current UTC time specified by `*` and an interval with a unit suffix:
/// `*` is now, `*-20s` is 20 seconds ago, `*-10m`, `*-1h`, `*+2d`.
pub fn parse_relative_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Some(offset) = value.strip_prefix('*') {
        if offset.is_empty() {
            return Some(Utc::now());
        }
        let negative = match offset.as_bytes()[0] {
            b'-' => true,
            b'+' => false,
            _ => return None,
        };
        let body = &offset[1..];
        if body.len() < 2 || !body.is_ascii() {
            return None;
        }
        let (magnitude, unit) = body.split_at(body.len() - 1);
        let magnitude: f64 = magnitude.trim().parse().ok()?;
        let unit_millis: f64 = match unit {
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            "d" => 86_400_000.0,
            _ => return None,
        };
        let span = Duration::milliseconds((magnitude * unit_millis) as i64);
        return Some(if negative {
            Utc::now() - span
        } else {
            Utc::now() + span
        });
    }

    for format in ABSOLUTE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|time| time.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_round_trip_preserves_millisecond_ticks() {
        let ticks = from_unix(1_700_000_000, 250);
        let (seconds, millis) = to_unix(ticks);
        assert_eq!((seconds, millis), (1_700_000_000, 250));
        assert_eq!(from_unix(seconds, millis), ticks);
    }

    #[test]
    fn unix_micro_round_trip_preserves_microsecond_ticks() {
        let ticks = from_unix_micro(1_700_000_000, 123_456);
        let (seconds, micros) = to_unix_micro(ticks);
        assert_eq!((seconds, micros), (1_700_000_000, 123_456));
        assert_eq!(from_unix_micro(seconds, micros), ticks);
    }

    #[test]
    fn leap_second_flags_preserve_value_bits() {
        let ticks = from_unix(1_700_000_000, 0);
        let flagged = set_leap_second(ticks);
        assert!(is_leap_second(flagged));
        assert!(!is_negative_leap_second(flagged));
        assert_eq!(flagged & VALUE_MASK, ticks);

        let negative = set_negative_leap_second(ticks);
        assert!(is_leap_second(negative));
        assert!(is_negative_leap_second(negative));
        assert_eq!(negative & VALUE_MASK, ticks);
    }

    #[test]
    fn datetime_round_trip() {
        let time = Utc::now();
        let ticks = from_datetime(time);
        let back = to_datetime(ticks).expect("in range");
        // 100 ns resolution truncates sub-tick nanoseconds.
        assert!((back - time).num_nanoseconds().unwrap().abs() < 100);
    }

    #[test]
    fn reasonability_window() {
        assert!(timestamp_is_reasonable(now(), 10.0, 5.0));
        assert!(!timestamp_is_reasonable(now() - 60 * PER_SECOND, 10.0, 5.0));
        assert!(!timestamp_is_reasonable(now() + 60 * PER_SECOND, 10.0, 5.0));
        // Leap-second bits must not defeat the check.
        assert!(timestamp_is_reasonable(set_leap_second(now()), 10.0, 5.0));
    }

    #[test]
    fn relative_timestamp_grammar() {
        let now = Utc::now();
        let star = parse_relative_timestamp("*").expect("now");
        assert!((star - now).num_seconds().abs() <= 1);

        let back = parse_relative_timestamp("*-10m").expect("minus ten minutes");
        let delta = now - back;
        assert!((delta.num_seconds() - 600).abs() <= 1);

        let ahead = parse_relative_timestamp("*+2d").expect("plus two days");
        let delta = ahead - now;
        assert!((delta.num_seconds() - 2 * 86_400).abs() <= 1);

        assert!(parse_relative_timestamp("*~5s").is_none());
        assert!(parse_relative_timestamp("").is_none());
    }

    #[test]
    fn absolute_timestamp_formats() {
        let parsed = parse_relative_timestamp("2000-12-30 23:59:59.033").expect("absolute");
        assert_eq!(parsed.timestamp_subsec_millis(), 33);
        assert!(parse_relative_timestamp("12-30-2000 23:59:59").is_some());
        assert!(parse_relative_timestamp("2000-12-30").is_some());
        assert!(parse_relative_timestamp("not a time").is_none());
    }
}
