//! Source timestamps are integers counted from the Apple epoch (2001-01-01T00:00:00Z),
//! in seconds, microseconds or nanoseconds depending on the writer's era.
//! The unit is classified by magnitude.

use chrono::{DateTime, Duration, TimeZone, Utc};
use lazy_static::lazy_static;

/// Seconds between the Unix epoch and the Apple epoch.
pub const APPLE_EPOCH_OFFSET_SECS: i64 = 978_307_200;
pub const APPLE_EPOCH_OFFSET_NS: i64 = APPLE_EPOCH_OFFSET_SECS * 1_000_000_000;

const SECONDS_MAX: i64 = 10_000_000_000; // 10^10
const MICROS_MAX: i64 = 10_000_000_000_000_000; // 10^16

lazy_static! {
    pub static ref APPLE_EPOCH: DateTime<Utc> = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
}

/// Normalises a raw Apple-epoch timestamp of any unit to nanoseconds.
/// Total: values that would overflow yield `None`.
pub fn to_nanos(raw: i64) -> Option<i64> {
    if raw > MICROS_MAX {
        Some(raw)
    } else if raw > SECONDS_MAX {
        raw.checked_mul(1_000)
    } else {
        raw.checked_mul(1_000_000_000)
    }
}

/// Decodes a raw Apple-epoch timestamp into a UTC instant.
pub fn from_apple_timestamp(raw: i64) -> Option<DateTime<Utc>> {
    apple_ns_to_utc(to_nanos(raw)?)
}

pub fn apple_ns_to_utc(ns: i64) -> Option<DateTime<Utc>> {
    APPLE_EPOCH.checked_add_signed(Duration::nanoseconds(ns))
}

pub fn apple_ns_to_unix_ns(ns: i64) -> Option<i64> {
    ns.checked_add(APPLE_EPOCH_OFFSET_NS)
}

pub fn unix_ns_to_apple_ns(ns: i64) -> i64 {
    ns - APPLE_EPOCH_OFFSET_NS
}

pub fn unix_ns_to_utc(ns: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(ns)
}

pub fn utc_to_unix_ns(dt: DateTime<Utc>) -> Option<i64> {
    dt.timestamp_nanos_opt()
}

pub fn utc_to_apple_ns(dt: DateTime<Utc>) -> Option<i64> {
    dt.timestamp_nanos_opt().map(unix_ns_to_apple_ns)
}
