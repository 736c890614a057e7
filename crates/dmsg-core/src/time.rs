//! Time utilities

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch
///
/// A clock set before the epoch yields 0.
pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch
pub fn unix_secs() -> u64 {
    unix_nanos() / 1_000_000_000
}

/// Absolute distance between a nanosecond timestamp and now
pub fn skew_from_now(nanos: u64) -> Duration {
    Duration::from_nanos(unix_nanos().abs_diff(nanos))
}
