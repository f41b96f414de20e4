//! The SigLog time base: fixed-point UTC with 1 second = 2³⁰ ticks,
//! epoch 2018-01-01T00:00:00Z.
//!
//! The 34.30 split gives ~1 ns resolution over a ±272 year range, which
//! comfortably covers instrument recordings while keeping all arithmetic in
//! i64 (i128 for interpolation intermediates, see the reader's tmap).

use std::time::{SystemTime, UNIX_EPOCH};

/// Ticks per second.
pub const SECOND: i64 = 1 << 30;

/// Seconds between the Unix epoch and the SigLog epoch (2018-01-01T00:00:00Z).
pub const EPOCH_UNIX_SECONDS: i64 = 1_514_764_800;

/// `n` milliseconds in ticks.
pub fn milliseconds(n: i64) -> i64 {
    ((n as i128 * SECOND as i128) / 1000) as i64
}

/// `n` microseconds in ticks.
pub fn microseconds(n: i64) -> i64 {
    ((n as i128 * SECOND as i128) / 1_000_000) as i64
}

/// `n` seconds in ticks.
pub fn seconds(n: i64) -> i64 {
    n * SECOND
}

/// A tick count as fractional seconds since the SigLog epoch.
pub fn to_seconds_f64(t: i64) -> f64 {
    t as f64 / SECOND as f64
}

/// Convert a Unix timestamp (seconds) to ticks.
pub fn from_unix_seconds(s: i64) -> i64 {
    (s - EPOCH_UNIX_SECONDS) * SECOND
}

/// The current wall-clock time in ticks.
pub fn now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => {
            let unix_ticks =
                d.as_secs() as i128 * SECOND as i128 + d.subsec_nanos() as i128 * SECOND as i128 / 1_000_000_000;
            (unix_ticks - EPOCH_UNIX_SECONDS as i128 * SECOND as i128) as i64
        }
        // clock before 1970; clamp to the epoch
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversions() {
        assert_eq!(seconds(1), SECOND);
        assert_eq!(milliseconds(1000), SECOND);
        assert_eq!(microseconds(1_000_000), SECOND);
        assert_eq!(milliseconds(1), 1_073_741);
        assert_eq!(to_seconds_f64(SECOND / 2), 0.5);
    }

    #[test]
    fn unix_epoch_offset() {
        assert_eq!(from_unix_seconds(EPOCH_UNIX_SECONDS), 0);
        assert_eq!(from_unix_seconds(EPOCH_UNIX_SECONDS + 60), 60 * SECOND);
    }

    #[test]
    fn now_is_after_epoch() {
        assert!(now() > 0);
    }
}
