//! Time and progress conversion utilities.
//!
//! Server payloads carry fractional seconds while the local playhead counts
//! whole seconds, so the conversions here saturate instead of truncating
//! silently.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Extension trait for safe Duration conversions.
pub trait DurationExt {
    /// Convert duration to milliseconds as u64, saturating at `u64::MAX`.
    fn as_millis_u64(&self) -> u64;
}

impl DurationExt for Duration {
    fn as_millis_u64(&self) -> u64 {
        u64::try_from(self.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Convert a server-reported number of seconds into whole seconds.
///
/// Negative, NaN and infinite inputs collapse to zero; values beyond
/// `u32::MAX` saturate.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn whole_seconds(secs: f64) -> u32 {
    if !secs.is_finite() || secs <= 0.0 {
        return 0;
    }
    if secs >= f64::from(u32::MAX) {
        return u32::MAX;
    }
    secs.floor() as u32
}

/// Percentage of `duration_secs` covered by `elapsed_secs`, clamped to `0..=100`.
///
/// A zero duration means the length is unknown and always yields `0.0`.
#[must_use]
pub fn progress_percent(elapsed_secs: u32, duration_secs: u32) -> f64 {
    if duration_secs == 0 {
        return 0.0;
    }
    let percent = f64::from(elapsed_secs) / f64::from(duration_secs) * 100.0;
    percent.clamp(0.0, 100.0)
}

/// Milliseconds since the Unix epoch, used to make stream URLs unique per attach.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis_u64())
}
