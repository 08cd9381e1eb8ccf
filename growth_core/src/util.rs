//! Common time helpers for growth_core.

use std::time::Duration;

/// Number of seconds in one hour; the filter runs in hours.
pub const SECS_PER_HOUR: f64 = 3_600.0;
/// Number of milliseconds in one second.
pub const MILLIS_PER_SEC: u64 = 1_000;

/// Elapsed time in hours, floored at `min_dt_ms`.
///
/// Both live and historical runs go through here so equal gaps give
/// bit-identical dt.
#[inline]
pub fn dt_hours(elapsed: Duration, min_dt_ms: u64) -> f64 {
    let floor = Duration::from_millis(min_dt_ms);
    elapsed.max(floor).as_secs_f64() / SECS_PER_HOUR
}

/// Seconds to hours.
#[inline]
pub fn hours(seconds: f64) -> f64 {
    seconds / SECS_PER_HOUR
}

/// Non-negative gap between two timestamps; reversed order yields zero.
#[inline]
pub fn gap(
    earlier: chrono::DateTime<chrono::Utc>,
    later: chrono::DateTime<chrono::Utc>,
) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}
