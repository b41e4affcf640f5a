//! Boundary and offset arithmetic
//!
//! Pure functions only — the engine's timing decisions are computed here and
//! executed (slept) in the engine loop, so every transition is testable
//! without a clock.
//!
//! The boundary is local midnight in the service's home timezone, expressed
//! as a fixed UTC offset (the target zone observes no daylight saving).

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Utc};

/// Build the boundary timezone from a whole-hour UTC offset.
///
/// Offsets are validated at config load; the chrono range (±23h) is far
/// wider than any real zone.
pub fn boundary_zone(utc_offset_hours: i32) -> Option<FixedOffset> {
    FixedOffset::east_opt(utc_offset_hours * 3600)
}

/// The next occurrence of local midnight strictly after `now`.
///
/// If `now` is exactly midnight, the boundary is tomorrow's midnight — the
/// instant at the boundary belongs to the cycle that already fired.
pub fn next_boundary(now: DateTime<Utc>, zone: FixedOffset) -> DateTime<Utc> {
    let local = now.with_timezone(&zone);
    let midnight = local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("00:00:00 is a valid time of day")
        .and_local_timezone(zone)
        .single()
        .expect("fixed offsets have no gaps or folds");

    let boundary = if midnight > local {
        midnight
    } else {
        midnight + ChronoDuration::days(1)
    };
    boundary.with_timezone(&Utc)
}

/// Advance a boundary by one day.
pub fn next_day(boundary: DateTime<Utc>) -> DateTime<Utc> {
    boundary + ChronoDuration::days(1)
}

/// One-way network compensation: half the measured round trip.
///
/// Non-finite or negative averages (nothing reachable, clock weirdness)
/// collapse to zero.
pub fn compensation_offset(avg_rtt_ms: f64) -> Duration {
    if !avg_rtt_ms.is_finite() || avg_rtt_ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(avg_rtt_ms / 2.0 / 1000.0)
}

/// How long to sleep from `now` until `until`; zero if already past.
pub fn wait_duration(now: DateTime<Utc>, until: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or(Duration::ZERO)
}
