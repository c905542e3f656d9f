//! Wall-clock helpers
//!
//! Every instant inside the scheduler is expressed in milliseconds since the
//! Unix epoch, so that grid-aligned timers line up with wall-clock time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Milliseconds since the Unix epoch for an absolute point in time
pub fn to_millis(instant: SystemTime) -> u64 {
    instant
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Duration in whole milliseconds, never zero
pub(crate) fn range_millis(range: Duration) -> u64 {
    (range.as_millis() as u64).max(1)
}

/// Time left until `deadline`, or `None` if it has passed
pub(crate) fn until(deadline: u64) -> Option<Duration> {
    let now = now_millis();
    (deadline > now).then(|| Duration::from_millis(deadline - now))
}
