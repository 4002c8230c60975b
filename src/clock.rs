//! Monotonic time source for timers.
//!
//! Deadlines are absolute instants on the monotonic clock, so wall-clock
//! jumps never move a timer.

use std::time::{Duration, Instant};

/// Current monotonic time. Cheap and lock-free.
#[inline]
pub(crate) fn now() -> Instant {
    Instant::now()
}

/// Time remaining until `deadline`, saturating to zero for past deadlines.
#[inline]
pub(crate) fn duration_until(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(now())
}

/// Converts an optional earliest deadline to a multiplexer timeout.
///
/// `None` means block indefinitely. A `cap` bounds the sleep for loops that
/// must periodically re-check liveness on their own.
pub(crate) fn poll_timeout(earliest: Option<Instant>, cap: Option<Duration>) -> Option<Duration> {
    let until = earliest.map(duration_until);
    match (until, cap) {
        (Some(d), Some(c)) => Some(d.min(c)),
        (Some(d), None) => Some(d),
        (None, Some(c)) => Some(c),
        (None, None) => None,
    }
}
