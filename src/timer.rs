//! Deadline timers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::clock;
use crate::context::IoContext;
use crate::error::Result;
use crate::op::TimerOp;

static NEXT_TIMER_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A one-shot timer on the monotonic clock.
///
/// The timer keeps one absolute expiry; any number of waits can be
/// outstanding against it. Moving the expiry cancels outstanding waits
/// (their handlers observe operation-aborted) and returns how many were
/// cancelled, as does [`cancel`](Self::cancel). Equal deadlines fire in the
/// order the waits were started.
pub struct DeadlineTimer {
    ctx: IoContext,
    token: u64,
    expiry: Instant,
}

impl DeadlineTimer {
    /// A timer that is already expired; set a deadline before waiting.
    pub fn new(ctx: &IoContext) -> Self {
        Self {
            ctx: ctx.clone(),
            token: NEXT_TIMER_TOKEN.fetch_add(1, Ordering::Relaxed),
            expiry: clock::now(),
        }
    }

    pub fn expiry(&self) -> Instant {
        self.expiry
    }

    /// Sets an absolute expiry. Outstanding waits are cancelled; returns the
    /// number cancelled.
    pub fn expires_at(&mut self, deadline: Instant) -> usize {
        let cancelled = self.cancel();
        self.expiry = deadline;
        cancelled
    }

    /// Sets the expiry relative to now. Outstanding waits are cancelled;
    /// returns the number cancelled.
    pub fn expires_after(&mut self, delay: Duration) -> usize {
        self.expires_at(clock::now() + delay)
    }

    /// Blocks the calling thread until the expiry has passed.
    pub fn wait(&self) -> Result<()> {
        let remaining = clock::duration_until(self.expiry);
        if !remaining.is_zero() {
            thread::sleep(remaining);
        }
        Ok(())
    }

    /// Starts an asynchronous wait. The handler runs on a `run()` worker no
    /// earlier than the expiry, with ok, or with operation-aborted when the
    /// wait is cancelled first.
    pub fn async_wait(&self, handler: impl FnOnce(Result<()>) + Send + 'static) {
        let inner = self.ctx.inner();
        inner.work_started();
        inner
            .engine()
            .schedule_timer(inner, self.expiry, self.token, TimerOp::new(handler));
    }

    /// Cancels outstanding waits; each handler observes operation-aborted.
    /// Returns the number cancelled.
    pub fn cancel(&self) -> usize {
        let inner = self.ctx.inner();
        inner.engine().cancel_timers(inner, self.token)
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
