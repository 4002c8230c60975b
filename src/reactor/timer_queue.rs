//! Deadline-ordered timer queue.
//!
//! Timers are keyed by `(deadline, sequence)` so equal deadlines fire in
//! insertion order. Each wait carries an opaque cancellation token; all waits
//! sharing a token can be cancelled together.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::op::{Complete, TimerOp};

/// Opaque, pointer-sized token identifying the waits of one timer object.
pub(crate) type TimerToken = u64;

struct Entry {
    token: TimerToken,
    op: TimerOp,
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    entries: BTreeMap<(Instant, u64), Entry>,
    seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a wait. Returns true iff the new deadline is earlier than the
    /// previous earliest, in which case a blocked multiplexer call must be
    /// woken to shorten its timeout.
    pub(crate) fn enqueue(&mut self, deadline: Instant, token: TimerToken, op: TimerOp) -> bool {
        let did_advance = match self.earliest() {
            Some(earliest) => deadline < earliest,
            None => true,
        };
        let seq = self.seq;
        self.seq += 1;
        self.entries.insert((deadline, seq), Entry { token, op });
        did_advance
    }

    /// Deadline of the next timer to fire, if any.
    pub(crate) fn earliest(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Moves every wait with `deadline <= now` into `fired`, preserving
    /// insertion order among equal deadlines. Returns the count.
    pub(crate) fn fire_due(&mut self, now: Instant, fired: &mut Vec<Box<dyn Complete>>) -> usize {
        let mut count = 0;
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            fired.push(Box::new(entry.remove().op));
            count += 1;
        }
        count
    }

    /// Removes every wait carrying `token` and moves it, marked aborted, into
    /// `cancelled`. Returns the number cancelled.
    pub(crate) fn cancel_token(
        &mut self,
        token: TimerToken,
        cancelled: &mut Vec<Box<dyn Complete>>,
    ) -> usize {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.token == token)
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            let mut entry = self.entries.remove(key).expect("key collected above");
            entry.op.abort();
            cancelled.push(Box::new(entry.op));
        }
        keys.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
