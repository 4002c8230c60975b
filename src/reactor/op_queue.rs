//! Per-descriptor operation queues.
//!
//! One FIFO queue per direction (read, write, except). The head of a queue is
//! the operation currently being driven; a head that reports would-block stays
//! put. A direction is marked busy while a worker runs its head's perform
//! step outside the lock, so bulk cancellation can wait the attempt out.

use std::collections::VecDeque;

use mio::Interest;

use crate::error::Error;
use crate::op::{Direction, ReactorOp};

#[cfg(target_os = "linux")]
const EXCEPT_INTEREST: Interest = Interest::PRIORITY;
#[cfg(not(target_os = "linux"))]
const EXCEPT_INTEREST: Interest = Interest::READABLE;

/// Queues and registration state for one descriptor.
#[derive(Default)]
pub(crate) struct DescriptorOps {
    queues: [VecDeque<Box<dyn ReactorOp>>; 3],
    busy: [bool; 3],
    pub(crate) registered: Option<Interest>,
}

impl DescriptorOps {
    /// Appends an operation. Returns true iff the direction transitioned from
    /// empty, meaning the multiplexer registration must be refreshed.
    pub(crate) fn enqueue(&mut self, dir: Direction, op: Box<dyn ReactorOp>) -> bool {
        let q = &mut self.queues[dir as usize];
        let was_empty = q.is_empty() && !self.busy[dir as usize];
        q.push_back(op);
        was_empty
    }

    pub(crate) fn ready(&self, dir: Direction) -> bool {
        !self.queues[dir as usize].is_empty()
    }

    /// Takes the head for a perform attempt and marks the direction busy.
    pub(crate) fn begin_perform(&mut self, dir: Direction) -> Option<Box<dyn ReactorOp>> {
        if self.busy[dir as usize] {
            return None;
        }
        let op = self.queues[dir as usize].pop_front()?;
        self.busy[dir as usize] = true;
        Some(op)
    }

    /// Clears the busy mark after a perform attempt.
    pub(crate) fn end_perform(&mut self, dir: Direction) {
        self.busy[dir as usize] = false;
    }

    /// Restores a would-block head to the front of its queue.
    pub(crate) fn requeue_head(&mut self, dir: Direction, op: Box<dyn ReactorOp>) {
        self.queues[dir as usize].push_front(op);
    }

    pub(crate) fn any_busy(&self) -> bool {
        self.busy.iter().any(|b| *b)
    }

    /// True when nothing is queued or in flight in any direction.
    pub(crate) fn is_idle(&self) -> bool {
        !self.any_busy() && self.queues.iter().all(VecDeque::is_empty)
    }

    /// Moves every pending operation out in FIFO order, marked aborted.
    /// Returns whether any were present. Must not be called while busy.
    pub(crate) fn cancel_all(&mut self, out: &mut Vec<Box<dyn ReactorOp>>) -> bool {
        debug_assert!(!self.any_busy());
        let mut had_any = false;
        for dir in Direction::ALL {
            while let Some(mut op) = self.queues[dir as usize].pop_front() {
                op.fail(Error::Aborted);
                out.push(op);
                had_any = true;
            }
        }
        had_any
    }

    /// Moves every pending operation out with no result change, for delivery
    /// of a registration failure.
    pub(crate) fn drain_all(&mut self) -> Vec<Box<dyn ReactorOp>> {
        let mut out = Vec::new();
        for dir in Direction::ALL {
            out.extend(self.queues[dir as usize].drain(..));
        }
        out
    }

    pub(crate) fn busy(&self, dir: Direction) -> bool {
        self.busy[dir as usize]
    }

    /// Marks a direction busy for a submit-time speculative attempt.
    pub(crate) fn begin_speculative(&mut self, dir: Direction) {
        debug_assert!(!self.busy[dir as usize]);
        self.busy[dir as usize] = true;
    }

    /// Interest union for the directions with pending or in-flight work.
    pub(crate) fn interests(&self) -> Option<Interest> {
        let mut wanted: Option<Interest> = None;
        let mut add = |i: Interest| {
            wanted = Some(match wanted {
                Some(cur) => cur | i,
                None => i,
            });
        };
        if self.ready(Direction::Read) || self.busy[Direction::Read as usize] {
            add(Interest::READABLE);
        }
        if self.ready(Direction::Write) || self.busy[Direction::Write as usize] {
            add(Interest::WRITABLE);
        }
        if self.ready(Direction::Except) || self.busy[Direction::Except as usize] {
            add(EXCEPT_INTEREST);
        }
        wanted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Outcome;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NoopOp {
        aborted: Arc<AtomicUsize>,
        completed: Arc<AtomicUsize>,
    }

    impl ReactorOp for NoopOp {
        fn perform(&mut self) -> Outcome {
            Outcome::Complete
        }
        fn fail(&mut self, _err: Error) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
        fn complete(self: Box<Self>) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn first_op_per_direction_reports_transition() {
        let aborted = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let mk = || {
            Box::new(NoopOp {
                aborted: aborted.clone(),
                completed: completed.clone(),
            })
        };
        let mut d = DescriptorOps::default();
        assert!(d.enqueue(Direction::Read, mk()));
        assert!(!d.enqueue(Direction::Read, mk()));
        assert!(d.enqueue(Direction::Write, mk()));
        assert!(d.interests().is_some());
    }

    #[test]
    fn cancel_all_aborts_in_fifo_order() {
        let aborted = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let mk = || {
            Box::new(NoopOp {
                aborted: aborted.clone(),
                completed: completed.clone(),
            })
        };
        let mut d = DescriptorOps::default();
        d.enqueue(Direction::Read, mk());
        d.enqueue(Direction::Read, mk());
        d.enqueue(Direction::Except, mk());

        let mut out = Vec::new();
        assert!(d.cancel_all(&mut out));
        assert_eq!(out.len(), 3);
        assert_eq!(aborted.load(Ordering::SeqCst), 3);
        assert!(d.is_idle());
        assert!(!d.cancel_all(&mut Vec::new()));
    }

    #[test]
    fn busy_head_is_not_handed_out_twice() {
        let aborted = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut d = DescriptorOps::default();
        d.enqueue(
            Direction::Read,
            Box::new(NoopOp {
                aborted: aborted.clone(),
                completed: completed.clone(),
            }),
        );
        let head = d.begin_perform(Direction::Read).unwrap();
        assert!(d.begin_perform(Direction::Read).is_none());
        d.end_perform(Direction::Read);
        d.requeue_head(Direction::Read, head);
        assert!(d.begin_perform(Direction::Read).is_some());
    }
}
