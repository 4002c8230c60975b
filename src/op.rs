//! Operation records.
//!
//! Every outstanding piece of work in the engine is one record: a posted
//! handler, a readiness operation waiting on a descriptor, a submitted
//! completion-engine operation, or a scheduled timer wait. A record is owned
//! by exactly one place at a time (the submitter, a queue, or the worker
//! frame running it) and its handler runs at most once.

use crate::error::{Error, Result};

/// Outcome of one perform attempt on a readiness operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// A definite result was produced; the record is ready for completion.
    Complete,
    /// The syscall would block; the record stays at the head of its queue.
    Retry,
}

/// Direction queues a descriptor operation can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read = 0,
    Write = 1,
    Except = 2,
}

impl Direction {
    pub(crate) const ALL: [Direction; 3] = [Direction::Read, Direction::Write, Direction::Except];
}

/// A record whose completion handler is ready to run.
///
/// `complete` consumes the record; the handler copy is moved out before the
/// record storage is released, so a handler may immediately start a follow-up
/// operation.
pub(crate) trait Complete: Send {
    fn complete(self: Box<Self>);
}

/// A readiness operation driven by the reactor.
///
/// `perform` runs with every engine lock released and makes exactly one
/// non-blocking syscall attempt (retrying transparently on `EINTR`).
pub(crate) trait ReactorOp: Send {
    fn perform(&mut self) -> Outcome;

    /// Overwrites the stored result with `err` ahead of completion, for
    /// cancellation and registration failures.
    fn fail(&mut self, err: Error);

    fn complete(self: Box<Self>);

    /// Whether a submit-time perform attempt is allowed. Operations whose
    /// perform step only reads an outcome (a deferred connect error) must
    /// wait for the readiness event.
    fn speculative(&self) -> bool {
        true
    }
}

/// An entry of the posted-handler queue.
pub(crate) enum ReadyOp {
    Plain(Box<dyn Complete>),
    Io(Box<dyn ReactorOp>),
}

impl ReadyOp {
    pub(crate) fn run(self) {
        match self {
            ReadyOp::Plain(op) => op.complete(),
            ReadyOp::Io(op) => op.complete(),
        }
    }
}

/// Wraps a plain posted closure as an operation record.
pub(crate) struct HandlerOp<F: FnOnce() + Send>(pub(crate) F);

impl<F: FnOnce() + Send> Complete for HandlerOp<F> {
    fn complete(self: Box<Self>) {
        (self.0)()
    }
}

pub(crate) fn handler_op<F: FnOnce() + Send + 'static>(f: F) -> ReadyOp {
    ReadyOp::Plain(Box::new(HandlerOp(f)))
}

/// A scheduled timer wait.
///
/// The result slot starts out ok and flips to aborted when the wait is
/// cancelled before its deadline.
pub(crate) struct TimerOp {
    handler: Box<dyn FnOnce(Result<()>) + Send>,
    aborted: bool,
}

impl TimerOp {
    pub(crate) fn new(handler: impl FnOnce(Result<()>) + Send + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            aborted: false,
        }
    }

    pub(crate) fn abort(&mut self) {
        self.aborted = true;
    }
}

impl Complete for TimerOp {
    fn complete(self: Box<Self>) {
        let this = *self;
        let result = if this.aborted { Err(Error::Aborted) } else { Ok(()) };
        (this.handler)(result)
    }
}
