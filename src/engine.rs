//! The demultiplexer seam.
//!
//! Both demultiplexers answer the same contract: start an operation on a
//! descriptor, cancel a descriptor's operations, schedule and cancel timers,
//! run one loop iteration, and break a blocked iteration out of the kernel.
//! The variant is fixed when the context is built.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::context::ContextInner;
use crate::op::{Direction, ReactorOp, TimerOp};
use crate::reactor::timer_queue::TimerToken;
use crate::reactor::Reactor;

#[cfg(target_os = "linux")]
use crate::proactor::{Proactor, ProactorOp};

/// Which demultiplexer a context runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Readiness notification: wait until a descriptor can make progress,
    /// then retry the syscall. Works everywhere the poller does.
    Readiness,
    /// Completion notification: hand the operation to the kernel and reap it
    /// when finished. Linux only.
    Completion,
}

/// An operation record shaped for one of the two engines.
pub(crate) enum EngineOp {
    Readiness(Box<dyn ReactorOp>),
    #[cfg(target_os = "linux")]
    Completion(Box<ProactorOp>),
}

/// Uniform demultiplexer operations, implemented by both variants.
pub(crate) trait Demultiplexer {
    fn start_op(&self, ctx: &ContextInner, fd: RawFd, dir: Direction, op: EngineOp);
    fn cancel_ops(&self, ctx: &ContextInner, fd: RawFd) -> bool;
    fn schedule_timer(&self, ctx: &ContextInner, deadline: Instant, token: TimerToken, op: TimerOp);
    fn cancel_timers(&self, ctx: &ContextInner, token: TimerToken) -> usize;
    fn run_iteration(&self, ctx: &ContextInner, block: bool, cap: Option<Duration>);
    fn interrupt(&self);
}

impl Demultiplexer for Reactor {
    fn start_op(&self, ctx: &ContextInner, fd: RawFd, dir: Direction, op: EngineOp) {
        match op {
            EngineOp::Readiness(op) => Reactor::start_op(self, ctx, fd, dir, op),
            #[cfg(target_os = "linux")]
            EngineOp::Completion(_) => unreachable!("completion op handed to the reactor"),
        }
    }

    fn cancel_ops(&self, ctx: &ContextInner, fd: RawFd) -> bool {
        Reactor::cancel_ops(self, ctx, fd)
    }

    fn schedule_timer(&self, ctx: &ContextInner, deadline: Instant, token: TimerToken, op: TimerOp) {
        Reactor::schedule_timer(self, ctx, deadline, token, op)
    }

    fn cancel_timers(&self, ctx: &ContextInner, token: TimerToken) -> usize {
        Reactor::cancel_timers(self, ctx, token)
    }

    fn run_iteration(&self, ctx: &ContextInner, block: bool, cap: Option<Duration>) {
        Reactor::run_iteration(self, ctx, block, cap)
    }

    fn interrupt(&self) {
        Reactor::interrupt(self)
    }
}

#[cfg(target_os = "linux")]
impl Demultiplexer for Proactor {
    fn start_op(&self, ctx: &ContextInner, _fd: RawFd, dir: Direction, op: EngineOp) {
        match op {
            EngineOp::Completion(op) => Proactor::submit(self, ctx, dir, op),
            EngineOp::Readiness(_) => unreachable!("readiness op handed to the proactor"),
        }
    }

    fn cancel_ops(&self, ctx: &ContextInner, fd: RawFd) -> bool {
        Proactor::cancel_ops(self, ctx, fd)
    }

    fn schedule_timer(&self, ctx: &ContextInner, deadline: Instant, token: TimerToken, op: TimerOp) {
        Proactor::schedule_timer(self, ctx, deadline, token, op)
    }

    fn cancel_timers(&self, ctx: &ContextInner, token: TimerToken) -> usize {
        Proactor::cancel_timers(self, ctx, token)
    }

    fn run_iteration(&self, ctx: &ContextInner, block: bool, cap: Option<Duration>) {
        Proactor::run_iteration(self, ctx, block, cap)
    }

    fn interrupt(&self) {
        Proactor::interrupt(self)
    }
}

/// The demultiplexer a context owns: one of the two variants.
pub(crate) enum Engine {
    Readiness(Reactor),
    #[cfg(target_os = "linux")]
    Completion(Proactor),
}

impl Engine {
    pub(crate) fn kind(&self) -> EngineKind {
        match self {
            Engine::Readiness(_) => EngineKind::Readiness,
            #[cfg(target_os = "linux")]
            Engine::Completion(_) => EngineKind::Completion,
        }
    }

    fn as_demux(&self) -> &dyn Demultiplexer {
        match self {
            Engine::Readiness(r) => r,
            #[cfg(target_os = "linux")]
            Engine::Completion(p) => p,
        }
    }

    pub(crate) fn start_op(&self, ctx: &ContextInner, fd: RawFd, dir: Direction, op: EngineOp) {
        self.as_demux().start_op(ctx, fd, dir, op)
    }

    pub(crate) fn cancel_ops(&self, ctx: &ContextInner, fd: RawFd) -> bool {
        self.as_demux().cancel_ops(ctx, fd)
    }

    pub(crate) fn schedule_timer(
        &self,
        ctx: &ContextInner,
        deadline: Instant,
        token: TimerToken,
        op: TimerOp,
    ) {
        self.as_demux().schedule_timer(ctx, deadline, token, op)
    }

    pub(crate) fn cancel_timers(&self, ctx: &ContextInner, token: TimerToken) -> usize {
        self.as_demux().cancel_timers(ctx, token)
    }

    pub(crate) fn run_iteration(&self, ctx: &ContextInner, block: bool, cap: Option<Duration>) {
        self.as_demux().run_iteration(ctx, block, cap)
    }

    pub(crate) fn interrupt(&self) {
        self.as_demux().interrupt()
    }
}
