//! Readiness-based demultiplexer.
//!
//! The reactor blocks on system event notification (epoll on Linux, kqueue on
//! macOS via the mio poller) and drives the per-descriptor operation queues
//! and the timer queue. One worker at a time runs an iteration; the poller
//! itself lives behind a driver lock that is only ever taken by that worker.
//!
//! Locking discipline: a single mutex guards the reactor state (descriptor
//! map and timer queue). It is released before every syscall, before the
//! kernel wait, and before any completion handler runs. Perform attempts run
//! on records whose ownership moved to the driving worker; a busy mark plus a
//! condvar lets cancellation wait out an attempt in flight.

pub(crate) mod op_queue;
pub(crate) mod timer_queue;

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::trace;
use metrics::counter;
use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Token};

use crate::clock;
use crate::context::ContextInner;
use crate::error::Error;
use crate::interrupter::Interrupter;
use crate::op::{Direction, Outcome, ReactorOp, ReadyOp, TimerOp};
use crate::reactor::op_queue::DescriptorOps;
use crate::reactor::timer_queue::{TimerQueue, TimerToken};

/// Reserved token for the interrupter's read side.
const WAKE_TOKEN: Token = Token(usize::MAX);

pub(crate) struct Reactor {
    driver: Mutex<Driver>,
    // Shared registry so submitting threads can adjust registrations
    registry: Registry,
    state: Mutex<State>,
    /// Signalled whenever a perform attempt ends, so close can wait one out.
    attempt_done: Condvar,
    interrupter: Interrupter,
}

struct Driver {
    poll: Poll,
    events: Events,
}

struct State {
    descriptors: HashMap<RawFd, DescriptorOps>,
    timers: TimerQueue,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let interrupter = Interrupter::new()?;
        interrupter.register(&registry, WAKE_TOKEN)?;

        Ok(Self {
            driver: Mutex::new(Driver {
                poll,
                events: Events::with_capacity(1024),
            }),
            registry,
            state: Mutex::new(State {
                descriptors: HashMap::new(),
                timers: TimerQueue::new(),
            }),
            attempt_done: Condvar::new(),
            interrupter,
        })
    }

    /// Starts a readiness operation on `fd`.
    ///
    /// When the direction queue is clear, one speculative perform attempt is
    /// made right away; an operation that can finish without waiting skips
    /// registration entirely.
    pub(crate) fn start_op(
        &self,
        ctx: &ContextInner,
        fd: RawFd,
        dir: Direction,
        mut op: Box<dyn ReactorOp>,
    ) {
        let mut state = self.state.lock().unwrap();
        let d = state.descriptors.entry(fd).or_default();

        if op.speculative() && !d.ready(dir) && !d.busy(dir) {
            d.begin_speculative(dir);
            drop(state);
            let outcome = op.perform();
            let mut state = self.state.lock().unwrap();
            let d = state
                .descriptors
                .get_mut(&fd)
                .expect("descriptor entries are not removed while busy");
            d.end_perform(dir);
            self.attempt_done.notify_all();
            match outcome {
                Outcome::Complete => {
                    // Another op may have been queued during the speculative
                    // window without transitioning; it still needs the
                    // registration and the wake.
                    let wake = self.update_registration(ctx, fd, &mut state);
                    drop(state);
                    ctx.enqueue(ReadyOp::Io(op));
                    if wake {
                        self.interrupter.signal();
                    }
                }
                Outcome::Retry => {
                    d.requeue_head(dir, op);
                    let wake = self.update_registration(ctx, fd, &mut state);
                    drop(state);
                    if wake {
                        self.interrupter.signal();
                    }
                }
            }
            return;
        }

        let transitioned = d.enqueue(dir, op);
        if transitioned {
            let wake = self.update_registration(ctx, fd, &mut state);
            drop(state);
            if wake {
                self.interrupter.signal();
            }
        }
    }

    /// Cancels every pending operation on `fd`, aborting each in FIFO order.
    /// Blocks until an in-flight perform attempt (if any) has finished.
    /// Returns whether any operation was pending.
    pub(crate) fn cancel_ops(&self, ctx: &ContextInner, fd: RawFd) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.descriptors.get(&fd).is_some_and(DescriptorOps::any_busy) {
            state = self.attempt_done.wait(state).unwrap();
        }
        let Some(mut d) = state.descriptors.remove(&fd) else {
            return false;
        };
        let mut cancelled = Vec::new();
        let had_any = d.cancel_all(&mut cancelled);
        if d.registered.is_some() {
            let _ = self.registry.deregister(&mut SourceFd(&fd));
        }
        drop(state);

        counter!("riptide_ops_aborted_total").increment(cancelled.len() as u64);
        for op in cancelled {
            ctx.enqueue(ReadyOp::Io(op));
        }
        had_any
    }

    pub(crate) fn schedule_timer(
        &self,
        _ctx: &ContextInner,
        deadline: Instant,
        token: TimerToken,
        op: TimerOp,
    ) {
        let did_advance = {
            let mut state = self.state.lock().unwrap();
            state.timers.enqueue(deadline, token, op)
        };
        if did_advance {
            self.interrupter.signal();
        }
    }

    pub(crate) fn cancel_timers(&self, ctx: &ContextInner, token: TimerToken) -> usize {
        let mut cancelled = Vec::new();
        let count = {
            let mut state = self.state.lock().unwrap();
            state.timers.cancel_token(token, &mut cancelled)
        };
        for op in cancelled {
            ctx.enqueue(ReadyOp::Plain(op));
        }
        count
    }

    /// Forces a blocked kernel wait to return.
    pub(crate) fn interrupt(&self) {
        self.interrupter.signal();
    }

    /// One loop iteration: kernel wait, then drain ready descriptors in
    /// ascending order (read before write before except per descriptor) and
    /// fire due timers.
    pub(crate) fn run_iteration(&self, ctx: &ContextInner, block: bool, cap: Option<Duration>) {
        let mut guard = self.driver.lock().unwrap();
        let driver = &mut *guard;

        let timeout = if block {
            let state = self.state.lock().unwrap();
            clock::poll_timeout(state.timers.earliest(), cap)
        } else {
            Some(Duration::ZERO)
        };

        if let Err(err) = driver.poll.poll(&mut driver.events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                return;
            }
            panic!("reactor poll error: {err}");
        }

        let mut woke = false;
        let mut ready: Vec<(RawFd, [bool; 3])> = Vec::new();
        for event in driver.events.iter() {
            if event.token() == WAKE_TOKEN {
                woke = true;
                continue;
            }
            let fd = event.token().0 as RawFd;
            let errored = event.is_error();
            ready.push((
                fd,
                [
                    event.is_readable() || event.is_read_closed() || errored,
                    event.is_writable() || event.is_write_closed() || errored,
                    is_priority(event) || errored,
                ],
            ));
        }
        drop(guard);

        if woke {
            self.interrupter.reset();
        }
        if !ready.is_empty() {
            trace!("reactor dispatching {} ready descriptors", ready.len());
        }
        ready.sort_unstable_by_key(|(fd, _)| *fd);

        let mut state = self.state.lock().unwrap();
        for (fd, dirs) in ready {
            for dir in Direction::ALL {
                if dirs[dir as usize] {
                    state = self.drive_queue(state, ctx, fd, dir);
                }
            }
        }

        let mut fired = Vec::new();
        state.timers.fire_due(clock::now(), &mut fired);
        drop(state);
        for op in fired {
            ctx.enqueue(ReadyOp::Plain(op));
        }
    }

    /// Runs perform attempts for one descriptor direction until the head
    /// reports would-block or the queue drains. The notification is edge
    /// triggered, so stopping early would lose the edge.
    fn drive_queue<'a>(
        &'a self,
        mut state: MutexGuard<'a, State>,
        ctx: &ContextInner,
        fd: RawFd,
        dir: Direction,
    ) -> MutexGuard<'a, State> {
        loop {
            let Some(mut op) = state
                .descriptors
                .get_mut(&fd)
                .and_then(|d| d.begin_perform(dir))
            else {
                break;
            };
            drop(state);
            let outcome = op.perform();
            state = self.state.lock().unwrap();
            match state.descriptors.get_mut(&fd) {
                Some(d) => {
                    d.end_perform(dir);
                    self.attempt_done.notify_all();
                    match outcome {
                        Outcome::Complete => {
                            ctx.enqueue(ReadyOp::Io(op));
                            continue;
                        }
                        Outcome::Retry => {
                            d.requeue_head(dir, op);
                            break;
                        }
                    }
                }
                None => {
                    // Closed while the attempt was in flight.
                    self.attempt_done.notify_all();
                    if outcome == Outcome::Retry {
                        op.fail(Error::Aborted);
                    }
                    ctx.enqueue(ReadyOp::Io(op));
                    break;
                }
            }
        }
        self.update_registration(ctx, fd, &mut state);
        state
    }

    /// Brings the poller registration for `fd` in line with its queues,
    /// removing idle entries. Returns whether a registration was added or
    /// widened, in which case a blocked kernel wait must be woken to notice
    /// it. A registration failure is delivered to every pending operation on
    /// the descriptor.
    fn update_registration(&self, ctx: &ContextInner, fd: RawFd, state: &mut State) -> bool {
        let Some(d) = state.descriptors.get_mut(&fd) else {
            return false;
        };
        let desired = d.interests();
        let mut rearmed = false;
        let result = match (d.registered, desired) {
            (None, Some(want)) => self
                .registry
                .register(&mut SourceFd(&fd), Token(fd as usize), want)
                .map(|()| {
                    d.registered = Some(want);
                    rearmed = true;
                }),
            (Some(current), Some(want)) if current != want => self
                .registry
                .reregister(&mut SourceFd(&fd), Token(fd as usize), want)
                .map(|()| {
                    d.registered = Some(want);
                    rearmed = true;
                }),
            (Some(_), None) => {
                let r = self.registry.deregister(&mut SourceFd(&fd));
                d.registered = None;
                r
            }
            _ => Ok(()),
        };

        if let Err(err) = result {
            let errno = err.raw_os_error().unwrap_or(libc::EINVAL);
            let mut failed = d.drain_all();
            for op in &mut failed {
                op.fail(Error::from_errno(errno));
            }
            state.descriptors.remove(&fd);
            for op in failed {
                ctx.enqueue(ReadyOp::Io(op));
            }
            return false;
        }

        if d.is_idle() && d.registered.is_none() {
            state.descriptors.remove(&fd);
        }
        rearmed
    }
}

#[cfg(target_os = "linux")]
fn is_priority(event: &mio::event::Event) -> bool {
    event.is_priority()
}

#[cfg(not(target_os = "linux"))]
fn is_priority(_event: &mio::event::Event) -> bool {
    false
}
