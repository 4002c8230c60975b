//! Completion-based demultiplexer over io_uring.
//!
//! Operations are described up front and handed to the kernel; workers reap
//! finished operations from the completion queue. Submissions from arbitrary
//! threads are staged under the proactor mutex and flushed by whichever
//! worker currently drives the ring, so the ring itself is only ever touched
//! by one thread at a time.
//!
//! The interrupter's read side is kept armed as a poll submission: signalling
//! it completes that entry and breaks the driver out of its wait. The timer
//! queue is armed as a timeout submission re-armed whenever the earliest
//! deadline moves.
//!
//! The kernel reaps completions in whatever order they finish, so ops on one
//! descriptor direction are serialized here: one kernel submission at a
//! time, followers held back until the head completes. Handlers therefore
//! run in submission order per descriptor per direction, matching the
//! readiness engine.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use io_uring::{opcode, types, IoUring};
use log::{debug, trace};
use metrics::counter;

use crate::clock;
use crate::context::ContextInner;
use crate::interrupter::Interrupter;
use crate::op::{Complete, Direction, ReadyOp, TimerOp};
use crate::reactor::timer_queue::{TimerQueue, TimerToken};

/// Completion key for the interrupter poll entry.
const WAKE_TAG: u64 = u64::MAX;
/// Completion key for the armed timer deadline.
const TIMEOUT_TAG: u64 = u64::MAX - 1;
/// Completion key for cancel and timeout-remove bookkeeping entries.
const CONTROL_TAG: u64 = u64::MAX - 2;

const RING_ENTRIES: u32 = 256;

/// Storage for a socket address handed to the kernel. Lives boxed inside the
/// operation record so its address stays stable while the op is in flight.
pub(crate) struct SockAddrStorage {
    pub(crate) storage: libc::sockaddr_storage,
    pub(crate) len: libc::socklen_t,
}

impl SockAddrStorage {
    pub(crate) fn empty() -> Box<Self> {
        Box::new(Self {
            // SAFETY: sockaddr_storage is plain old data; all-zero is valid.
            storage: unsafe { std::mem::zeroed() },
            len: size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        })
    }

    pub(crate) fn from_addr(addr: std::net::SocketAddr) -> Box<Self> {
        let (storage, len) = crate::socket::addr::to_storage(addr);
        Box::new(Self { storage, len })
    }
}

/// msghdr plus the storage it points into, for sendmsg/recvmsg submissions.
/// The pointers are wired up just before the entry is pushed, once the
/// record's heap address is final.
pub(crate) struct MsgStorage {
    pub(crate) hdr: libc::msghdr,
    pub(crate) iov: libc::iovec,
    pub(crate) addr: libc::sockaddr_storage,
    pub(crate) addr_len: libc::socklen_t,
}

// SAFETY: the raw pointers inside hdr/iov only ever point into this same
// allocation or into the operation's owned buffer, which travel together.
unsafe impl Send for MsgStorage {}

impl MsgStorage {
    pub(crate) fn empty() -> Box<Self> {
        // SAFETY: msghdr, iovec and sockaddr_storage are plain old data.
        Box::new(unsafe { std::mem::zeroed() })
    }

    pub(crate) fn for_dest(addr: std::net::SocketAddr) -> Box<Self> {
        let mut this = Self::empty();
        let (storage, len) = crate::socket::addr::to_storage(addr);
        this.addr = storage;
        this.addr_len = len;
        this
    }

    /// Points the header at the owned buffer and address storage.
    /// `named` selects whether the address is part of the exchange.
    fn wire(&mut self, buf: &mut [u8], named: bool) {
        self.iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        self.hdr.msg_iov = &mut self.iov;
        self.hdr.msg_iovlen = 1;
        if named {
            self.hdr.msg_name = &mut self.addr as *mut libc::sockaddr_storage as *mut libc::c_void;
            self.hdr.msg_namelen = self.addr_len;
        }
    }
}

/// What a completion operation asks of the kernel, along with the storage the
/// kernel reads or writes while it runs.
pub(crate) enum OpKind {
    Recv {
        buf: Vec<u8>,
        flags: i32,
        stream: bool,
    },
    Send {
        buf: Vec<u8>,
        flags: i32,
    },
    RecvFrom {
        buf: Vec<u8>,
        flags: i32,
        msg: Box<MsgStorage>,
    },
    SendTo {
        buf: Vec<u8>,
        flags: i32,
        msg: Box<MsgStorage>,
    },
    Accept {
        addr: Box<SockAddrStorage>,
    },
    Connect {
        addr: Box<SockAddrStorage>,
    },
}

/// One in-flight completion operation. `finish` interprets the raw kernel
/// result (byte count, or a negated errno) and runs the user handler.
pub(crate) struct ProactorOp {
    fd: RawFd,
    dir: Direction,
    kind: OpKind,
    res: i32,
    finish: Box<dyn FnOnce(i32, OpKind) + Send>,
}

impl ProactorOp {
    pub(crate) fn new(
        fd: RawFd,
        kind: OpKind,
        finish: impl FnOnce(i32, OpKind) + Send + 'static,
    ) -> Box<Self> {
        Box::new(Self {
            fd,
            dir: Direction::Read,
            kind,
            res: 0,
            finish: Box::new(finish),
        })
    }
}

impl Complete for ProactorOp {
    fn complete(self: Box<Self>) {
        let this = *self;
        (this.finish)(this.res, this.kind)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Staged {
    Submit(u64),
    Cancel(u64),
}

/// Serialization state for one descriptor direction: the id of the op
/// currently staged or in the kernel, and the followers waiting for it.
#[derive(Default)]
struct DirState {
    active: Option<u64>,
    waiting: VecDeque<(u64, Box<ProactorOp>)>,
}

#[derive(Default)]
struct FdState {
    dirs: [DirState; 3],
}

impl FdState {
    fn is_idle(&self) -> bool {
        self.dirs
            .iter()
            .all(|d| d.active.is_none() && d.waiting.is_empty())
    }
}

struct PState {
    staged: VecDeque<Staged>,
    inflight: HashMap<u64, Box<ProactorOp>>,
    by_fd: HashMap<RawFd, FdState>,
    /// Aborted followers held back until the kernel returns their cancelled
    /// predecessor, so handlers keep submission order through a close.
    deferred: HashMap<u64, Vec<Box<ProactorOp>>>,
    timers: TimerQueue,
    next_id: u64,
}

struct Driver {
    ring: IoUring,
    wake_armed: bool,
    armed_deadline: Option<Instant>,
    timespec: types::Timespec,
}

pub(crate) struct Proactor {
    driver: Mutex<Driver>,
    state: Mutex<PState>,
    interrupter: Interrupter,
}

impl Proactor {
    pub(crate) fn new() -> std::io::Result<Self> {
        let ring = IoUring::new(RING_ENTRIES)?;
        Ok(Self {
            driver: Mutex::new(Driver {
                ring,
                wake_armed: false,
                armed_deadline: None,
                timespec: types::Timespec::new(),
            }),
            state: Mutex::new(PState {
                staged: VecDeque::new(),
                inflight: HashMap::new(),
                by_fd: HashMap::new(),
                deferred: HashMap::new(),
                timers: TimerQueue::new(),
                next_id: 1,
            }),
            interrupter: Interrupter::new()?,
        })
    }

    /// Stages an operation for submission. At most one op per descriptor
    /// direction is handed to the kernel; later ops wait their turn so
    /// handlers run in submission order. Wakes the driving worker when a new
    /// submission is ready to flush.
    pub(crate) fn submit(&self, _ctx: &ContextInner, dir: Direction, mut op: Box<ProactorOp>) {
        op.dir = dir;
        let activated = {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            let id = state.next_id;
            state.next_id += 1;
            let fd_state = state.by_fd.entry(op.fd).or_default();
            let dir_state = &mut fd_state.dirs[dir as usize];
            if dir_state.active.is_none() {
                dir_state.active = Some(id);
                state.inflight.insert(id, op);
                state.staged.push_back(Staged::Submit(id));
                true
            } else {
                dir_state.waiting.push_back((id, op));
                false
            }
        };
        if activated {
            self.interrupter.signal();
        }
    }

    /// Cancels every operation on `fd` in submission order per direction.
    /// Records that never reached the kernel complete aborted immediately;
    /// the in-kernel head gets an async cancel, and its aborted followers are
    /// held back until the kernel returns it so handler order is preserved.
    /// Returns whether any operation was outstanding.
    pub(crate) fn cancel_ops(&self, ctx: &ContextInner, fd: RawFd) -> bool {
        let mut aborted: Vec<Box<ProactorOp>> = Vec::new();
        let mut had_any = false;
        {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            let Some(mut fd_state) = state.by_fd.remove(&fd) else {
                return false;
            };
            for dir in Direction::ALL {
                let dir_state = &mut fd_state.dirs[dir as usize];
                let mut followers: Vec<Box<ProactorOp>> = Vec::new();
                while let Some((_, mut rec)) = dir_state.waiting.pop_front() {
                    had_any = true;
                    rec.res = -libc::ECANCELED;
                    followers.push(rec);
                }
                match dir_state.active.take() {
                    Some(id) => {
                        had_any = true;
                        if state.staged.contains(&Staged::Submit(id)) {
                            // Never reached the kernel; abort locally.
                            state.staged.retain(|s| *s != Staged::Submit(id));
                            if let Some(mut rec) = state.inflight.remove(&id) {
                                rec.res = -libc::ECANCELED;
                                aborted.push(rec);
                            }
                            aborted.append(&mut followers);
                        } else if state.inflight.contains_key(&id) {
                            state.staged.push_back(Staged::Cancel(id));
                            if !followers.is_empty() {
                                state.deferred.insert(id, followers);
                            }
                        } else {
                            aborted.append(&mut followers);
                        }
                    }
                    None => aborted.append(&mut followers),
                }
            }
        }

        counter!("riptide_ops_aborted_total").increment(aborted.len() as u64);
        for rec in aborted {
            ctx.enqueue(ReadyOp::Plain(rec));
        }
        self.interrupter.signal();
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

    pub(crate) fn interrupt(&self) {
        self.interrupter.signal();
    }

    /// One loop iteration: flush staged submissions, keep the wake and timer
    /// entries armed, wait for at least one completion, then reap.
    pub(crate) fn run_iteration(&self, ctx: &ContextInner, block: bool, cap: Option<Duration>) {
        let mut driver = self.driver.lock().unwrap();

        let flushed_all = {
            let mut state = self.state.lock().unwrap();
            self.arm_wake(&mut driver);
            self.arm_timeout(&mut driver, &state);
            flush_staged(&mut driver, &mut state)
        };

        // A capped wait needs a timeout entry of its own; reuse the timer
        // armer by treating the cap as a pseudo-deadline when it is tighter.
        if let Some(cap) = cap {
            let cap_deadline = clock::now() + cap;
            if driver.armed_deadline.is_none_or(|d| cap_deadline < d) {
                self.arm_deadline(&mut driver, Some(cap_deadline));
            }
        }

        let want_block = block && flushed_all;
        let submit_result = if want_block {
            driver.ring.submit_and_wait(1)
        } else {
            driver.ring.submit()
        };
        if let Err(err) = submit_result {
            if err.kind() != std::io::ErrorKind::Interrupted {
                debug!("proactor submit error: {err}");
            }
        }

        let mut batch: Vec<(u64, i32)> = Vec::new();
        for cqe in driver.ring.completion() {
            batch.push((cqe.user_data(), cqe.result()));
        }
        trace!("proactor reaped {} completions", batch.len());

        let mut completions: Vec<Box<ProactorOp>> = Vec::new();
        let mut fired: Vec<Box<dyn Complete>> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            for (user_data, res) in batch {
                match user_data {
                    WAKE_TAG => {
                        driver.wake_armed = false;
                        self.interrupter.reset();
                    }
                    TIMEOUT_TAG => {
                        // A removed deadline completes with ECANCELED; only a
                        // genuine expiry disarms.
                        if res == -libc::ETIME {
                            driver.armed_deadline = None;
                        }
                    }
                    CONTROL_TAG => {}
                    id => {
                        if let Some(mut rec) = state.inflight.remove(&id) {
                            rec.res = res;
                            // Promote the next waiting op on this direction.
                            if let Some(fd_state) = state.by_fd.get_mut(&rec.fd) {
                                let dir_state = &mut fd_state.dirs[rec.dir as usize];
                                if dir_state.active == Some(id) {
                                    dir_state.active = None;
                                    if let Some((next_id, next_op)) =
                                        dir_state.waiting.pop_front()
                                    {
                                        dir_state.active = Some(next_id);
                                        state.inflight.insert(next_id, next_op);
                                        state.staged.push_back(Staged::Submit(next_id));
                                    }
                                }
                                if fd_state.is_idle() {
                                    state.by_fd.remove(&rec.fd);
                                }
                            }
                            completions.push(rec);
                        }
                        if let Some(mut followers) = state.deferred.remove(&id) {
                            completions.append(&mut followers);
                        }
                    }
                }
            }
            state.timers.fire_due(clock::now(), &mut fired);
        }
        drop(driver);

        for op in fired {
            ctx.enqueue(ReadyOp::Plain(op));
        }
        for rec in completions {
            ctx.enqueue(ReadyOp::Plain(rec));
        }
    }

    fn arm_wake(&self, driver: &mut Driver) {
        if driver.wake_armed {
            return;
        }
        let sqe = opcode::PollAdd::new(
            types::Fd(self.interrupter.read_fd()),
            libc::POLLIN as u32,
        )
        .build()
        .user_data(WAKE_TAG);
        // SAFETY: the interrupter outlives the ring; no buffers involved.
        if unsafe { driver.ring.submission().push(&sqe) }.is_ok() {
            driver.wake_armed = true;
        }
    }

    fn arm_timeout(&self, driver: &mut Driver, state: &PState) {
        let earliest = state.timers.earliest();
        if driver.armed_deadline != earliest {
            self.arm_deadline(driver, earliest);
        }
    }

    fn arm_deadline(&self, driver: &mut Driver, deadline: Option<Instant>) {
        if driver.armed_deadline.is_some() {
            let sqe = opcode::TimeoutRemove::new(TIMEOUT_TAG)
                .build()
                .user_data(CONTROL_TAG);
            // SAFETY: no buffers involved.
            if unsafe { driver.ring.submission().push(&sqe) }.is_err() {
                return; // retried next iteration
            }
            driver.armed_deadline = None;
        }
        if let Some(deadline) = deadline {
            let until = clock::duration_until(deadline);
            driver.timespec = types::Timespec::new()
                .sec(until.as_secs())
                .nsec(until.subsec_nanos());
            let sqe = opcode::Timeout::new(&driver.timespec)
                .build()
                .user_data(TIMEOUT_TAG);
            // SAFETY: the timespec lives in the driver, which outlives the
            // submission; the kernel reads it during submit.
            if unsafe { driver.ring.submission().push(&sqe) }.is_ok() {
                driver.armed_deadline = Some(deadline);
            }
        }
    }
}

/// Pushes staged entries until the submission queue fills or the backlog is
/// empty. Returns whether everything was flushed.
fn flush_staged(driver: &mut Driver, state: &mut PState) -> bool {
    while let Some(&staged) = state.staged.front() {
        let sqe = match staged {
            Staged::Submit(id) => {
                let Some(rec) = state.inflight.get_mut(&id) else {
                    state.staged.pop_front();
                    continue;
                };
                build_sqe(rec, id)
            }
            Staged::Cancel(id) => opcode::AsyncCancel::new(id).build().user_data(CONTROL_TAG),
        };
        // SAFETY: every pointer in the entry targets storage owned by the
        // in-flight record, which stays in the inflight map until its
        // completion is reaped.
        if unsafe { driver.ring.submission().push(&sqe) }.is_err() {
            return false;
        }
        state.staged.pop_front();
    }
    true
}

fn build_sqe(rec: &mut ProactorOp, id: u64) -> io_uring::squeue::Entry {
    let fd = types::Fd(rec.fd);
    match &mut rec.kind {
        OpKind::Recv { buf, flags, .. } => {
            opcode::Recv::new(fd, buf.as_mut_ptr(), buf.len() as u32)
                .flags(*flags)
                .build()
                .user_data(id)
        }
        OpKind::Send { buf, flags } => {
            opcode::Send::new(fd, buf.as_ptr(), buf.len() as u32)
                .flags(*flags)
                .build()
                .user_data(id)
        }
        OpKind::RecvFrom { buf, flags, msg } => {
            msg.wire(buf, true);
            msg.hdr.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            opcode::RecvMsg::new(fd, &mut msg.hdr)
                .flags(*flags as u32)
                .build()
                .user_data(id)
        }
        OpKind::SendTo { buf, flags, msg } => {
            msg.wire(buf, true);
            opcode::SendMsg::new(fd, &msg.hdr)
                .flags(*flags as u32)
                .build()
                .user_data(id)
        }
        OpKind::Accept { addr } => {
            addr.len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            opcode::Accept::new(
                fd,
                &mut addr.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut addr.len,
            )
            .flags(libc::SOCK_CLOEXEC)
            .build()
            .user_data(id)
        }
        OpKind::Connect { addr } => opcode::Connect::new(
            fd,
            &addr.storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            addr.len,
        )
        .build()
        .user_data(id),
    }
}
