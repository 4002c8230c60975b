//! The io context: public entry points and multi-thread coordination.
//!
//! Any number of threads may call [`IoContext::run`] on the same context.
//! Workers alternate between draining the posted-handler queue and driving
//! the demultiplexer; exactly one worker at a time owns the demultiplexer,
//! the rest park until work arrives. The outstanding-work counter keeps
//! `run()` alive while operations are in flight and stops every worker once
//! it reaches zero.

use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use log::debug;
use metrics::{counter, gauge};

use crate::engine::{Engine, EngineKind};
use crate::error::{Error, Result};
use crate::op::{handler_op, ReadyOp};
use crate::reactor::Reactor;

#[cfg(target_os = "linux")]
use crate::proactor::Proactor;

/// Deepest chain of nested inline [`IoContext::dispatch`] calls before the
/// context falls back to posting, to keep handler recursion off the stack.
pub const DISPATCH_DEPTH_LIMIT: usize = 64;

/// A dedicated driver thread re-checks context liveness at least this often.
const DEDICATED_POLL_CAP: Duration = Duration::from_millis(500);

thread_local! {
    /// Identities of the contexts whose run loop or inline dispatch frames
    /// are on this thread's stack.
    static ACTIVE_CONTEXTS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct Sleeper {
    idle: AtomicBool,
    thread: Thread,
}

pub(crate) struct ContextInner {
    ready: SegQueue<ReadyOp>,
    outstanding_work: AtomicUsize,
    stopped: AtomicBool,
    engine: Engine,
    /// Claimed by the worker currently driving the demultiplexer.
    driver_claimed: AtomicBool,
    /// True when a dedicated thread drives the demultiplexer instead.
    dedicated_driver: bool,
    sleepers: Mutex<Vec<Arc<Sleeper>>>,
    threads_in_run: AtomicUsize,
}

impl ContextInner {
    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Queues a ready operation and wakes a worker to take it.
    pub(crate) fn enqueue(&self, op: ReadyOp) {
        self.ready.push(op);
        gauge!("riptide_ready_queue_depth").set(self.ready.len() as f64);
        self.wake_one();
    }

    /// Attempts to wake one parked worker; when none is parked, interrupts
    /// the demultiplexer in case a worker is blocked in the kernel instead.
    fn wake_one(&self) {
        {
            let sleepers = self.sleepers.lock().unwrap();
            for sleeper in sleepers.iter() {
                if sleeper.idle.swap(false, Ordering::AcqRel) {
                    sleeper.thread.unpark();
                    counter!("riptide_worker_unparks_total").increment(1);
                    return;
                }
            }
        }
        counter!("riptide_worker_saturation_events_total").increment(1);
        self.engine.interrupt();
    }

    pub(crate) fn work_started(&self) {
        self.outstanding_work.fetch_add(1, Ordering::AcqRel);
    }

    /// The last unit of work stops every worker.
    pub(crate) fn work_finished(&self) {
        if self.outstanding_work.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.do_stop();
        }
    }

    fn do_stop(&self) {
        self.stopped.store(true, Ordering::Release);
        {
            let sleepers = self.sleepers.lock().unwrap();
            for sleeper in sleepers.iter() {
                if sleeper.idle.swap(false, Ordering::AcqRel) {
                    sleeper.thread.unpark();
                }
            }
        }
        self.engine.interrupt();
    }
}

/// The execution context shared by sockets, timers and posted handlers.
///
/// Cloning is cheap and yields another handle to the same context.
#[derive(Clone)]
pub struct IoContext {
    inner: Arc<ContextInner>,
}

impl IoContext {
    /// A readiness-engine context with default options.
    pub fn new() -> Result<Self> {
        IoContextBuilder::new().build()
    }

    pub fn builder() -> IoContextBuilder {
        IoContextBuilder::new()
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.inner.engine.kind()
    }

    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Queues `handler` for invocation by a worker inside [`run`](Self::run).
    /// The handler never runs on the caller's stack.
    pub fn post<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        counter!("riptide_handlers_posted_total").increment(1);
        self.inner.work_started();
        self.inner.enqueue(handler_op(handler));
    }

    /// Runs `handler` inline when the calling thread is already executing
    /// inside this context's `run()`, otherwise behaves as [`post`](Self::post).
    ///
    /// Inline invocation is bounded to [`DISPATCH_DEPTH_LIMIT`] nested
    /// dispatches; deeper chains fall back to posting.
    pub fn dispatch<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.id();
        let depth =
            ACTIVE_CONTEXTS.with(|active| active.borrow().iter().filter(|c| **c == id).count());
        if depth >= 1 && depth < 1 + DISPATCH_DEPTH_LIMIT {
            self.inner.work_started();
            let _work = WorkFinishGuard(&self.inner);
            let _frame = TlsFrame::push(id);
            handler();
        } else {
            self.post(handler);
        }
    }

    /// Returns a callable that dispatches `handler` on this context.
    pub fn wrap<F>(&self, handler: F) -> impl Fn()
    where
        F: Fn() + Clone + Send + 'static,
    {
        let ctx = self.clone();
        move || ctx.dispatch(handler.clone())
    }

    /// Runs handlers until the context is stopped or runs out of work.
    /// Returns the number of handlers executed by this thread.
    pub fn run(&self) -> usize {
        let inner: &ContextInner = &self.inner;
        if inner.stopped.load(Ordering::Acquire) {
            return 0;
        }
        inner.threads_in_run.fetch_add(1, Ordering::AcqRel);
        let _run = RunGuard(inner);
        let _frame = TlsFrame::push(self.id());

        let sleeper = Arc::new(Sleeper {
            idle: AtomicBool::new(false),
            thread: thread::current(),
        });
        inner.sleepers.lock().unwrap().push(sleeper.clone());
        let _slot = SleeperGuard {
            inner,
            me: sleeper.clone(),
        };

        let mut executed = 0usize;
        loop {
            if inner.stopped.load(Ordering::Acquire) {
                break;
            }

            if let Some(op) = inner.ready.pop() {
                let _work = WorkFinishGuard(inner);
                op.run();
                executed += 1;
                continue;
            }

            if inner.outstanding_work.load(Ordering::Acquire) == 0 {
                inner.do_stop();
                break;
            }

            if !inner.dedicated_driver && !inner.driver_claimed.swap(true, Ordering::AcqRel) {
                let _driver = DriverGuard(inner);
                inner.engine.run_iteration(inner, true, None);
                continue;
            }

            // Nothing to run and the demultiplexer is already manned: park.
            sleeper.idle.store(true, Ordering::Release);
            // Recheck to avoid a lost wakeup.
            if !inner.ready.is_empty()
                || inner.stopped.load(Ordering::Acquire)
                || inner.outstanding_work.load(Ordering::Acquire) == 0
                || (!inner.dedicated_driver && !inner.driver_claimed.load(Ordering::Acquire))
            {
                sleeper.idle.store(false, Ordering::Release);
                continue;
            }
            thread::park();
            sleeper.idle.store(false, Ordering::Release);
        }

        executed
    }

    /// Stops the context: every worker returns from `run()` as soon as it
    /// observes the flag. Pending operations are not cancelled; they fire
    /// after [`restart`](Self::restart) and another `run()`.
    pub fn stop(&self) {
        debug!("io context stop requested");
        self.inner.do_stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Transitions a stopped context back to runnable. Only valid while no
    /// worker is inside `run()`.
    pub fn restart(&self) {
        debug_assert_eq!(
            self.inner.threads_in_run.load(Ordering::SeqCst),
            0,
            "restart while workers are still inside run()"
        );
        self.inner.stopped.store(false, Ordering::Release);
    }
}

/// RAII token that keeps [`IoContext::run`] alive.
///
/// Each guard (and each clone) holds one unit of outstanding work for its
/// lifetime, for callers that will submit work later.
pub struct WorkGuard {
    inner: Arc<ContextInner>,
}

impl WorkGuard {
    pub fn new(ctx: &IoContext) -> Self {
        ctx.inner.work_started();
        Self {
            inner: ctx.inner.clone(),
        }
    }
}

impl Clone for WorkGuard {
    fn clone(&self) -> Self {
        self.inner.work_started();
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.inner.work_finished();
    }
}

/// Configures and builds an [`IoContext`].
pub struct IoContextBuilder {
    kind: EngineKind,
    dedicated_driver: bool,
    metrics_port: Option<u16>,
}

impl IoContextBuilder {
    pub fn new() -> Self {
        Self {
            kind: EngineKind::Readiness,
            dedicated_driver: false,
            metrics_port: None,
        }
    }

    pub fn engine(mut self, kind: EngineKind) -> Self {
        self.kind = kind;
        self
    }

    /// Spawns a dedicated thread at build time to drive the demultiplexer,
    /// instead of `run()` workers taking turns. The thread winds down on its
    /// own once the context is gone.
    pub fn dedicated_driver_thread(mut self) -> Self {
        self.dedicated_driver = true;
        self
    }

    /// Serves engine metrics on `http://localhost:{port}/metrics`.
    pub fn metrics_exporter(mut self, port: u16) -> Self {
        self.metrics_port = Some(port);
        self
    }

    pub fn build(self) -> Result<IoContext> {
        if let Some(port) = self.metrics_port {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(([127, 0, 0, 1], port))
                .install()
                .map_err(|e| Error::Sys(io::Error::other(e)))?;
            debug!("metrics enabled at http://localhost:{port}/metrics");
        }

        let engine = match self.kind {
            EngineKind::Readiness => Engine::Readiness(Reactor::new()?),
            EngineKind::Completion => {
                #[cfg(target_os = "linux")]
                {
                    Engine::Completion(Proactor::new()?)
                }
                #[cfg(not(target_os = "linux"))]
                {
                    return Err(Error::InvalidArgument);
                }
            }
        };

        let inner = Arc::new(ContextInner {
            ready: SegQueue::new(),
            outstanding_work: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            engine,
            driver_claimed: AtomicBool::new(false),
            dedicated_driver: self.dedicated_driver,
            sleepers: Mutex::new(Vec::new()),
            threads_in_run: AtomicUsize::new(0),
        });

        if self.dedicated_driver {
            spawn_driver_thread(&inner);
        }

        Ok(IoContext { inner })
    }
}

impl Default for IoContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_driver_thread(inner: &Arc<ContextInner>) {
    let weak = Arc::downgrade(inner);
    thread::Builder::new()
        .name("riptide-driver".into())
        .spawn(move || {
            loop {
                // Hold the context only across one iteration so the loop
                // notices when the last user handle goes away.
                let Some(inner) = weak.upgrade() else { break };
                inner
                    .engine
                    .run_iteration(&inner, true, Some(DEDICATED_POLL_CAP));
            }
            debug!("dedicated driver thread exiting");
        })
        .expect("failed to spawn driver thread");
}

struct TlsFrame;

impl TlsFrame {
    fn push(id: usize) -> Self {
        ACTIVE_CONTEXTS.with(|active| active.borrow_mut().push(id));
        TlsFrame
    }
}

impl Drop for TlsFrame {
    fn drop(&mut self) {
        ACTIVE_CONTEXTS.with(|active| {
            active.borrow_mut().pop();
        });
    }
}

/// Decrements outstanding work even when a handler panics, so a later
/// `run()` can resume dispatch with a consistent counter.
struct WorkFinishGuard<'a>(&'a ContextInner);

impl Drop for WorkFinishGuard<'_> {
    fn drop(&mut self) {
        self.0.work_finished();
    }
}

struct RunGuard<'a>(&'a ContextInner);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.threads_in_run.fetch_sub(1, Ordering::AcqRel);
    }
}

struct SleeperGuard<'a> {
    inner: &'a ContextInner,
    me: Arc<Sleeper>,
}

impl Drop for SleeperGuard<'_> {
    fn drop(&mut self) {
        let mut sleepers = self.inner.sleepers.lock().unwrap();
        sleepers.retain(|s| !Arc::ptr_eq(s, &self.me));
    }
}

/// Hands the demultiplexer slot back and offers it to a parked worker.
struct DriverGuard<'a>(&'a ContextInner);

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        self.0.driver_claimed.store(false, Ordering::Release);
        if !self.0.ready.is_empty() {
            self.0.wake_one();
        }
    }
}
