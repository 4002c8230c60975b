//! Serialized handler execution.
//!
//! A strand guarantees that no two of its handlers run concurrently and that
//! consecutive handlers see each other's effects. It owns no thread: handlers
//! still run on whichever worker is inside `run()`, but the strand submits
//! them one runner at a time.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::IoContext;

static NEXT_STRAND_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Strands whose handlers are on this thread's stack.
    static ACTIVE_STRANDS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

type Handler = Box<dyn FnOnce() + Send>;

struct StrandState {
    /// A runner is queued or executing on the context.
    running: bool,
    pending: VecDeque<Handler>,
}

struct StrandInner {
    ctx: IoContext,
    id: u64,
    state: Mutex<StrandState>,
}

/// Serializes a group of handlers on one context.
#[derive(Clone)]
pub struct Strand {
    inner: Arc<StrandInner>,
}

impl Strand {
    pub fn new(ctx: &IoContext) -> Self {
        Self {
            inner: Arc::new(StrandInner {
                ctx: ctx.clone(),
                id: NEXT_STRAND_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(StrandState {
                    running: false,
                    pending: VecDeque::new(),
                }),
            }),
        }
    }

    /// Queues `handler` behind any handler currently owned by the strand.
    pub fn post<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let start_runner = {
            let mut state = self.inner.state.lock().unwrap();
            state.pending.push_back(Box::new(handler));
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };
        if start_runner {
            let inner = self.inner.clone();
            self.inner.ctx.post(move || run_chain(inner));
        }
    }

    /// Runs `handler` inline when the calling thread is already inside one of
    /// this strand's handlers; otherwise queues it like [`post`](Self::post).
    pub fn dispatch<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.id;
        let on_strand = ACTIVE_STRANDS.with(|active| active.borrow().contains(&id));
        if on_strand {
            handler();
        } else {
            self.post(handler);
        }
    }

    /// Returns a callable that dispatches `handler` on this strand.
    pub fn wrap<F>(&self, handler: F) -> impl Fn()
    where
        F: Fn() + Clone + Send + 'static,
    {
        let strand = self.clone();
        move || strand.dispatch(handler.clone())
    }
}

/// Drains the pending queue, one handler after another, on the worker that
/// picked the runner up. The queue mutex is never held across a handler.
fn run_chain(inner: Arc<StrandInner>) {
    ACTIVE_STRANDS.with(|active| active.borrow_mut().push(inner.id));
    let _mark = StrandMark;
    // If a handler panics, hand the remaining queue to a fresh runner so the
    // strand does not stall.
    let _resume = ResumeOnUnwind { inner: &inner };

    loop {
        let next = {
            let mut state = inner.state.lock().unwrap();
            match state.pending.pop_front() {
                Some(handler) => handler,
                None => {
                    state.running = false;
                    break;
                }
            }
        };
        next();
    }
}

struct StrandMark;

impl Drop for StrandMark {
    fn drop(&mut self) {
        ACTIVE_STRANDS.with(|active| {
            active.borrow_mut().pop();
        });
    }
}

struct ResumeOnUnwind<'a> {
    inner: &'a Arc<StrandInner>,
}

impl Drop for ResumeOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut state = self.inner.state.lock().unwrap();
            if state.pending.is_empty() {
                state.running = false;
            } else {
                let inner = self.inner.clone();
                self.inner.ctx.post(move || run_chain(inner));
            }
        }
    }
}
