//! Run-loop semantics: posting, dispatching, stopping and work accounting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use riptide::{IoContext, Strand, WorkGuard};

#[test]
fn posted_handlers_run_in_fifo_order() {
    let ctx = IoContext::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..10 {
        let order = order.clone();
        ctx.post(move || order.lock().unwrap().push(i));
    }

    let ran = ctx.run();
    assert_eq!(ran, 10, "run reports the number of handlers it executed");
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn stop_is_observed_at_the_next_queue_check() {
    let ctx = IoContext::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..10 {
        let order = order.clone();
        let stopper = ctx.clone();
        ctx.post(move || {
            order.lock().unwrap().push(i);
            if i == 4 {
                stopper.stop();
            }
        });
    }

    assert_eq!(ctx.run(), 5, "the stop lands before the sixth handler");
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    ctx.restart();
    assert_eq!(ctx.run(), 5, "the remaining handlers survive the stop");
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn run_returns_zero_when_already_stopped() {
    let ctx = IoContext::new().unwrap();
    ctx.post(|| {});
    ctx.stop();
    assert_eq!(ctx.run(), 0);
    ctx.restart();
    assert_eq!(ctx.run(), 1);
}

#[test]
fn four_workers_share_ten_thousand_handlers() {
    let ctx = IoContext::new().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..10_000 {
        let hits = hits.clone();
        ctx.post(move || {
            hits.fetch_add(1, Ordering::Relaxed);
        });
    }

    let total: usize = thread::scope(|s| {
        let workers: Vec<_> = (0..4).map(|_| s.spawn(|| ctx.run())).collect();
        workers.into_iter().map(|w| w.join().unwrap()).sum()
    });

    assert_eq!(hits.load(Ordering::SeqCst), 10_000, "no handler is lost or run twice");
    assert_eq!(total, 10_000);
}

#[test]
fn dispatch_from_a_worker_runs_inline() {
    let ctx = IoContext::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let inner_order = order.clone();
    let dispatcher = ctx.clone();
    ctx.post(move || {
        let o = inner_order.clone();
        dispatcher.dispatch(move || o.lock().unwrap().push("inner"));
        inner_order.lock().unwrap().push("after");
    });

    ctx.run();
    assert_eq!(
        *order.lock().unwrap(),
        vec!["inner", "after"],
        "inline dispatch finishes before the dispatching handler continues"
    );
}

#[test]
fn dispatch_from_outside_behaves_as_post() {
    let ctx = IoContext::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let flag = ran.clone();
    ctx.dispatch(move || {
        flag.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(
        ran.load(Ordering::SeqCst),
        0,
        "a non-worker dispatch never runs on the caller's stack"
    );

    ctx.run();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn deep_dispatch_chains_fall_back_to_posting() {
    let ctx = IoContext::new().unwrap();
    let depth = Arc::new(AtomicUsize::new(0));

    fn recurse(ctx: &IoContext, depth: Arc<AtomicUsize>) {
        let next = ctx.clone();
        depth.fetch_add(1, Ordering::SeqCst);
        if depth.load(Ordering::SeqCst) < 10_000 {
            ctx.dispatch(move || recurse(&next.clone(), depth));
        }
    }

    let start = ctx.clone();
    let d = depth.clone();
    ctx.post(move || recurse(&start, d));
    ctx.run();

    assert_eq!(
        depth.load(Ordering::SeqCst),
        10_000,
        "every dispatch in the chain ran exactly once"
    );
}

#[test]
fn work_guard_keeps_run_alive() {
    let ctx = IoContext::new().unwrap();
    let guard = WorkGuard::new(&ctx);

    let worker_ctx = ctx.clone();
    let worker = thread::spawn(move || {
        let started = Instant::now();
        worker_ctx.run();
        started.elapsed()
    });

    thread::sleep(Duration::from_millis(120));
    drop(guard);

    let ran_for = worker.join().unwrap();
    assert!(
        ran_for >= Duration::from_millis(80),
        "run returned after {ran_for:?}, before the guard was released"
    );
}

#[test]
fn cloned_work_guards_hold_independent_units() {
    let ctx = IoContext::new().unwrap();
    let guard = WorkGuard::new(&ctx);
    let copy = guard.clone();
    drop(guard);

    ctx.post(|| {});
    let worker_ctx = ctx.clone();
    let worker = thread::spawn(move || worker_ctx.run());

    thread::sleep(Duration::from_millis(50));
    drop(copy);
    assert_eq!(worker.join().unwrap(), 1);
}

#[test]
fn wrap_returns_a_dispatching_callable() {
    let ctx = IoContext::new().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let flag = hits.clone();
    let wrapped = ctx.wrap(move || {
        flag.fetch_add(1, Ordering::SeqCst);
    });
    wrapped();
    wrapped();

    assert_eq!(ctx.run(), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn strand_serializes_handlers_across_workers() {
    let ctx = IoContext::new().unwrap();
    let strand = Strand::new(&ctx);
    let inside = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..200 {
        let inside = inside.clone();
        let order = order.clone();
        strand.post(move || {
            assert_eq!(
                inside.fetch_add(1, Ordering::SeqCst),
                0,
                "two strand handlers overlapped"
            );
            order.lock().unwrap().push(i);
            inside.fetch_sub(1, Ordering::SeqCst);
        });
    }

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| ctx.run());
        }
    });

    assert_eq!(*order.lock().unwrap(), (0..200).collect::<Vec<_>>());
}

#[test]
fn strand_dispatch_inside_a_strand_handler_runs_inline() {
    let ctx = IoContext::new().unwrap();
    let strand = Strand::new(&ctx);
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    let inner_strand = strand.clone();
    strand.post(move || {
        let oo = o.clone();
        inner_strand.dispatch(move || oo.lock().unwrap().push("inner"));
        o.lock().unwrap().push("after");
    });

    ctx.run();
    assert_eq!(*order.lock().unwrap(), vec!["inner", "after"]);
}
