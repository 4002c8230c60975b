//! Deadline timer behavior: firing, ordering and cancellation.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use riptide::{DeadlineTimer, IoContext};

#[test]
fn a_timer_never_fires_early() {
    let ctx = IoContext::new().unwrap();
    let mut timer = DeadlineTimer::new(&ctx);
    timer.expires_after(Duration::from_millis(60));

    let deadline = timer.expiry();
    let fired_at = Arc::new(Mutex::new(None));
    let slot = fired_at.clone();
    timer.async_wait(move |result| {
        result.unwrap();
        *slot.lock().unwrap() = Some(Instant::now());
    });

    assert_eq!(ctx.run(), 1);
    let fired_at = fired_at.lock().unwrap().expect("the wait handler ran");
    assert!(fired_at >= deadline, "fired {deadline:?} early");
}

#[test]
fn cancelling_one_timer_leaves_the_other() {
    let ctx = IoContext::new().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut slow = DeadlineTimer::new(&ctx);
    slow.expires_after(Duration::from_secs(1));
    let slot = events.clone();
    slow.async_wait(move |result| {
        let label = if result.is_err_and(|e| e.is_aborted()) {
            "slow-aborted"
        } else {
            "slow-ok"
        };
        slot.lock().unwrap().push((label, Instant::now()));
    });

    let mut quick = DeadlineTimer::new(&ctx);
    quick.expires_after(Duration::from_millis(100));
    let slot = events.clone();
    quick.async_wait(move |result| {
        result.unwrap();
        slot.lock().unwrap().push(("quick-ok", Instant::now()));
    });

    // A third timer performs the cancellation from inside the run loop.
    let started = Instant::now();
    let mut canceller = DeadlineTimer::new(&ctx);
    canceller.expires_after(Duration::from_millis(50));
    canceller.async_wait(move |result| {
        result.unwrap();
        assert_eq!(slow.cancel(), 1, "exactly one wait was outstanding");
    });

    assert_eq!(ctx.run(), 3, "every handler ran exactly once");

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, "slow-aborted");
    assert_eq!(events[1].0, "quick-ok");
    assert!(
        events[0].1 - started < Duration::from_millis(900),
        "the aborted handler must not wait out the original deadline"
    );
    assert!(events[1].1 - started >= Duration::from_millis(100));
}

#[test]
fn equal_deadlines_fire_in_insertion_order() {
    let ctx = IoContext::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let deadline = Instant::now() + Duration::from_millis(40);
    let mut timers = Vec::new();
    for i in 0..5 {
        let mut t = DeadlineTimer::new(&ctx);
        t.expires_at(deadline);
        let order = order.clone();
        t.async_wait(move |result| {
            result.unwrap();
            order.lock().unwrap().push(i);
        });
        timers.push(t);
    }

    assert_eq!(ctx.run(), 5);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn moving_the_expiry_cancels_outstanding_waits() {
    let ctx = IoContext::new().unwrap();
    let mut timer = DeadlineTimer::new(&ctx);
    timer.expires_after(Duration::from_secs(30));

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..3 {
        let outcomes = outcomes.clone();
        timer.async_wait(move |result| {
            outcomes.lock().unwrap().push(result.is_ok());
        });
    }

    assert_eq!(timer.expires_after(Duration::from_millis(20)), 3);
    let outcomes_after = outcomes.clone();
    timer.async_wait(move |result| {
        outcomes_after.lock().unwrap().push(result.is_ok());
    });

    assert_eq!(ctx.run(), 4);
    assert_eq!(*outcomes.lock().unwrap(), vec![false, false, false, true]);
}

#[test]
fn a_past_deadline_fires_immediately() {
    let ctx = IoContext::new().unwrap();
    let mut timer = DeadlineTimer::new(&ctx);
    timer.expires_at(Instant::now() - Duration::from_millis(5));

    let fired = Arc::new(Mutex::new(false));
    let slot = fired.clone();
    timer.async_wait(move |result| {
        result.unwrap();
        *slot.lock().unwrap() = true;
    });

    let started = Instant::now();
    assert_eq!(ctx.run(), 1);
    assert!(*fired.lock().unwrap());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn blocking_wait_sleeps_until_the_deadline() {
    let ctx = IoContext::new().unwrap();
    let mut timer = DeadlineTimer::new(&ctx);
    timer.expires_after(Duration::from_millis(50));

    let started = Instant::now();
    timer.wait().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn cancel_with_nothing_outstanding_reports_zero() {
    let ctx = IoContext::new().unwrap();
    let timer = DeadlineTimer::new(&ctx);
    assert_eq!(timer.cancel(), 0);
}
