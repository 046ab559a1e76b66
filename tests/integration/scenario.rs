//! End-to-end host scenario: an active worker and a timed sleeper share
//! one scheduler, driven round by round from a hand-advanced clock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rove_sched::{Job, ManualClock, Scheduler};

#[test]
fn test_worker_and_sleeper_interleave() {
    let clock = Arc::new(ManualClock::new(0));
    let mut sched = Scheduler::new(clock.clone());

    let counter = Arc::new(AtomicUsize::new(0));
    let sleeper_done = Arc::new(AtomicBool::new(false));

    let c = counter.clone();
    let worker = Job::new("worker", move |ctx| {
        for slice in 0..3 {
            c.fetch_add(1, Ordering::SeqCst);
            if slice < 2 {
                ctx.yield_now()?;
            }
        }
        Ok(())
    });
    worker.start(&mut sched).unwrap();

    let d = sleeper_done.clone();
    let sleeper = Job::new("sleeper", move |ctx| {
        ctx.sleep_until(50_000)?;
        d.store(true, Ordering::SeqCst);
        Ok(())
    });
    sleeper.start(&mut sched).unwrap();

    // Round 1 at t=0: both start; the worker gets its first slice, the
    // sleeper parks until t=50ms.
    assert_eq!(sched.work(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    clock.advance(10_000);
    assert_eq!(sched.work(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    clock.advance(10_000);
    sched.work(); // worker's last slice, it terminates here
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert!(worker.terminated());
    assert_eq!(worker.result(), Some(Ok(())));
    assert!(!sleeper_done.load(Ordering::SeqCst));

    // Only the sleeper remains; the scheduler reports its deadline.
    clock.advance(10_000);
    assert_eq!(sched.work(), 50_000 - 30_000);
    assert!(!sleeper_done.load(Ordering::SeqCst));

    clock.set(50_000);
    sched.work();
    assert!(sleeper_done.load(Ordering::SeqCst));
    assert!(sleeper.terminated());
    assert_eq!(sched.job_count(), 0);
}

#[test]
fn test_jobs_spawning_jobs() {
    let clock = Arc::new(ManualClock::new(0));
    let mut sched = Scheduler::new(clock);

    // A job cannot schedule from inside its own slice (the scheduler is
    // borrowed by the round), so the host starts children between
    // rounds; children scheduled mid-session still start within one
    // round of being added.
    let ran = Arc::new(AtomicUsize::new(0));

    let r = ran.clone();
    let first = Job::new("first", move |ctx| {
        r.fetch_add(1, Ordering::SeqCst);
        ctx.yield_now()?;
        r.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    first.start(&mut sched).unwrap();
    sched.work();

    let r = ran.clone();
    let second = Job::new("second", move |_ctx| {
        r.fetch_add(10, Ordering::SeqCst);
        Ok(())
    });
    second.start(&mut sched).unwrap();
    sched.work();

    assert_eq!(ran.load(Ordering::SeqCst), 12);
    assert!(first.terminated() && second.terminated());
}
