//! Kill safety from the host side: killed jobs unwind on their own
//! context, bystanders keep running, and a dropped scheduler reaps every
//! remaining context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use rove_sched::{Job, JobError, ManualClock, Scheduler};

#[test]
fn test_kill_releases_guards_on_the_job_context() {
    let clock = Arc::new(ManualClock::new(0));
    let mut sched = Scheduler::new(clock);
    let cleanups: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    struct Guard(Arc<Mutex<Vec<&'static str>>>, &'static str);
    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.lock().push(self.1);
        }
    }

    let cl = cleanups.clone();
    let job = Job::new("guarded", move |ctx| {
        let _outer = Guard(cl.clone(), "outer");
        ctx.yield_now()?;
        let _inner = Guard(cl.clone(), "inner");
        loop {
            ctx.yield_now()?;
        }
    });
    job.start(&mut sched).unwrap();

    sched.work();
    sched.work();
    assert!(cleanups.lock().is_empty());

    sched.kill_job(&job).unwrap();
    assert!(job.terminated());
    assert_eq!(job.result(), Some(Err(JobError::Terminated)));
    // Unwinding ran the destructors, innermost first.
    assert_eq!(*cleanups.lock(), vec!["inner", "outer"]);
}

#[test]
fn test_kill_between_rounds_leaves_bystanders_running() {
    let clock = Arc::new(ManualClock::new(0));
    let mut sched = Scheduler::new(clock);
    let slices = Arc::new(AtomicUsize::new(0));

    let doomed = Job::new("doomed", |ctx| loop {
        ctx.yield_now()?;
    });
    doomed.start(&mut sched).unwrap();

    let s = slices.clone();
    let bystander = Job::new("bystander", move |ctx| {
        for _ in 0..4 {
            s.fetch_add(1, Ordering::SeqCst);
            ctx.yield_now()?;
        }
        Ok(())
    });
    bystander.start(&mut sched).unwrap();

    sched.work();
    sched.kill_job(&doomed).unwrap();
    for _ in 0..4 {
        sched.work();
    }
    assert_eq!(slices.load(Ordering::SeqCst), 4);
    assert_eq!(bystander.result(), Some(Ok(())));
}

#[test]
fn test_drop_scheduler_reaps_live_jobs() {
    let clock = Arc::new(ManualClock::new(0));
    let mut sched = Scheduler::new(clock);
    let mut jobs = Vec::new();
    for id in 0..4 {
        let job = Job::new(format!("immortal-{}", id), |ctx| loop {
            ctx.yield_now()?;
        });
        job.start(&mut sched).unwrap();
        jobs.push(job);
    }
    sched.work();

    // Dropping must unwind and join every context; if a context thread
    // leaked parked, the test harness would report it hanging.
    drop(sched);
    for job in &jobs {
        assert!(job.terminated());
        assert_eq!(job.result(), Some(Err(JobError::Terminated)));
    }
}

#[test]
fn test_killed_job_is_joinable() {
    let clock = Arc::new(ManualClock::new(0));
    let mut sched = Scheduler::new(clock);

    let target = Job::new("target", |ctx| loop {
        ctx.yield_now()?;
    });

    let t = target.clone();
    let joiner = Job::new("joiner", move |ctx| ctx.join(&t));

    joiner.start(&mut sched).unwrap();
    target.start(&mut sched).unwrap();
    sched.work();

    sched.kill_job(&target).unwrap();
    sched.work();
    // The joiner wakes on the target's termination, however it happened.
    assert_eq!(joiner.result(), Some(Ok(())));
}
