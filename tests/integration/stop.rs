//! Stop delivery across every scheduling state: a stopped tag unwinds
//! all of its jobs within the same `work` call, whatever they were
//! blocked on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rove_sched::{Clock, Job, JobError, ManualClock, Scheduler, Tag};

#[test]
fn test_stop_unwinds_sleeping_waiting_and_running_jobs() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut sched = Scheduler::new(clock.clone());
    let tag = Tag::new("mission");
    let unwound = Arc::new(AtomicUsize::new(0));

    let t = tag.clone();
    let u = unwound.clone();
    let c = clock.clone();
    let sleeper = Job::new("sleeper", move |ctx| {
        ctx.job().push_tag(t.clone());
        let res = ctx.sleep_until(c.now() + 3_600_000_000);
        if res == Err(JobError::Interrupted) {
            u.fetch_add(1, Ordering::SeqCst);
        }
        res
    });
    sleeper.start(&mut sched).unwrap();

    let t = tag.clone();
    let u = unwound.clone();
    let waiter = Job::new("waiter", move |ctx| {
        ctx.job().push_tag(t.clone());
        // Keep re-waiting: spurious wake-ups from other jobs' side
        // effects must not end the vigil, only the stop may.
        loop {
            if let Err(e) = ctx.wait_for_external_change() {
                if e == JobError::Interrupted {
                    u.fetch_add(1, Ordering::SeqCst);
                }
                return Err(e);
            }
        }
    });
    waiter.start(&mut sched).unwrap();

    let t = tag.clone();
    let u = unwound.clone();
    let runner = Job::new("runner", move |ctx| {
        ctx.job().push_tag(t.clone());
        loop {
            if let Err(e) = ctx.yield_now() {
                if e == JobError::Interrupted {
                    u.fetch_add(1, Ordering::SeqCst);
                }
                return Err(e);
            }
        }
    });
    runner.start(&mut sched).unwrap();

    sched.work();
    assert_eq!(unwound.load(Ordering::SeqCst), 0);

    tag.stop();
    sched.signal_stop(tag.clone());
    sched.work();

    // All three were interrupted during this single call.
    assert_eq!(unwound.load(Ordering::SeqCst), 3);
    assert!(sleeper.terminated() && waiter.terminated() && runner.terminated());
    assert_eq!(sched.job_count(), 0);
    // The transient stop does not leave the tag blocked.
    assert!(!tag.blocked());
}

#[test]
fn test_stop_only_affects_tagged_jobs() {
    let clock = Arc::new(ManualClock::new(0));
    let mut sched = Scheduler::new(clock);
    let tag = Tag::new("mission");

    let t = tag.clone();
    let tagged = Job::new("tagged", move |ctx| {
        ctx.job().push_tag(t.clone());
        loop {
            ctx.yield_now()?;
        }
    });
    tagged.start(&mut sched).unwrap();

    let untagged = Job::new("untagged", |ctx| {
        for _ in 0..5 {
            ctx.yield_now()?;
        }
        Ok(())
    });
    untagged.start(&mut sched).unwrap();

    sched.work();
    tag.stop();
    sched.signal_stop(tag.clone());
    sched.work();

    assert!(tagged.terminated());
    assert_eq!(tagged.result(), Some(Err(JobError::Interrupted)));
    assert!(!untagged.terminated());

    // The bystander runs its course untouched.
    for _ in 0..5 {
        sched.work();
    }
    assert_eq!(untagged.result(), Some(Ok(())));
}

#[test]
fn test_popped_tag_no_longer_stops_the_job() {
    let clock = Arc::new(ManualClock::new(0));
    let mut sched = Scheduler::new(clock);
    let tag = Tag::new("scoped");

    let t = tag.clone();
    let job = Job::new("scoped-worker", move |ctx| {
        ctx.job().push_tag(t.clone());
        ctx.yield_now()?;
        ctx.job().pop_tag();
        // Outside the construct: the later stop must not reach us.
        ctx.yield_now()?;
        ctx.yield_now()?;
        Ok(())
    });
    job.start(&mut sched).unwrap();

    sched.work(); // slice 1, tag pushed
    sched.work(); // slice 2, tag popped
    tag.stop();
    sched.signal_stop(tag);
    sched.work();
    sched.work();
    assert_eq!(job.result(), Some(Ok(())));
}
