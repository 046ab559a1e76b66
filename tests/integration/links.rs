//! Structured links between jobs: a real failure in one job reaches its
//! peers, plain cancellations do not.

use std::sync::Arc;

use rove_sched::{Job, JobError, ManualClock, Scheduler, Tag};

fn run_until_idle(sched: &mut Scheduler) {
    // Bounded: every test job terminates within a handful of rounds.
    for _ in 0..10 {
        if sched.job_count() == 0 {
            return;
        }
        sched.work();
    }
}

#[test]
fn test_failure_reaches_linked_peer() {
    let clock = Arc::new(ManualClock::new(0));
    let mut sched = Scheduler::new(clock);

    let worker = Job::new("worker", |ctx| {
        ctx.yield_now()?;
        Err(JobError::Custom("actuator jammed".into()))
    });
    let monitor = Job::new("monitor", |ctx| loop {
        ctx.yield_now()?;
    });
    monitor.link(&worker);

    worker.start(&mut sched).unwrap();
    monitor.start(&mut sched).unwrap();
    run_until_idle(&mut sched);

    assert_eq!(
        monitor.result(),
        Some(Err(JobError::LinkedFailure(Box::new(JobError::Custom(
            "actuator jammed".into()
        ))))),
    );
}

#[test]
fn test_cancellation_does_not_propagate() {
    let clock = Arc::new(ManualClock::new(0));
    let mut sched = Scheduler::new(clock);
    let tag = Tag::new("scoped");

    let t = tag.clone();
    let stopped = Job::new("stopped", move |ctx| {
        ctx.job().push_tag(t.clone());
        loop {
            ctx.yield_now()?;
        }
    });
    let peer = Job::new("peer", |ctx| {
        for _ in 0..3 {
            ctx.yield_now()?;
        }
        Ok(())
    });
    peer.link(&stopped);

    stopped.start(&mut sched).unwrap();
    peer.start(&mut sched).unwrap();
    sched.work();

    tag.stop();
    sched.signal_stop(tag);
    run_until_idle(&mut sched);

    // The interruption stays with the stopped job.
    assert_eq!(stopped.result(), Some(Err(JobError::Interrupted)));
    assert_eq!(peer.result(), Some(Ok(())));
}

#[test]
fn test_unlink_severs_propagation() {
    let clock = Arc::new(ManualClock::new(0));
    let mut sched = Scheduler::new(clock);

    let worker = Job::new("worker", |ctx| {
        ctx.yield_now()?;
        Err(JobError::Custom("boom".into()))
    });
    let peer = Job::new("peer", |ctx| {
        for _ in 0..3 {
            ctx.yield_now()?;
        }
        Ok(())
    });
    peer.link(&worker);
    peer.unlink(&worker);

    worker.start(&mut sched).unwrap();
    peer.start(&mut sched).unwrap();
    run_until_idle(&mut sched);

    assert_eq!(peer.result(), Some(Ok(())));
}

#[test]
fn test_failure_fans_out_to_every_peer() {
    let clock = Arc::new(ManualClock::new(0));
    let mut sched = Scheduler::new(clock);

    let worker = Job::new("worker", |ctx| {
        ctx.yield_now()?;
        Err(JobError::Custom("boom".into()))
    });
    let mut peers = Vec::new();
    for id in 0..3 {
        let peer = Job::new(format!("peer-{}", id), |ctx| loop {
            ctx.yield_now()?;
        });
        peer.link(&worker);
        peer.start(&mut sched).unwrap();
        peers.push(peer);
    }
    worker.start(&mut sched).unwrap();
    run_until_idle(&mut sched);

    for peer in &peers {
        assert!(matches!(
            peer.result(),
            Some(Err(JobError::LinkedFailure(_)))
        ));
    }
}
