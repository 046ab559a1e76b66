//! The cooperative scheduler
//!
//! One `Scheduler` instance exists per interpreter session and owns every
//! job of that session. The host's outer event loop calls [`work`]
//! repeatedly; each call runs exactly one round over the current job set
//! and returns how long the host may wait before calling again.
//!
//! Within a round jobs are served in insertion order, so `Running` jobs
//! get round-robin fairness. Sleeping jobs gate on their deadline,
//! waiting jobs on the possible-side-effect flag, and a job whose tag
//! stack is blocked is resumed unconditionally so a stop request is never
//! missed.
//!
//! [`work`]: Scheduler::work

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::sched::errors::SchedulerError;
use crate::sched::job::{Job, JobState};
use crate::sched::tag::Tag;
use crate::util::clock::{Clock, Utime};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Stack size of each job's execution context.
    pub stack_size: usize,
    /// Remaining-stack threshold below which a job gets a
    /// stack-exhausted condition instead of being resumed normally.
    pub stack_threshold: usize,
    /// "Nothing to do soon" ceiling on the round deadline, microseconds.
    pub idle_ceiling: Utime,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stack_size: 2 * 1024 * 1024,
            stack_threshold: 64 * 1024,
            idle_ceiling: 3_600_000_000, // one hour
        }
    }
}

/// Sentinel deadline: more work is pending, call `work` again immediately.
const IMMEDIATE: Utime = 0;

/// The cooperative scheduler: owns the job set and drives rounds.
pub struct Scheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    /// Jobs scheduled for the next round, in service order. During a
    /// round this accumulates the jobs of the round after it.
    jobs: VecDeque<Arc<Job>>,
    /// The job currently holding the execution token, if any.
    current: Option<Arc<Job>>,
    /// Did a job resumed since the last reset carry a possible side
    /// effect? Gates the wake-up of `Waiting` jobs.
    possible_side_effect: bool,
    /// Tags signalled stopped since the previous round, with the blocked
    /// flag to restore after the sweep.
    stopped_tags: Vec<(Arc<Tag>, bool)>,
    /// Round counter.
    round: u64,
}

impl Scheduler {
    /// Create a scheduler with the default configuration.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(clock, SchedulerConfig::default())
    }

    /// Create a scheduler with a custom configuration.
    pub fn with_config(
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            config,
            clock,
            jobs: VecDeque::new(),
            current: None,
            possible_side_effect: false,
            stopped_tags: Vec::new(),
            round: 0,
        }
    }

    /// Current time on the scheduler clock, microseconds.
    #[inline]
    pub fn now(&self) -> Utime {
        self.clock.now()
    }

    /// Current round number, increasing by one per round.
    #[inline]
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Number of jobs currently scheduled.
    #[inline]
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Is `job` the one currently holding the execution token?
    #[inline]
    pub fn is_current(
        &self,
        job: &Arc<Job>,
    ) -> bool {
        self.current
            .as_ref()
            .is_some_and(|cur| Arc::ptr_eq(cur, job))
    }

    /// Schedule a job for its first slice during the next round.
    pub fn add_job(
        &mut self,
        job: Arc<Job>,
    ) -> Result<(), SchedulerError> {
        if job.state() != JobState::ToStart
            || self.jobs.iter().any(|j| Arc::ptr_eq(j, &job))
        {
            return Err(SchedulerError::AlreadyStarted(job.name().to_owned()));
        }
        debug!("job '{}' scheduled", job.name());
        self.jobs.push_back(job);
        Ok(())
    }

    /// Queue a tag for the stop sweep at the end of the current `work`
    /// call; records the blocked flag to restore afterwards.
    pub fn signal_stop(
        &mut self,
        tag: Arc<Tag>,
    ) {
        let restore = tag.blocked();
        self.stopped_tags.push((tag, restore));
    }

    /// Run one round and return the microseconds until the next useful
    /// call (0 = more work is pending, call again immediately).
    pub fn work(&mut self) -> Utime {
        let mut deadline = self.execute_round(false);
        if !self.stopped_tags.is_empty() {
            deadline = self.check_for_stopped_tags(deadline);
        }
        if deadline == IMMEDIATE {
            0
        } else {
            (deadline - self.clock.now()).max(0)
        }
    }

    /// Kill a job without giving it a further slice of its own code: its
    /// body unwinds with a terminated condition and the job is reclaimed
    /// before this returns.
    ///
    /// Rejected on the currently executing job: a job must request its
    /// own termination and yield instead.
    pub fn kill_job(
        &mut self,
        job: &Arc<Job>,
    ) -> Result<(), SchedulerError> {
        if self.is_current(job) {
            return Err(SchedulerError::KillCurrent(job.name().to_owned()));
        }
        self.kill_now(job);
        Ok(())
    }

    /// Kill every scheduled job except `keep`; with `None`, kill them all.
    pub fn kill_all_except(
        &mut self,
        keep: Option<&Arc<Job>>,
    ) {
        let doomed: Vec<Arc<Job>> = self
            .jobs
            .iter()
            .filter(|j| keep.is_none_or(|k| !Arc::ptr_eq(k, j)))
            .cloned()
            .collect();
        debug!("killing {} job(s)", doomed.len());
        for job in doomed {
            self.kill_now(&job);
        }
    }

    /// One scheduling round. With `blocked_only`, the round's only effect
    /// is to wake blocked jobs so they can react to a stop.
    ///
    /// Returns the absolute deadline of the next useful round, or
    /// `IMMEDIATE`.
    fn execute_round(
        &mut self,
        blocked_only: bool,
    ) -> Utime {
        self.round += 1;
        let now = self.clock.now();
        let mut deadline = now + self.config.idle_ceiling;
        let mut started = false;

        // Waiting jobs resume if a side effect was possible last round;
        // the flag then restarts its accumulation for the next round. A
        // blocked-only sweep leaves the flag alone: it must still gate
        // the waiters of the next normal round.
        let resume_waiters = if blocked_only {
            false
        } else {
            mem::replace(&mut self.possible_side_effect, false)
        };

        // Snapshot the pending set: jobs scheduled during this round wait
        // for the next one, so self-rescheduling cannot loop a round.
        let pending = mem::take(&mut self.jobs);
        trace!(
            round = self.round,
            jobs = pending.len(),
            blocked_only,
            "scheduling round"
        );

        for job in pending {
            match job.state() {
                JobState::Zombie => self.reclaim(&job),
                JobState::ToStart => {
                    if blocked_only {
                        self.jobs.push_back(job);
                        continue;
                    }
                    // The starting switch doubles as the job's guaranteed
                    // first slice; it is gated normally from next round.
                    self.resume(&job, &mut deadline);
                    started = true;
                }
                state => {
                    let frozen = job.frozen();
                    if frozen {
                        job.notice_frozen(now);
                    } else {
                        job.notice_not_frozen(now);
                    }

                    let blocked = job.blocked();
                    if blocked_only && !blocked {
                        self.jobs.push_back(job);
                        continue;
                    }

                    // A blocked job is resumed no matter its state so the
                    // stop request is observed; a frozen one stays put.
                    let should_resume = blocked
                        || (!frozen
                            && match state {
                                JobState::Running => true,
                                JobState::Sleeping => {
                                    if now >= job.deadline() {
                                        true
                                    } else {
                                        deadline = deadline.min(job.deadline());
                                        false
                                    }
                                }
                                JobState::Waiting => {
                                    resume_waiters || self.possible_side_effect
                                }
                                JobState::Joining => false,
                                JobState::ToStart | JobState::Zombie => false,
                            });

                    if should_resume {
                        self.resume(&job, &mut deadline);
                    } else {
                        self.jobs.push_back(job);
                    }
                }
            }
        }

        if started || self.possible_side_effect {
            deadline = IMMEDIATE;
        }
        deadline
    }

    /// Give one slice to `job` and requeue or reclaim it afterwards,
    /// folding its post-slice state into the round deadline.
    fn resume(
        &mut self,
        job: &Arc<Job>,
        deadline: &mut Utime,
    ) {
        if !job.context_started() {
            if let Err(e) = job.start_context(&self.config) {
                debug!("job '{}' failed to start: {}", job.name(), e);
                job.cancel_unstarted();
                self.reclaim(job);
                return;
            }
        } else if job.stack_remaining() < self.config.stack_threshold {
            job.async_throw(crate::sched::errors::JobError::StackExhausted);
        }

        let effect_free_before = job.side_effect_free();
        self.current = Some(job.clone());
        let alive = job.switch_to();
        self.current = None;

        if !(effect_free_before && job.side_effect_free()) {
            self.possible_side_effect = true;
        }

        if !alive || job.terminated() {
            self.reclaim(job);
            return;
        }

        match job.state() {
            JobState::Running => *deadline = IMMEDIATE,
            JobState::Sleeping => {
                if *deadline != IMMEDIATE {
                    *deadline = (*deadline).min(job.deadline());
                }
            }
            _ => {}
        }
        self.jobs.push_back(job.clone());
    }

    /// Stop sweep: force the blocked flag of every signalled tag, give
    /// the affected jobs one blocked-only round to unwind, then restore
    /// the recorded flags. Stop latency is thus at most one extra round.
    fn check_for_stopped_tags(
        &mut self,
        old_deadline: Utime,
    ) -> Utime {
        let tags = mem::take(&mut self.stopped_tags);
        debug!("stop sweep over {} tag(s)", tags.len());
        for (tag, _) in &tags {
            tag.force_blocked(true);
        }
        let sweep_deadline = self.execute_round(true);
        for (tag, restore) in tags {
            tag.force_blocked(restore);
        }
        if old_deadline == IMMEDIATE || sweep_deadline == IMMEDIATE {
            IMMEDIATE
        } else {
            old_deadline.min(sweep_deadline)
        }
    }

    /// Kill path shared by `kill_job` and `kill_all_except`.
    fn kill_now(
        &mut self,
        job: &Arc<Job>,
    ) {
        if job.terminated() {
            return;
        }
        if !job.context_started() {
            // Never ran: no context to unwind.
            job.cancel_unstarted();
        } else {
            job.mark_killed();
            // One switch so the body unwinds in its own context.
            self.current = Some(job.clone());
            let _ = job.switch_to();
            self.current = None;
        }
        self.jobs.retain(|j| !Arc::ptr_eq(j, job));
        self.reclaim(job);
    }

    /// Detach a zombie from everything and reap its context. The memory
    /// itself goes away with the last outside reference.
    fn reclaim(
        &mut self,
        job: &Arc<Job>,
    ) {
        job.unlink_all();
        job.join_context();
        debug!("job '{}' reclaimed", job.name());
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("round", &self.round)
            .field("jobs", &self.jobs.len())
            .field("possible_side_effect", &self.possible_side_effect)
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Unwind and reap every remaining context; leaking a parked
        // context thread would block process shutdown diagnostics.
        self.kill_all_except(None);
    }
}
