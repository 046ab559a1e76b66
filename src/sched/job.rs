//! Jobs: cooperatively scheduled units of execution
//!
//! A job is one thread of control of the scripting language: an execution
//! context plus scheduling state, a deadline, a tag stack, structured
//! links to peer jobs and a slot for an injected exception. The lifetime
//! of a job is:
//!
//! - `Job::new()` — creation, state `ToStart`;
//! - `Job::start()` — hand it to the scheduler, which spawns its context
//!   and gives it a first slice during the next round;
//! - the body runs, suspending itself only through [`JobContext`] yield
//!   operations, until it returns or unwinds on a delivered condition;
//! - state `Zombie` — the scheduler unlinks and reaps the context; the
//!   memory goes away with the last `Arc` reference.
//!
//! Job state is mutated only by the scheduler or by the job itself while
//! it holds the execution token, so the atomics below never race; they
//! exist because the context is an OS thread.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, error, warn};

use crate::sched::coroutine::{CoroPort, Coroutine};
use crate::sched::errors::{JobError, SchedulerError};
use crate::sched::scheduler::SchedulerConfig;
use crate::sched::tag::{Priority, Tag, PRIORITY_DEFAULT};
use crate::util::clock::Utime;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(0);

/// Sentinel for `frozen_since`.
const NOT_FROZEN: Utime = -1;

/// Job scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Context created, entry point not yet invoked.
    ToStart,
    /// Wants a slice every round.
    Running,
    /// Wants a slice once its deadline has passed.
    Sleeping,
    /// Wants a slice only after another job may have produced an
    /// externally observable change.
    Waiting,
    /// Resumed only when the joined job terminates.
    Joining,
    /// Terminated; eligible for reclamation.
    Zombie,
}

impl JobState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => JobState::ToStart,
            1 => JobState::Running,
            2 => JobState::Sleeping,
            3 => JobState::Waiting,
            4 => JobState::Joining,
            _ => JobState::Zombie,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            JobState::ToStart => 0,
            JobState::Running => 1,
            JobState::Sleeping => 2,
            JobState::Waiting => 3,
            JobState::Joining => 4,
            JobState::Zombie => 5,
        }
    }
}

type BodyFn = Box<dyn FnOnce(&JobContext<'_>) -> Result<(), JobError> + Send>;

/// A cooperatively scheduled unit of execution.
pub struct Job {
    id: JobId,
    name: String,
    state: AtomicU8,
    /// Wake-up time, meaningful while `Sleeping`.
    deadline: AtomicI64,
    /// When the job's tag stack first became frozen, -1 if not frozen.
    /// 0 is a valid timestamp: clocks start there.
    frozen_since: AtomicI64,
    /// Cumulative time spent frozen, exposed to the language layer so it
    /// can report per-job logical time.
    time_shift: AtomicI64,
    side_effect_free: AtomicBool,
    non_interruptible: AtomicBool,
    /// Set by the kill path; once set, every yield delivers `Terminated`.
    killed: AtomicBool,
    pending: Mutex<Option<JobError>>,
    tags: Mutex<SmallVec<[Arc<Tag>; 4]>>,
    /// Structured peers; exceptions of a failing job propagate here.
    links: Mutex<Vec<Arc<Job>>>,
    /// Jobs in `Joining` state to wake when this one terminates.
    wake_on_exit: Mutex<Vec<Weak<Job>>>,
    /// Outcome of the body, recorded at termination.
    result: Mutex<Option<Result<(), JobError>>>,
    body: Mutex<Option<BodyFn>>,
    coro: OnceCell<Coroutine>,
}

impl Job {
    /// Create a job in state `ToStart`.
    ///
    /// The body runs on the job's own context once the scheduler starts
    /// it. It suspends only through the [`JobContext`] it receives, and
    /// its `Err` outcome, if not a plain cancellation, is propagated to
    /// linked jobs.
    pub fn new<F>(
        name: impl Into<String>,
        body: F,
    ) -> Arc<Self>
    where
        F: FnOnce(&JobContext<'_>) -> Result<(), JobError> + Send + 'static,
    {
        Arc::new(Self {
            id: JobId(NEXT_JOB_ID.fetch_add(1, Ordering::SeqCst)),
            name: name.into(),
            state: AtomicU8::new(JobState::ToStart.as_u8()),
            deadline: AtomicI64::new(0),
            frozen_since: AtomicI64::new(NOT_FROZEN),
            time_shift: AtomicI64::new(0),
            side_effect_free: AtomicBool::new(false),
            non_interruptible: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            pending: Mutex::new(None),
            tags: Mutex::new(SmallVec::new()),
            links: Mutex::new(Vec::new()),
            wake_on_exit: Mutex::new(Vec::new()),
            result: Mutex::new(None),
            body: Mutex::new(Some(Box::new(body))),
            coro: OnceCell::new(),
        })
    }

    /// Job identifier.
    #[inline]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Job name, for diagnostics.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current scheduling state.
    #[inline]
    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_state(
        &self,
        state: JobState,
    ) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Has this job terminated?
    #[inline]
    pub fn terminated(&self) -> bool {
        self.state() == JobState::Zombie
    }

    /// Wake-up deadline; meaningful only while `Sleeping`.
    #[inline]
    pub fn deadline(&self) -> Utime {
        self.deadline.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_deadline(
        &self,
        deadline: Utime,
    ) {
        self.deadline.store(deadline, Ordering::SeqCst);
    }

    /// Cumulative time this job has spent frozen, in microseconds.
    #[inline]
    pub fn time_shift(&self) -> Utime {
        self.time_shift.load(Ordering::SeqCst)
    }

    /// May the job's current slice influence other parts of the system?
    /// Defaults to false; condition pollers set it around pure checks so
    /// the scheduler can leave other waiting jobs asleep.
    #[inline]
    pub fn side_effect_free(&self) -> bool {
        self.side_effect_free.load(Ordering::SeqCst)
    }

    /// Set the side-effect-free mark for the job's next slices.
    #[inline]
    pub fn set_side_effect_free(
        &self,
        free: bool,
    ) {
        self.side_effect_free.store(free, Ordering::SeqCst);
    }

    /// Is the job inside a non-interruptible section?
    #[inline]
    pub fn non_interruptible(&self) -> bool {
        self.non_interruptible.load(Ordering::SeqCst)
    }

    /// Enter or leave a non-interruptible section: yields become no-ops
    /// and suspension attempts are scheduling errors.
    #[inline]
    pub fn set_non_interruptible(
        &self,
        ni: bool,
    ) {
        self.non_interruptible.store(ni, Ordering::SeqCst);
    }

    /// True iff any tag on the stack is blocked. A blocked job is resumed
    /// every round so the stop request is never missed.
    pub fn blocked(&self) -> bool {
        self.tags.lock().iter().any(|t| t.blocked())
    }

    /// True iff any tag on the stack is frozen.
    pub fn frozen(&self) -> bool {
        self.tags.lock().iter().any(|t| t.frozen())
    }

    /// Maximum priority over the tag stack. Informational: the scheduler
    /// serves rounds in FIFO order.
    pub fn priority(&self) -> Priority {
        self.tags
            .lock()
            .iter()
            .map(|t| t.priority())
            .max()
            .unwrap_or(PRIORITY_DEFAULT)
    }

    /// Push a tag when entering a scoped control construct.
    pub fn push_tag(
        &self,
        tag: Arc<Tag>,
    ) {
        self.tags.lock().push(tag);
    }

    /// Pop the most recently pushed tag when leaving the construct.
    pub fn pop_tag(&self) -> Option<Arc<Tag>> {
        self.tags.lock().pop()
    }

    /// Does the job currently hold this tag?
    pub fn has_tag(
        &self,
        tag: &Arc<Tag>,
    ) -> bool {
        self.tags.lock().iter().any(|t| Arc::ptr_eq(t, tag))
    }

    /// Establish a bidirectional link with another job.
    ///
    /// When either job terminates with a real failure, the other receives
    /// a [`JobError::LinkedFailure`] on its next slice. Linking a job to
    /// itself or twice to the same peer is a no-op.
    pub fn link(
        self: &Arc<Self>,
        other: &Arc<Job>,
    ) {
        if Arc::ptr_eq(self, other) {
            return;
        }
        let mut mine = self.links.lock();
        if mine.iter().any(|j| Arc::ptr_eq(j, other)) {
            return;
        }
        mine.push(other.clone());
        drop(mine);
        other.links.lock().push(self.clone());
    }

    /// Destroy a bidirectional link if it exists.
    pub fn unlink(
        self: &Arc<Self>,
        other: &Arc<Job>,
    ) {
        self.links.lock().retain(|j| !Arc::ptr_eq(j, other));
        other.links.lock().retain(|j| !Arc::ptr_eq(j, self));
    }

    /// Raise `err` inside this job the next time it is resumed.
    ///
    /// The target wakes up even if it was sleeping or waiting. At most one
    /// exception is outstanding: `Terminated` always replaces whatever is
    /// pending, any other newcomer is dropped with a warning so it is
    /// never lost silently.
    pub fn async_throw(
        &self,
        err: JobError,
    ) {
        // A job which has received an exception is no longer side effect
        // free or non-interruptible.
        self.side_effect_free.store(false, Ordering::SeqCst);
        self.non_interruptible.store(false, Ordering::SeqCst);

        let mut pending = self.pending.lock();
        match &*pending {
            Some(JobError::Terminated) => {
                // Nothing outranks termination.
            }
            Some(old) if err != JobError::Terminated => {
                warn!(
                    "job '{}': dropping injected exception `{}`, `{}` is already pending",
                    self.name, err, old
                );
            }
            _ => *pending = Some(err),
        }
        drop(pending);

        match self.state() {
            JobState::ToStart | JobState::Zombie => {}
            _ => self.set_state(JobState::Running),
        }
    }

    /// Final outcome of the body, once the job is a zombie.
    pub fn result(&self) -> Option<Result<(), JobError>> {
        self.result.lock().clone()
    }

    /// Hand the job to a scheduler; it receives its first slice during the
    /// next round.
    pub fn start(
        self: &Arc<Self>,
        scheduler: &mut crate::sched::Scheduler,
    ) -> Result<(), SchedulerError> {
        scheduler.add_job(self.clone())
    }

    // -- scheduler-side plumbing -------------------------------------

    /// Record the instant the tag stack was first observed frozen.
    pub(crate) fn notice_frozen(
        &self,
        now: Utime,
    ) {
        if self.frozen_since.load(Ordering::SeqCst) == NOT_FROZEN {
            self.frozen_since.store(now, Ordering::SeqCst);
        }
    }

    /// The tag stack is no longer frozen: shift a sleeper's deadline by
    /// the frozen duration so that time spent frozen does not count
    /// against the sleep.
    pub(crate) fn notice_not_frozen(
        &self,
        now: Utime,
    ) {
        let since = self.frozen_since.swap(NOT_FROZEN, Ordering::SeqCst);
        if since != NOT_FROZEN {
            let spent = now - since;
            self.time_shift.fetch_add(spent, Ordering::SeqCst);
            if self.state() == JobState::Sleeping {
                self.deadline.fetch_add(spent, Ordering::SeqCst);
            }
        }
    }

    /// Spawn the execution context, parked until the first switch.
    pub(crate) fn start_context(
        self: &Arc<Self>,
        config: &SchedulerConfig,
    ) -> Result<(), SchedulerError> {
        let body = self
            .body
            .lock()
            .take()
            .ok_or_else(|| SchedulerError::AlreadyStarted(self.name.clone()))?;
        let me = self.clone();
        let coro = Coroutine::spawn(&self.name, config.stack_size, move |port| {
            run_entry(me, body, port);
        })
        .map_err(|source| SchedulerError::SpawnFailed {
            name: self.name.clone(),
            source,
        })?;
        // start_context is only reached once thanks to the body take.
        let _ = self.coro.set(coro);
        Ok(())
    }

    #[inline]
    pub(crate) fn context_started(&self) -> bool {
        self.coro.get().is_some()
    }

    /// Hand the execution token to the job until it yields back. False
    /// means the context is gone and the job must be reclaimed.
    pub(crate) fn switch_to(&self) -> bool {
        match self.coro.get() {
            Some(coro) => coro.switch_to(),
            None => false,
        }
    }

    /// Remaining-stack estimate recorded at the job's last yield.
    pub(crate) fn stack_remaining(&self) -> usize {
        self.coro
            .get()
            .map_or(usize::MAX, |coro| coro.stack_remaining())
    }

    /// Mark the job as killed; every subsequent delivery is `Terminated`.
    pub(crate) fn mark_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.async_throw(JobError::Terminated);
    }

    /// Terminate a job whose context was never started.
    pub(crate) fn cancel_unstarted(&self) {
        *self.result.lock() = Some(Err(JobError::Terminated));
        self.set_state(JobState::Zombie);
    }

    /// Reap the finished context.
    pub(crate) fn join_context(&self) {
        if let Some(coro) = self.coro.get() {
            coro.join();
        }
    }

    /// Drop every link with peers; called at reclamation so a dead job
    /// never lingers in anyone's link set.
    pub(crate) fn unlink_all(self: &Arc<Self>) {
        let peers: Vec<Arc<Job>> = self.links.lock().drain(..).collect();
        for peer in peers {
            peer.links.lock().retain(|j| !Arc::ptr_eq(j, self));
        }
    }

    /// Deliver whatever the job must observe before running its own code:
    /// kill, then the pending exception, then a blocked tag stack.
    /// The pending slot is cleared exactly once, here.
    pub(crate) fn take_delivery(&self) -> Result<(), JobError> {
        if self.killed.load(Ordering::SeqCst) {
            self.pending.lock().take();
            return Err(JobError::Terminated);
        }
        if let Some(err) = self.pending.lock().take() {
            return Err(err);
        }
        if self.blocked() {
            return Err(JobError::Interrupted);
        }
        Ok(())
    }

    fn remove_waiter(
        &self,
        job: &Arc<Job>,
    ) {
        self.wake_on_exit
            .lock()
            .retain(|w| w.upgrade().is_none_or(|w| !Arc::ptr_eq(&w, job)));
    }

    /// Termination bookkeeping, run on the job's own context.
    fn finish(
        self: &Arc<Self>,
        result: Result<(), JobError>,
    ) {
        // Wake joining jobs.
        for waiter in self.wake_on_exit.lock().drain(..) {
            if let Some(waiter) = waiter.upgrade() {
                if !waiter.terminated() {
                    waiter.set_state(JobState::Running);
                }
            }
        }

        match &result {
            Ok(()) => debug!("job '{}' finished", self.name),
            Err(e) if e.is_cancellation() => {
                debug!("job '{}' unwound: {}", self.name, e);
            }
            Err(e) => {
                error!("job '{}' failed: {}", self.name, e);
                // Report upward through structured links.
                let peers: Vec<Arc<Job>> = self.links.lock().clone();
                for peer in peers {
                    if !peer.terminated() {
                        peer.async_throw(JobError::LinkedFailure(Box::new(e.clone())));
                    }
                }
            }
        }

        *self.result.lock() = Some(result);
        self.set_state(JobState::Zombie);
    }
}

impl std::fmt::Debug for Job {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("deadline", &self.deadline())
            .finish()
    }
}

impl std::fmt::Display for Job {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Job({})", self.name)
    }
}

/// Entry point of a job's context: run the body, then terminate.
fn run_entry(
    job: Arc<Job>,
    body: BodyFn,
    port: &CoroPort,
) {
    job.set_state(JobState::Running);
    debug!("job '{}' started", job.name());

    let ctx = JobContext { job: job.clone(), port };

    // Deliver anything injected between creation and the first slice.
    let result = match job.take_delivery() {
        Err(e) => Err(e),
        Ok(()) => {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(&ctx))) {
                Ok(res) => res,
                Err(_) => {
                    error!("job '{}' panicked", job.name());
                    Err(JobError::Custom("job body panicked".into()))
                }
            }
        }
    };

    job.finish(result);
    // The context's final token handoff happens in the coroutine wrapper.
}

/// The in-job face of the scheduler: the only way a job may suspend.
///
/// Handed to the job body; every yield operation returns `Err` when the
/// resumption delivers a condition (stop, injected exception, exhausted
/// stack), which the body propagates with `?` so the unwinding happens in
/// the job's own context.
pub struct JobContext<'a> {
    job: Arc<Job>,
    port: &'a CoroPort,
}

impl JobContext<'_> {
    /// The job this context belongs to.
    #[inline]
    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    /// Give other jobs a chance to run; resumed next round.
    ///
    /// Inside a non-interruptible section this is a no-op, unless the job
    /// is frozen, in which case it must yield to be actually paused.
    pub fn yield_now(&self) -> Result<(), JobError> {
        if self.job.non_interruptible() && !self.job.frozen() {
            return Ok(());
        }
        self.job.set_state(JobState::Running);
        self.suspend()
    }

    /// Suspend until `deadline` (microseconds, scheduler clock) has
    /// passed. Time spent frozen extends the deadline by the same amount.
    pub fn sleep_until(
        &self,
        deadline: Utime,
    ) -> Result<(), JobError> {
        if self.job.non_interruptible() {
            return Err(JobError::Scheduling(
                "attempt to sleep in non-interruptible section".into(),
            ));
        }
        self.job.set_deadline(deadline);
        self.job.set_state(JobState::Sleeping);
        self.suspend()
    }

    /// Suspend until some other job may have produced an externally
    /// observable change. Condition pollers use this instead of busy
    /// yielding; the wake-up may lag the change by one round.
    pub fn wait_for_external_change(&self) -> Result<(), JobError> {
        if self.job.non_interruptible() && !self.job.frozen() {
            return Err(JobError::Scheduling(
                "attempt to wait for a condition in non-interruptible section".into(),
            ));
        }
        self.job.set_state(JobState::Waiting);
        self.suspend()
    }

    /// Suspend until `other` terminates. Immediate if it already has.
    pub fn join(
        &self,
        other: &Arc<Job>,
    ) -> Result<(), JobError> {
        if Arc::ptr_eq(other, &self.job) || other.terminated() {
            return Ok(());
        }
        if self.job.non_interruptible() {
            return Err(JobError::Scheduling(
                "attempt to join another job in non-interruptible section".into(),
            ));
        }
        other
            .wake_on_exit
            .lock()
            .push(Arc::downgrade(&self.job));
        self.job.set_state(JobState::Joining);
        match self.suspend() {
            Ok(()) => Ok(()),
            Err(e) => {
                // Awoken by a condition instead of the other job's
                // termination: dequeue ourselves before unwinding.
                other.remove_waiter(&self.job);
                Err(e)
            }
        }
    }

    /// Hand the token back and, on resumption, deliver pending conditions.
    fn suspend(&self) -> Result<(), JobError> {
        if !self.port.switch_back() {
            // The scheduler is gone; unwind as if terminated.
            return Err(JobError::Terminated);
        }
        self.job.take_delivery()
    }
}
