//! Error taxonomy of the scheduler kernel
//!
//! Two families: conditions delivered *inside* a job's own execution
//! context (`JobError`), which the language layer can catch like any other
//! runtime condition, and host-facing programming errors (`SchedulerError`),
//! which are never recoverable at script level.

use thiserror::Error;

/// A condition delivered inside a job's execution context.
///
/// Yield operations ([`JobContext`](crate::sched::JobContext) methods)
/// return `Err` with one of these when the job is resumed with something to
/// deliver: a stop request on one of its tags, an injected exception, an
/// exhausted stack. Job bodies propagate them with `?` or catch them the
/// way the scripting language catches conditions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// A tag on the job's stack requested a stop; the job must unwind.
    #[error("job interrupted by a stopped tag")]
    Interrupted,

    /// The job was killed; unwinding is mandatory and re-delivered on
    /// every subsequent yield.
    #[error("job terminated")]
    Terminated,

    /// The job's remaining stack dropped below the safety threshold.
    #[error("stack space exhausted")]
    StackExhausted,

    /// Misuse of a yield operation, e.g. sleeping inside a
    /// non-interruptible section.
    #[error("scheduling error: {0}")]
    Scheduling(String),

    /// A structurally linked job terminated with the given error.
    #[error("linked job failed: {0}")]
    LinkedFailure(Box<JobError>),

    /// An error injected by the language layer through `async_throw`.
    #[error("{0}")]
    Custom(String),
}

impl JobError {
    /// True for the errors that mean "this job was asked to go away", as
    /// opposed to a failure worth propagating to linked jobs.
    #[inline]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, JobError::Interrupted | JobError::Terminated)
    }
}

/// Host-facing programming errors on the scheduler API.
///
/// These are invariant violations by the embedding code, not script-level
/// conditions; they are reported but never injected into a job.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `kill_job` was invoked on the job currently holding the execution
    /// token. A job must request its own termination and yield instead.
    #[error("cannot kill the currently executing job '{0}'")]
    KillCurrent(String),

    /// The job was already handed to a scheduler.
    #[error("job '{0}' has already been started")]
    AlreadyStarted(String),

    /// The underlying execution context could not be created.
    #[error("failed to spawn execution context for job '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
