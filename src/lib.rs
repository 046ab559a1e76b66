//! Rove runtime kernel
//!
//! The scheduling core of the Rove robot-scripting language: scripts are
//! compiled into many lightweight concurrent jobs, and this crate runs
//! them cooperatively on a single thread of control with tag-based
//! group stop, freeze and priority semantics.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rove_sched::{Job, MonotonicClock, Scheduler};
//!
//! let mut sched = Scheduler::new(Arc::new(MonotonicClock::new()));
//! let job = Job::new("hello", |ctx| {
//!     ctx.yield_now()?;
//!     Ok(())
//! });
//! job.start(&mut sched).unwrap();
//! while sched.job_count() > 0 {
//!     sched.work();
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod sched;
pub mod util;

// Re-exports
pub use sched::{
    HookHandle, Job, JobContext, JobError, JobId, JobState, Priority, Scheduler, SchedulerConfig,
    SchedulerError, Tag, PRIORITY_DEFAULT,
};
pub use util::clock::{Clock, ManualClock, MonotonicClock, Utime};

/// Kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
