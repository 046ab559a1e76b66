//! Cooperative job scheduling kernel
//!
//! This module is the heart of the runtime: many lightweight concurrent
//! jobs multiplexed cooperatively onto one thread of control. Exactly one
//! execution context is live at any instant; every switch is an explicit
//! synchronous handoff, so jobs share mutable state (tag flags, pending
//! exceptions, links) without locks beyond what the thread-backed
//! contexts themselves require.
//!
//! - [`Scheduler`] owns the job set and runs one round per [`Scheduler::work`]
//!   call, returning the next useful wake-up time to the host loop.
//! - [`Job`] is one cooperative task: context, state machine, tag stack,
//!   structured links, injected-exception slot.
//! - [`Tag`] is the shareable stop/freeze/priority handle consumed by the
//!   scheduler's blocked/frozen gating and stop sweep.

pub mod coroutine;
pub mod errors;
pub mod job;
pub mod scheduler;
pub mod tag;

#[cfg(test)]
mod tests;

pub use errors::{JobError, SchedulerError};
pub use job::{Job, JobContext, JobId, JobState};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use tag::{HookHandle, Priority, Tag, PRIORITY_DEFAULT};
