//! Monotonic time source for the scheduler.
//!
//! All scheduler timestamps are microseconds on a monotonic axis supplied
//! by the host. Production hosts use [`MonotonicClock`]; tests drive a
//! [`ManualClock`] so rounds run against simulated time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Microsecond timestamp on the host's monotonic axis.
pub type Utime = i64;

/// A source of monotonic microsecond timestamps.
pub trait Clock: Send + Sync {
    /// Current time in microseconds.
    fn now(&self) -> Utime;
}

/// Wall-clock backed monotonic clock, anchored at construction time.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock whose origin is "now".
    #[inline]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Utime {
        self.origin.elapsed().as_micros() as Utime
    }
}

/// Hand-driven clock for tests and replay.
///
/// Time only moves when `advance` or `set` is called.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock starting at `origin` microseconds.
    #[inline]
    pub fn new(origin: Utime) -> Self {
        Self {
            now: AtomicI64::new(origin),
        }
    }

    /// Move the clock forward by `delta` microseconds.
    #[inline]
    pub fn advance(&self, delta: Utime) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute timestamp.
    #[inline]
    pub fn set(&self, now: Utime) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> Utime {
        self.now.load(Ordering::SeqCst)
    }
}
