//! Manually switched execution contexts
//!
//! Each job owns one context: an OS thread that only ever runs while it
//! holds the activity token. The token is handed over through a pair of
//! rendezvous channels (capacity 0), so exactly one side of a `Coroutine`
//! executes at any instant and every switch is a synchronous handoff, the
//! same contract a raw stack-switching coroutine library provides.
//!
//! The scheduler end lives in [`Coroutine`]; the job end is the
//! [`CoroPort`] passed to the entry closure. Neither end is exposed outside
//! the crate: jobs suspend only through the documented yield operations.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

/// Scheduler-side handle on a job's execution context.
pub(crate) struct Coroutine {
    /// Hands the activity token to the context.
    resume_tx: Sender<()>,
    /// Receives the token back when the context suspends or finishes.
    yield_rx: Receiver<()>,
    /// Underlying thread, reaped on zombie reclamation.
    handle: Mutex<Option<JoinHandle<()>>>,
    /// Remaining-stack estimate recorded by the context at its last yield.
    stack_low: Arc<AtomicUsize>,
}

/// Job-side end of the token handoff, owned by the context's entry closure.
pub(crate) struct CoroPort {
    resume_rx: Receiver<()>,
    yield_tx: Sender<()>,
    stack_low: Arc<AtomicUsize>,
    /// Address of a local captured at thread entry; stack growth is
    /// measured as the distance from it.
    stack_base: Cell<usize>,
    stack_size: usize,
}

impl Coroutine {
    /// Spawn a context parked on its resume channel.
    ///
    /// `entry` does not run until the first [`switch_to`](Self::switch_to);
    /// once it returns, the context hands the token back a final time and
    /// the thread exits.
    pub(crate) fn spawn<F>(
        name: &str,
        stack_size: usize,
        entry: F,
    ) -> io::Result<Self>
    where
        F: FnOnce(&CoroPort) + Send + 'static,
    {
        let (resume_tx, resume_rx) = bounded(0);
        let (yield_tx, yield_rx) = bounded(0);
        let stack_low = Arc::new(AtomicUsize::new(usize::MAX));

        let port_low = stack_low.clone();
        let handle = thread::Builder::new()
            .name(format!("job-{}", name))
            .stack_size(stack_size)
            .spawn(move || {
                let base = 0u8;
                let port = CoroPort {
                    resume_rx,
                    yield_tx,
                    stack_low: port_low,
                    stack_base: Cell::new(&base as *const u8 as usize),
                    stack_size,
                };
                // Park until the scheduler performs the starting switch.
                if port.resume_rx.recv().is_err() {
                    return;
                }
                entry(&port);
                // Final handoff: the switch that resumed the last slice is
                // still waiting for the token.
                let _ = port.yield_tx.send(());
            })?;

        Ok(Self {
            resume_tx,
            yield_rx,
            handle: Mutex::new(Some(handle)),
            stack_low,
        })
    }

    /// Hand the token to the context and block until it comes back.
    ///
    /// Returns false if the context is gone (its thread exited or
    /// panicked), in which case the caller must treat the job as dead.
    pub(crate) fn switch_to(&self) -> bool {
        self.resume_tx.send(()).is_ok() && self.yield_rx.recv().is_ok()
    }

    /// Remaining-stack estimate recorded at the context's last yield.
    ///
    /// `usize::MAX` until the context has yielded once.
    #[inline]
    pub(crate) fn stack_remaining(&self) -> usize {
        self.stack_low.load(Ordering::SeqCst)
    }

    /// Reap the finished context. Must only be called once the job is a
    /// zombie: joining a live context would deadlock.
    pub(crate) fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let name = handle.thread().name().unwrap_or("job").to_owned();
            if handle.join().is_err() {
                error!("context '{}' exited by panic", name);
            } else {
                debug!("context '{}' reaped", name);
            }
        }
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("stack_remaining", &self.stack_remaining())
            .finish()
    }
}

impl CoroPort {
    /// Hand the token back to the scheduler and block until resumed.
    ///
    /// Returns false if the scheduler end is gone; the job must then
    /// unwind as if terminated.
    pub(crate) fn switch_back(&self) -> bool {
        self.record_stack_watermark();
        self.yield_tx.send(()).is_ok() && self.resume_rx.recv().is_ok()
    }

    /// Record how much stack the context has left, measured from the
    /// entry-time base address. Approximate: it only needs to catch
    /// runaway recursion before the thread overflows.
    fn record_stack_watermark(&self) {
        let probe = 0u8;
        let here = &probe as *const u8 as usize;
        let used = self.stack_base.get().abs_diff(here);
        let remaining = self.stack_size.saturating_sub(used);
        self.stack_low.store(remaining, Ordering::SeqCst);
    }
}
