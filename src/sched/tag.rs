//! Tags: shareable stop/freeze/priority handles
//!
//! A tag is pushed onto a job's tag stack when the script enters a scoped
//! control construct and popped when it leaves. Stopping a tag forces
//! every job holding it to unwind; freezing pauses them without
//! termination. Tags are reference counted and may outlive the construct
//! that created them, in which case they simply stop affecting jobs once
//! popped from every stack.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

/// Tag priority, exposed to jobs as the maximum over their tag stack.
pub type Priority = i32;

/// Priority of a job with an empty tag stack.
pub const PRIORITY_DEFAULT: Priority = 0;

/// Which hook list a registration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookKind {
    Stop,
    Freeze,
    Unfreeze,
}

type HookFn = Arc<dyn Fn() + Send + Sync>;

/// Registered observer callbacks, keyed for explicit unregistration.
#[derive(Default)]
struct HookSet {
    next_id: u64,
    stop: Vec<(u64, HookFn)>,
    freeze: Vec<(u64, HookFn)>,
    unfreeze: Vec<(u64, HookFn)>,
}

impl HookSet {
    fn list_mut(
        &mut self,
        kind: HookKind,
    ) -> &mut Vec<(u64, HookFn)> {
        match kind {
            HookKind::Stop => &mut self.stop,
            HookKind::Freeze => &mut self.freeze,
            HookKind::Unfreeze => &mut self.unfreeze,
        }
    }
}

/// A shareable interruption/priority handle.
///
/// `blocked` and `frozen` are orthogonal: a job is blocked if *any* tag on
/// its stack is blocked, frozen if any is frozen.
pub struct Tag {
    name: String,
    blocked: AtomicBool,
    frozen: AtomicBool,
    priority: AtomicI32,
    hooks: Mutex<HookSet>,
}

impl Tag {
    /// Create a new tag.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            blocked: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            priority: AtomicI32::new(PRIORITY_DEFAULT),
            hooks: Mutex::new(HookSet::default()),
        })
    }

    /// Tag name, for diagnostics.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Is a stop currently requested on this tag?
    #[inline]
    pub fn blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Is a freeze currently requested on this tag?
    #[inline]
    pub fn frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Current priority.
    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority.load(Ordering::SeqCst)
    }

    /// Set the priority. Informational: round order stays FIFO.
    #[inline]
    pub fn set_priority(
        &self,
        priority: Priority,
    ) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    /// Transient stop: fire the on-stop hooks.
    ///
    /// The host pairs this with
    /// [`Scheduler::signal_stop`](crate::sched::Scheduler::signal_stop) so
    /// that every job holding the tag unwinds during the next blocked-only
    /// sweep; the tag's own `blocked` flag is untouched.
    pub fn stop(&self) {
        debug!("tag '{}' stopped", self.name);
        self.fire(HookKind::Stop);
    }

    /// Persistent stop: the tag stays blocked until [`unblock`](Self::unblock).
    ///
    /// Jobs holding a blocked tag are resumed every round so the stop is
    /// never missed, and each resumption delivers an interruption.
    pub fn block(&self) {
        debug!("tag '{}' blocked", self.name);
        self.blocked.store(true, Ordering::SeqCst);
        self.fire(HookKind::Stop);
    }

    /// Clear a persistent stop.
    pub fn unblock(&self) {
        self.blocked.store(false, Ordering::SeqCst);
    }

    /// Pause every job holding this tag, without terminating them.
    pub fn freeze(&self) {
        if !self.frozen.swap(true, Ordering::SeqCst) {
            debug!("tag '{}' frozen", self.name);
            self.fire(HookKind::Freeze);
        }
    }

    /// Resume jobs paused by [`freeze`](Self::freeze). Time spent frozen
    /// does not count against a sleeping job's deadline.
    pub fn unfreeze(&self) {
        if self.frozen.swap(false, Ordering::SeqCst) {
            debug!("tag '{}' unfrozen", self.name);
            self.fire(HookKind::Unfreeze);
        }
    }

    /// Register an on-stop observer.
    pub fn on_stop(
        self: &Arc<Self>,
        f: impl Fn() + Send + Sync + 'static,
    ) -> HookHandle {
        self.register(HookKind::Stop, Arc::new(f))
    }

    /// Register an on-freeze observer.
    pub fn on_freeze(
        self: &Arc<Self>,
        f: impl Fn() + Send + Sync + 'static,
    ) -> HookHandle {
        self.register(HookKind::Freeze, Arc::new(f))
    }

    /// Register an on-unfreeze observer.
    pub fn on_unfreeze(
        self: &Arc<Self>,
        f: impl Fn() + Send + Sync + 'static,
    ) -> HookHandle {
        self.register(HookKind::Unfreeze, Arc::new(f))
    }

    /// Forced blocked-flag override used by the stop sweep; bypasses hooks.
    #[inline]
    pub(crate) fn force_blocked(
        &self,
        blocked: bool,
    ) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    fn register(
        self: &Arc<Self>,
        kind: HookKind,
        f: HookFn,
    ) -> HookHandle {
        let mut hooks = self.hooks.lock();
        let id = hooks.next_id;
        hooks.next_id += 1;
        hooks.list_mut(kind).push((id, f));
        HookHandle {
            tag: Arc::downgrade(self),
            kind,
            id,
        }
    }

    fn fire(
        &self,
        kind: HookKind,
    ) {
        // Callbacks run outside the lock: a hook may register or cancel
        // hooks on the same tag while it runs.
        let snapshot: Vec<HookFn> = self
            .hooks
            .lock()
            .list_mut(kind)
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for f in snapshot {
            f();
        }
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Tag")
            .field("name", &self.name)
            .field("blocked", &self.blocked())
            .field("frozen", &self.frozen())
            .field("priority", &self.priority())
            .finish()
    }
}

impl std::fmt::Display for Tag {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Tag({})", self.name)
    }
}

/// Cancellation handle for a registered tag hook.
///
/// Cancel explicitly when the registering job terminates early, so the
/// callback does not outlive its owner. Dropping the handle without
/// cancelling leaves the hook registered for the tag's lifetime.
#[derive(Debug)]
pub struct HookHandle {
    tag: Weak<Tag>,
    kind: HookKind,
    id: u64,
}

impl HookHandle {
    /// Unregister the callback. Idempotent; a dead tag is a no-op.
    pub fn cancel(self) {
        if let Some(tag) = self.tag.upgrade() {
            tag.hooks
                .lock()
                .list_mut(self.kind)
                .retain(|(id, _)| *id != self.id);
        }
    }
}
