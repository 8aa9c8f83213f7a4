// Effect arena - storage for tracked computations
//
// EffectData holds everything an effect owns: its callback, an optional
// scheduler, its dep list, lifecycle flags, an optional computed-value
// back-reference and the debug hooks. The arena uses global static storage
// with RwLock for thread-safe access; EffectId is a lightweight newtype
// indexing into the slab.
//
// The per-thread execution state also lives here:
// - an explicit active-effect stack (top = the effect currently running,
//   entries below = its ancestors)
// - the should-track flag and its save stack
// - the effect nesting depth and the matching marker bit (bit == 1 << depth)
// Execution is single-threaded and cooperative per thread; the arena locks
// only make cross-thread graphs sound, they are not a concurrency model.

use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::cell::{Cell, RefCell};

use super::DepId;
use crate::tracking::DebugEvent;

/// Nesting depths beyond this fall back to full dep-list cleanup instead of
/// the marker-bit sweep (the markers are single 32-bit words).
pub const MAX_MARKER_BITS: u32 = 30;

/// Global effect arena - stores every effect in the process
static EFFECT_ARENA: RwLock<Slab<EffectData>> = RwLock::new(Slab::new());

thread_local! {
    // Explicit stack of running effects. Pushed on run entry, popped on
    // exit; the top is the effect reads are attributed to.
    static ACTIVE_EFFECTS: RefCell<Vec<EffectId>> = const { RefCell::new(Vec::new()) };

    // Whether reads are currently recorded. Saved/restored by the
    // pause/enable/reset tracking operations and by effect runs.
    static SHOULD_TRACK: Cell<bool> = const { Cell::new(true) };
    static TRACK_FLAG_STACK: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };

    // Effect nesting depth and the marker bit for the current depth.
    static EFFECT_TRACK_DEPTH: Cell<u32> = const { Cell::new(0) };
    static TRACK_OP_BIT: Cell<u32> = const { Cell::new(1) };
}

/// Marks an effect as the backing computation of a derived value.
///
/// Trigger dispatch fires computed-backed effects before plain ones, and
/// deferred computeds chain change notifications through their downstream
/// deferred subscribers.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum ComputedKind {
    /// Eager-notify derived value.
    Eager,
    /// Microtask-deferred, equality-suppressed derived value.
    Deferred,
}

/// The effect callback type.
pub(crate) type EffectFn = Box<dyn FnMut() + Send>;

/// The scheduler callback type. The flag is true only when an upstream
/// deferred computed is chaining a notification synchronously; ordinary
/// trigger dispatch passes false.
pub(crate) type SchedulerFn = Box<dyn FnMut(bool) + Send>;

/// Debug hook type for track/trigger observation.
pub(crate) type DebugHookFn = Box<dyn FnMut(&DebugEvent) + Send>;

/// Unique identifier for an effect in the arena.
///
/// This is a zero-cost wrapper around a slab index. When the owning handle
/// is dropped the slot is freed, making the id stale; stale accesses
/// degrade to no-ops.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct EffectId(u32);

impl EffectId {
    /// Create a new EffectId from a raw index
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    /// Convert to usize for slab indexing
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the effect with a closure (read-only)
    ///
    /// Returns None if the effect has been removed (stale access).
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&EffectData) -> R,
    {
        let arena = EFFECT_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Whether the effect is still live (not stopped, not removed)
    pub(crate) fn is_active(self) -> bool {
        self.with(|e| e.active.load(std::sync::atomic::Ordering::Acquire))
            .unwrap_or(false)
    }

    pub(crate) fn set_active(self, active: bool) {
        self.with(|e| e.active.store(active, std::sync::atomic::Ordering::Release));
    }

    pub(crate) fn defer_stop_requested(self) -> bool {
        self.with(|e| e.defer_stop.load(std::sync::atomic::Ordering::Acquire))
            .unwrap_or(false)
    }

    pub(crate) fn set_defer_stop(self) {
        self.with(|e| e.defer_stop.store(true, std::sync::atomic::Ordering::Release));
    }

    pub(crate) fn allow_recurse(self) -> bool {
        self.with(|e| e.allow_recurse).unwrap_or(false)
    }

    pub(crate) fn computed_kind(self) -> Option<ComputedKind> {
        self.with(|e| e.computed).flatten()
    }

    pub(crate) fn has_scheduler(self) -> bool {
        self.with(|e| e.scheduler.lock().is_some()).unwrap_or(false)
    }

    /// Install the scheduler after construction.
    ///
    /// Deferred computeds need this: their scheduler closure captures the
    /// effect's own id, which only exists once the arena slot is allocated.
    pub(crate) fn install_scheduler(self, scheduler: SchedulerFn) {
        self.with(|e| *e.scheduler.lock() = Some(scheduler));
    }

    /// Run the effect callback, if present.
    ///
    /// The callback is taken out of its slot for the duration of the call so
    /// the arena lock is not held while user code runs (the callback may
    /// create effects, which needs the write lock). A drop guard restores it
    /// even if the callback panics.
    pub(crate) fn run_callback(self) {
        let taken = self.with(|e| e.callback.lock().take()).flatten();
        if let Some(cb) = taken {
            let mut guard = SlotGuard {
                id: self,
                select: |e| &e.callback,
                value: Some(cb),
            };
            if let Some(cb) = guard.value.as_mut() {
                cb();
            }
        }
    }

    /// Run the scheduler callback, if present, with the chain flag.
    ///
    /// Same take/restore discipline as `run_callback`.
    pub(crate) fn run_scheduler(self, chained: bool) {
        let taken = self.with(|e| e.scheduler.lock().take()).flatten();
        if let Some(sched) = taken {
            let mut guard = SlotGuard {
                id: self,
                select: |e| &e.scheduler,
                value: Some(sched),
            };
            if let Some(sched) = guard.value.as_mut() {
                sched(chained);
            }
        }
    }

    /// Record a dep this effect subscribed to
    pub(crate) fn push_dep(self, dep: DepId) {
        self.with(|e| e.deps.lock().push(dep));
    }

    /// Copy the current dep list
    pub(crate) fn deps_snapshot(self) -> Vec<DepId> {
        self.with(|e| e.deps.lock().clone()).unwrap_or_default()
    }

    /// Take the dep list out, leaving it empty.
    ///
    /// The re-tracking sweep and stop both operate on the taken list so no
    /// arena lock is held while deps are updated.
    pub(crate) fn take_deps(self) -> Vec<DepId> {
        self.with(|e| std::mem::take(&mut *e.deps.lock()))
            .unwrap_or_default()
    }

    /// Store a (compacted) dep list back
    pub(crate) fn set_deps(self, deps: Vec<DepId>) {
        self.with(|e| *e.deps.lock() = deps);
    }

    pub(crate) fn fire_on_stop(self) {
        let taken = self.with(|e| e.on_stop.lock().take()).flatten();
        if let Some(cb) = taken {
            let mut guard = SlotGuard {
                id: self,
                select: |e| &e.on_stop,
                value: Some(cb),
            };
            if let Some(cb) = guard.value.as_mut() {
                cb();
            }
        }
    }

    pub(crate) fn fire_on_track(self, event: &DebugEvent) {
        fire_debug_hook(self, |e| &e.on_track, event);
    }

    pub(crate) fn fire_on_trigger(self, event: &DebugEvent) {
        fire_debug_hook(self, |e| &e.on_trigger, event);
    }
}

fn fire_debug_hook(
    id: EffectId,
    select: fn(&EffectData) -> &Mutex<Option<DebugHookFn>>,
    event: &DebugEvent,
) {
    let taken = id.with(|e| select(e).lock().take()).flatten();
    if let Some(hook) = taken {
        let mut guard = SlotGuard {
            id,
            select,
            value: Some(hook),
        };
        if let Some(hook) = guard.value.as_mut() {
            hook(event);
        }
    }
}

/// Restores a taken callback slot on drop, even when the callback panics.
struct SlotGuard<T> {
    id: EffectId,
    select: fn(&EffectData) -> &Mutex<Option<T>>,
    value: Option<T>,
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let arena = EFFECT_ARENA.read();
            if let Some(data) = arena.get(self.id.index()) {
                *(self.select)(data).lock() = Some(value);
            }
        }
    }
}

/// Everything an effect owns, stored in the arena.
pub(crate) struct EffectData {
    /// The tracked computation.
    pub(crate) callback: Mutex<Option<EffectFn>>,

    /// Replaces direct re-run on trigger when present.
    pub(crate) scheduler: Mutex<Option<SchedulerFn>>,

    /// Deps this effect currently subscribes to. Mirrors dep membership:
    /// the effect is in every dep listed here and vice versa.
    pub(crate) deps: Mutex<Vec<DepId>>,

    /// Cleared by stop; a stopped effect never re-runs through triggers.
    pub(crate) active: std::sync::atomic::AtomicBool,

    /// Set when stop is requested while the effect itself is running; the
    /// stop is replayed when the run exits.
    pub(crate) defer_stop: std::sync::atomic::AtomicBool,

    /// Permit the effect to re-trigger itself from its own run.
    pub(crate) allow_recurse: bool,

    /// Back-reference marking this as the backing effect of a derived value.
    pub(crate) computed: Option<ComputedKind>,

    /// Invoked once when the effect is stopped.
    pub(crate) on_stop: Mutex<Option<EffectFn>>,

    /// Debug hook observing new subscriptions.
    pub(crate) on_track: Mutex<Option<DebugHookFn>>,

    /// Debug hook observing incoming triggers.
    pub(crate) on_trigger: Mutex<Option<DebugHookFn>>,
}

impl EffectData {
    pub(crate) fn new(callback: EffectFn) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
            scheduler: Mutex::new(None),
            deps: Mutex::new(Vec::new()),
            active: std::sync::atomic::AtomicBool::new(true),
            defer_stop: std::sync::atomic::AtomicBool::new(false),
            allow_recurse: false,
            computed: None,
            on_stop: Mutex::new(None),
            on_track: Mutex::new(None),
            on_trigger: Mutex::new(None),
        }
    }
}

/// Drop every subscription of an effect, on both sides of the relation.
///
/// The fallback path for runs nested past the marker-bit ceiling, and the
/// teardown path for stop.
pub(crate) fn cleanup_effect_deps(id: EffectId) {
    for dep in id.take_deps() {
        dep.remove_effect(id);
    }
}

// Arena manipulation functions

/// Insert effect data into the arena and return its id
pub(crate) fn effect_arena_insert(data: EffectData) -> EffectId {
    let mut arena = EFFECT_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(data);
    EffectId::new(key as u32)
}

/// Remove an effect from the arena
pub(crate) fn effect_arena_remove(id: EffectId) {
    let mut arena = EFFECT_ARENA.write();
    if arena.contains(id.index()) {
        arena.remove(id.index());
    }
}

// Per-thread execution state

/// The effect currently being run on this thread, if any
pub(crate) fn active_effect() -> Option<EffectId> {
    ACTIVE_EFFECTS.with(|s| s.borrow().last().copied())
}

/// Whether the effect is anywhere on this thread's run stack.
///
/// Used to suppress re-entrant activation: triggering an effect that is
/// already running (directly or as an ancestor) is a no-op.
pub(crate) fn effect_stack_contains(id: EffectId) -> bool {
    ACTIVE_EFFECTS.with(|s| s.borrow().contains(&id))
}

pub(crate) fn push_active_effect(id: EffectId) {
    ACTIVE_EFFECTS.with(|s| s.borrow_mut().push(id));
}

pub(crate) fn pop_active_effect() {
    ACTIVE_EFFECTS.with(|s| {
        s.borrow_mut().pop();
    });
}

/// Whether reads are currently recorded on this thread
pub(crate) fn should_track() -> bool {
    SHOULD_TRACK.with(Cell::get)
}

/// Set the tracking flag, returning the previous value
pub(crate) fn set_should_track(value: bool) -> bool {
    SHOULD_TRACK.with(|c| c.replace(value))
}

pub(crate) fn track_flag_stack_push(value: bool) {
    TRACK_FLAG_STACK.with(|s| s.borrow_mut().push(value));
}

pub(crate) fn track_flag_stack_pop() -> Option<bool> {
    TRACK_FLAG_STACK.with(|s| s.borrow_mut().pop())
}

/// Current effect nesting depth on this thread
pub(crate) fn effect_track_depth() -> u32 {
    EFFECT_TRACK_DEPTH.with(Cell::get)
}

pub(crate) fn set_effect_track_depth(depth: u32) {
    EFFECT_TRACK_DEPTH.with(|c| c.set(depth));
}

/// The marker bit for the current nesting depth (1 << depth)
pub(crate) fn track_op_bit() -> u32 {
    TRACK_OP_BIT.with(Cell::get)
}

pub(crate) fn set_track_op_bit(bit: u32) {
    TRACK_OP_BIT.with(|c| c.set(bit));
}
