//! Tracked computations and their lifecycle.
//!
//! An effect wraps a user function whose reads of observable slots are
//! recorded while it runs. When any recorded slot is written, the effect
//! re-runs, either directly or through its scheduler.
//!
//! # Incremental re-tracking
//!
//! Re-running an effect must drop subscriptions it no longer needs without
//! tearing down and rebuilding the whole dep list each time. Before the
//! callback runs, every dep already in the list is stamped with a
//! was-tracked bit for the current nesting depth; reads during the run stamp
//! the newly-tracked bit. A single sweep afterwards removes exactly the deps
//! that carry the old stamp but not the new one, in O(old + new).
//!
//! The stamps are single 32-bit words, so nesting deeper than
//! [`MAX_MARKER_BITS`] falls back to clearing the dep list up front and
//! re-subscribing from scratch.

use crate::arena::{
    ComputedKind, EffectData, EffectId, MAX_MARKER_BITS, active_effect, cleanup_effect_deps,
    effect_arena_insert, effect_arena_remove, effect_stack_contains, effect_track_depth,
    pop_active_effect, push_active_effect, set_effect_track_depth, set_should_track,
    set_track_op_bit, should_track, track_flag_stack_pop, track_flag_stack_push, track_op_bit,
};
use crate::arena::{DebugHookFn, EffectFn, SchedulerFn};
use crate::tracking::DebugEvent;
use parking_lot::RwLock;

/// Hook invoked for every effect created while installed.
///
/// An external effect-scope facility uses this to claim ownership of new
/// effects; the core itself never reads it back.
static SCOPE_REGISTRAR: RwLock<Option<Box<dyn Fn(EffectId) + Send + Sync>>> = RwLock::new(None);

/// Install the effect-scope registrar. Passing a new hook replaces the
/// previous one.
pub fn set_scope_registrar<F>(hook: F)
where
    F: Fn(EffectId) + Send + Sync + 'static,
{
    *SCOPE_REGISTRAR.write() = Some(Box::new(hook));
}

/// Remove the effect-scope registrar.
pub fn clear_scope_registrar() {
    *SCOPE_REGISTRAR.write() = None;
}

fn register_with_scope(id: EffectId) {
    if let Some(hook) = SCOPE_REGISTRAR.read().as_ref() {
        hook(id);
    }
}

/// A tracked computation.
///
/// Created with [`Effect::new`] (runs immediately) or through
/// [`EffectOptions`]. Calling [`run`](Effect::run) re-executes the
/// computation under tracking; [`stop`](Effect::stop) unsubscribes it for
/// good. Dropping the handle stops the effect.
///
/// # Example
/// ```ignore
/// let target = TargetId::fresh();
/// let effect = Effect::new(move || {
///     track(target, TrackOp::Get, Key::prop("voltage"));
///     // ... read the value and react to it ...
/// });
///
/// trigger(target, TargetKind::Plain, TriggerOp::Set, Some(Key::prop("voltage")), None);
/// // the effect has re-run
/// ```
pub struct Effect {
    id: EffectId,
}

impl Effect {
    /// Create an effect and run it immediately to establish subscriptions.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        EffectOptions::new().build(f)
    }

    /// Re-run the computation under tracking.
    pub fn run(&self) {
        run_effect(self.id);
    }

    /// Stop the effect: unsubscribe from every dep and refuse future runs
    /// through triggers. Stopping twice is a no-op. A stop issued from
    /// inside the effect's own run is deferred until the run exits.
    pub fn stop(&self) {
        stop_effect(self.id);
    }

    /// The arena id backing this handle.
    pub fn id(&self) -> EffectId {
        self.id
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        stop_effect(self.id);
        effect_arena_remove(self.id);
    }
}

/// Configuration for [`Effect`] construction.
///
/// # Example
/// ```ignore
/// let effect = EffectOptions::new()
///     .lazy()
///     .allow_recurse()
///     .on_stop(|| println!("stopped"))
///     .build(move || { /* ... */ });
/// effect.run(); // first run was skipped by lazy()
/// ```
#[derive(Default)]
pub struct EffectOptions {
    lazy: bool,
    allow_recurse: bool,
    scheduler: Option<SchedulerFn>,
    computed: Option<ComputedKind>,
    on_stop: Option<EffectFn>,
    on_track: Option<DebugHookFn>,
    on_trigger: Option<DebugHookFn>,
}

impl EffectOptions {
    /// Start from the defaults: eager first run, no scheduler, no hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip the construction-time run. The effect subscribes to nothing
    /// until [`Effect::run`] is called.
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Permit the effect to re-trigger itself from its own run (normally a
    /// write to a slot the running effect reads is suppressed to avoid
    /// self-feedback).
    pub fn allow_recurse(mut self) -> Self {
        self.allow_recurse = true;
        self
    }

    /// Replace direct re-run on trigger: when a tracked slot is written the
    /// scheduler is invoked instead of the computation. Typical schedulers
    /// enqueue a [`Job`](crate::Job) and return.
    pub fn scheduler<F>(mut self, mut f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.scheduler = Some(Box::new(move |_chained| f()));
        self
    }

    /// Internal: install a scheduler that receives the deferred-computed
    /// chain flag.
    pub(crate) fn scheduler_raw(mut self, f: SchedulerFn) -> Self {
        self.scheduler = Some(f);
        self
    }

    /// Internal: mark the effect as the backing computation of a derived
    /// value.
    pub(crate) fn computed_kind(mut self, kind: ComputedKind) -> Self {
        self.computed = Some(kind);
        self
    }

    /// Invoke the hook once when the effect is stopped.
    pub fn on_stop<F>(mut self, f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.on_stop = Some(Box::new(f));
        self
    }

    /// Debug hook observing every new subscription this effect makes.
    pub fn on_track<F>(mut self, f: F) -> Self
    where
        F: FnMut(&DebugEvent) + Send + 'static,
    {
        self.on_track = Some(Box::new(f));
        self
    }

    /// Debug hook observing every trigger delivered to this effect.
    pub fn on_trigger<F>(mut self, f: F) -> Self
    where
        F: FnMut(&DebugEvent) + Send + 'static,
    {
        self.on_trigger = Some(Box::new(f));
        self
    }

    /// Create the effect. Unless [`lazy`](EffectOptions::lazy) was set, it
    /// runs once before returning.
    pub fn build<F>(self, f: F) -> Effect
    where
        F: FnMut() + Send + 'static,
    {
        let mut data = EffectData::new(Box::new(f));
        data.allow_recurse = self.allow_recurse;
        data.computed = self.computed;
        *data.scheduler.get_mut() = self.scheduler;
        *data.on_stop.get_mut() = self.on_stop;
        *data.on_track.get_mut() = self.on_track;
        *data.on_trigger.get_mut() = self.on_trigger;

        let id = effect_arena_insert(data);
        register_with_scope(id);

        let effect = Effect { id };
        if !self.lazy {
            run_effect(id);
        }
        effect
    }
}

/// Restores the run-scoped state on exit, normal or panicking: sweeps the
/// dep markers, unwinds depth and marker bit, pops the active-effect stack,
/// restores the tracking flag and replays a deferred stop.
struct RunGuard {
    id: EffectId,
    prev_should_track: bool,
}

impl RunGuard {
    fn enter(id: EffectId) -> Self {
        let prev_should_track = set_should_track(true);
        push_active_effect(id);
        let depth = effect_track_depth() + 1;
        set_effect_track_depth(depth);
        set_track_op_bit(1u32.wrapping_shl(depth));
        Self {
            id,
            prev_should_track,
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let depth = effect_track_depth();
        if depth <= MAX_MARKER_BITS {
            finalize_dep_markers(self.id);
        }
        let depth = depth - 1;
        set_effect_track_depth(depth);
        set_track_op_bit(1u32.wrapping_shl(depth));
        pop_active_effect();
        set_should_track(self.prev_should_track);
        if self.id.defer_stop_requested() {
            stop_effect(self.id);
        }
    }
}

/// Execute an effect's computation under tracking.
pub(crate) fn run_effect(id: EffectId) {
    if !id.is_active() {
        // Stopped effects still execute on explicit request, just without
        // any tracking.
        id.run_callback();
        return;
    }
    if effect_stack_contains(id) {
        // Re-entrant activation of an effect already on the run stack is
        // suppressed.
        return;
    }

    let _guard = RunGuard::enter(id);
    if effect_track_depth() <= MAX_MARKER_BITS {
        init_dep_markers(id);
    } else {
        cov_mark::hit!(marker_depth_overflow);
        cleanup_effect_deps(id);
    }
    id.run_callback();
}

/// Stamp the was-tracked bit on every dep already subscribed.
fn init_dep_markers(id: EffectId) {
    let bit = track_op_bit();
    for dep in id.deps_snapshot() {
        dep.set_w(bit);
    }
}

/// One pass over the dep list after the run: deps that were tracked before
/// but not during this run are dropped on both sides; every visited dep has
/// this depth's markers cleared.
fn finalize_dep_markers(id: EffectId) {
    let bit = track_op_bit();
    let deps = id.take_deps();
    let mut kept = Vec::with_capacity(deps.len());
    for dep in deps {
        if dep.was_tracked(bit) && !dep.new_tracked(bit) {
            dep.remove_effect(id);
        } else {
            kept.push(dep);
        }
        dep.clear_markers(bit);
    }
    id.set_deps(kept);
}

/// Terminate an effect, unless it is the one currently running (then the
/// stop replays when its run exits).
pub(crate) fn stop_effect(id: EffectId) {
    if active_effect() == Some(id) {
        id.set_defer_stop();
        return;
    }
    if id.is_active() {
        cleanup_effect_deps(id);
        id.fire_on_stop();
        id.set_active(false);
    }
}

/// Suspend dependency recording, saving the current flag.
///
/// Used by callers that must not accrue spurious dependencies while running
/// lifecycle code inside an effect. Balanced by [`reset_tracking`].
pub fn pause_tracking() {
    track_flag_stack_push(should_track());
    set_should_track(false);
}

/// Force dependency recording on, saving the current flag. Balanced by
/// [`reset_tracking`].
pub fn enable_tracking() {
    track_flag_stack_push(should_track());
    set_should_track(true);
}

/// Restore the tracking flag saved by the matching [`pause_tracking`] or
/// [`enable_tracking`]. With nothing saved, tracking turns back on.
pub fn reset_tracking() {
    set_should_track(track_flag_stack_pop().unwrap_or(true));
}

/// Run a closure with dependency recording suspended.
///
/// ```ignore
/// let effect = Effect::new(move || {
///     track(a, TrackOp::Get, Key::prop("x"));          // subscribes
///     untracked(|| track(b, TrackOp::Get, Key::prop("y"))); // does not
/// });
/// ```
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    struct ResetGuard;
    impl Drop for ResetGuard {
        fn drop(&mut self) {
            reset_tracking();
        }
    }

    pause_tracking();
    let _guard = ResetGuard;
    f()
}
