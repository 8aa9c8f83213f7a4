#![deny(missing_docs)]

//! Fine-grained reactive update core
//!
//! This crate is the engine under a reactive object system: a dependency
//! graph linking observable property slots to effects, a deterministic
//! two-phase job scheduler, and memoized derived values. The proxy layer
//! that intercepts property access, the renderer, and the error-reporting
//! plumbing are external collaborators; they drive this core through
//! [`track`], [`trigger`], the queue operations and the error handler hook.
//!
//! # Quick Start
//!
//! ```ignore
//! use finegrain::{
//!     Effect, Key, TargetId, TargetKind, TrackOp, TriggerOp,
//!     flush_microtasks, track, trigger,
//! };
//!
//! // The proxy layer assigns each observable object a TargetId and calls
//! // track on reads / trigger on writes. Values stay in the host's hands.
//! let profile = TargetId::fresh();
//!
//! let effect = Effect::new(move || {
//!     track(profile, TrackOp::Get, Key::prop("name"));
//!     // ... read the name and render it ...
//! });
//!
//! // A write re-runs the effect (or its scheduler) immediately
//! trigger(profile, TargetKind::Plain, TriggerOp::Set, Some(Key::prop("name")), None);
//!
//! // Scheduler-driven work batches into one drain per microtask checkpoint
//! flush_microtasks();
//! ```
//!
//! # Core pieces
//!
//! - [`Effect`] - a tracked computation. Reads made during its run
//!   subscribe it to the slots it touched; any write to those slots re-runs
//!   it, directly or through its scheduler.
//! - [`track`] / [`trigger`] - the entry points the proxy layer calls on
//!   every read and write, including the sequence (`length`, indices) and
//!   keyed-collection (iteration sentinel) dispatch rules.
//! - [`Job`] / [`queue_job`] / [`queue_post_flush_cb`] / [`next_tick`] - the
//!   two-phase scheduler: id-ordered queue jobs with pre jobs first on
//!   ties, post callbacks after the queue drains, one drain per microtask,
//!   runaway recursion cut off at [`RECURSION_LIMIT`].
//! - [`computed`] - eager-notify memoized derived value.
//! - [`deferred_computed`] - derived value that defers downstream
//!   notification to a microtask and suppresses it when the value is
//!   unchanged.
//! - [`flush_microtasks`] - the host's yield point; deferred work (drains,
//!   deferred-computed notifications, [`next_tick`] callbacks) runs here.
//!
//! # Tracking control
//!
//! ```ignore
//! pause_tracking();            // lifecycle code must not accrue deps
//! run_lifecycle_hooks();
//! reset_tracking();
//!
//! let snapshot = untracked(|| read_everything());  // scoped variant
//! ```
//!
//! # Threading
//!
//! The dependency graph lives in process-wide arenas, but execution is
//! single-threaded and cooperative: each thread has its own active-effect
//! stack, scheduler queues and microtask queue. One thread's drain never
//! observes another thread's flush state.

pub(crate) mod arena;
mod computed;
mod deferred;
mod effect;
mod hash;
mod microtask;
mod scheduler;
mod tracking;

// Identity and key types
pub use arena::{EffectId, Key, TargetId};

// Effect lifecycle and tracking control
pub use effect::{
    Effect, EffectOptions, clear_scope_registrar, enable_tracking, pause_tracking,
    reset_tracking, set_scope_registrar, untracked,
};

// Constants callers may rely on
pub use arena::MAX_MARKER_BITS;
pub use scheduler::RECURSION_LIMIT;

// Track / trigger entry points for the proxy layer
pub use tracking::{
    DebugEvent, DebugOp, TargetKind, TrackOp, TriggerOp, release_target, track, trigger,
};

// Scheduler surface
pub use scheduler::{
    ErrorHandler, Job, JobOptions, clear_error_handler, flush_post_flush_cbs,
    flush_pre_flush_cbs, invalidate_job, next_tick, queue_job, queue_post_flush_cb,
    queue_post_flush_cbs, set_error_handler,
};

// Microtask substrate (the host's yield point)
pub use microtask::{flush_microtasks, has_pending_microtasks};

// Derived values
pub use computed::{Computed, computed};
pub use deferred::{DeferredComputed, deferred_computed};
