// Arena-based storage for the dependency graph
//
// This module provides two separate arenas:
// - Dep arena: dependency sets with recursion-level marker bits, plus the
//   process-wide target map (target -> key -> dep)
// - Effect arena: tracked computations (callback, scheduler, dep list,
//   lifecycle flags, debug hooks)
//
// The arenas use global static storage with RwLock for thread-safe access.
// DepId and EffectId are lightweight newtypes that index into the slabs.
// The per-thread execution state (active-effect stack, tracking flags,
// nesting depth and marker bit) lives in effect_arena.

// effect_arena depends on DepId, so dep_arena comes first
pub mod dep_arena;
pub mod effect_arena;

// Crate-facing surface (Key/TargetId/EffectId and MAX_MARKER_BITS are
// re-exported at the crate root)
pub use dep_arena::{Key, TargetId};
pub use effect_arena::{EffectId, MAX_MARKER_BITS};

pub(crate) use dep_arena::{
    DepId, create_dep, dep_arena_remove, get_or_create_dep, release_target, with_target_deps,
};

pub(crate) use effect_arena::{
    ComputedKind, DebugHookFn, EffectData, EffectFn, SchedulerFn, active_effect,
    cleanup_effect_deps, effect_arena_insert, effect_arena_remove, effect_stack_contains,
    effect_track_depth, pop_active_effect, push_active_effect, set_effect_track_depth,
    set_should_track, set_track_op_bit, should_track, track_flag_stack_pop,
    track_flag_stack_push, track_op_bit,
};
