//! Track and trigger: the entry points the proxy layer drives.
//!
//! A read of an observable slot calls [`track`], which resolves the slot's
//! dep and subscribes the running effect to it. A write calls [`trigger`],
//! which collects every dep the write invalidates and fires the subscribed
//! effects: computed-backed effects first (so derived values invalidate
//! before anything reads them), then the rest.
//!
//! Sequence and keyed-collection writes invalidate more than the written
//! slot: adding an element changes iteration and length, shrinking `length`
//! kills the tail, clearing kills everything. Those rules live in
//! [`trigger`].

use crate::arena::{
    DepId, EffectId, Key, MAX_MARKER_BITS, TargetId, active_effect, effect_track_depth,
    get_or_create_dep, release_target as arena_release_target, should_track, track_op_bit,
    with_target_deps,
};
use crate::effect::run_effect;
use crate::hash::FastHashBuilder;
use indexmap::IndexSet;
use smallvec::SmallVec;

/// The kind of read being recorded.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TrackOp {
    /// Plain property/element read.
    Get,
    /// Existence check.
    Has,
    /// Enumeration of the target.
    Iterate,
}

/// The kind of write being dispatched.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TriggerOp {
    /// An existing slot changed value.
    Set,
    /// A new slot appeared.
    Add,
    /// A slot disappeared.
    Delete,
    /// The whole collection was emptied.
    Clear,
}

/// The shape of the written target, as known to the proxy layer.
///
/// The core never sees the target itself, so the caller states whether
/// sequence rules (`length`, integer indices) or keyed-collection rules
/// (keys-only iteration) apply.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TargetKind {
    /// An ordinary object with named properties.
    Plain,
    /// An array-like target with integer indices and a length.
    Sequence,
    /// A map/set-like target with keyed iteration.
    Keyed,
}

/// What a debug hook is being shown.
#[derive(Clone, Debug)]
pub enum DebugOp {
    /// A subscription was recorded.
    Track(TrackOp),
    /// A trigger was delivered.
    Trigger(TriggerOp),
}

/// Payload passed to `on_track` / `on_trigger` debug hooks.
///
/// Ref-style owners (computeds) have no target or key; their events carry
/// `None` for both.
#[derive(Clone, Debug)]
pub struct DebugEvent {
    /// The written/read target, when the slot belongs to one.
    pub target: Option<TargetId>,
    /// The slot key, when the operation names one.
    pub key: Option<Key>,
    /// What happened.
    pub op: DebugOp,
}

/// Record that the running effect observed `(target, key)`.
///
/// No-op when tracking is paused or no effect is running. Creates the
/// target's table and the slot's dep on first use.
pub fn track(target: TargetId, op: TrackOp, key: Key) {
    if !should_track() || active_effect().is_none() {
        return;
    }
    let dep = get_or_create_dep(target, &key);
    let event = DebugEvent {
        target: Some(target),
        key: Some(key),
        op: DebugOp::Track(op),
    };
    track_effects(dep, &event);
}

/// Subscribe the running effect to a dep the read resolved to.
///
/// At nesting depths within the marker range, the newly-tracked bit
/// deduplicates repeat reads of the same dep within one run, and the
/// was-tracked bit suppresses re-subscription of deps that are already in
/// the effect's list. Past the marker range the dep's membership set is
/// consulted directly.
pub(crate) fn track_effects(dep: DepId, event: &DebugEvent) {
    let Some(effect) = active_effect() else {
        return;
    };

    let should_sub = if effect_track_depth() <= MAX_MARKER_BITS {
        let bit = track_op_bit();
        if !dep.new_tracked(bit) {
            dep.set_n(bit);
            !dep.was_tracked(bit)
        } else {
            false
        }
    } else {
        cov_mark::hit!(track_past_marker_depth);
        !dep.has_effect(effect)
    };

    if should_sub {
        dep.add_effect(effect);
        effect.push_dep(dep);
        effect.fire_on_track(event);
    }
}

/// Record a read of a ref-style owner (a computed's own dep).
pub(crate) fn track_ref(dep: DepId) {
    if !should_track() || active_effect().is_none() {
        return;
    }
    let event = DebugEvent {
        target: None,
        key: None,
        op: DebugOp::Track(TrackOp::Get),
    };
    track_effects(dep, &event);
}

/// Dispatch a write of `(target, key)` to every affected effect.
///
/// `new_len` carries the new length for `Set` on [`Key::Length`] of a
/// sequence target; it is ignored otherwise.
///
/// Collection rules on top of the written slot's own dep:
/// - `Clear` invalidates every dep of the target.
/// - `Set` of `Length` on a sequence invalidates `Length` and every index
///   at or past the new length (truncation kills the tail).
/// - `Add` on a non-sequence invalidates value iteration, and keys-only
///   iteration for keyed collections; on a sequence with an integer key it
///   invalidates `Length` (appending extends the sequence).
/// - `Delete` on a non-sequence invalidates the same iteration deps.
/// - `Set` on a keyed collection invalidates value iteration (the
///   iteration stream's values changed identity).
pub fn trigger(
    target: TargetId,
    kind: TargetKind,
    op: TriggerOp,
    key: Option<Key>,
    new_len: Option<u64>,
) {
    let mut deps: SmallVec<[DepId; 4]> = SmallVec::new();

    let known = with_target_deps(target, |table| {
        match op {
            TriggerOp::Clear => {
                // Every tracked slot of the target is affected
                deps.extend(table.values().copied());
            }
            TriggerOp::Set if kind == TargetKind::Sequence && key == Some(Key::Length) => {
                let new_len = new_len.unwrap_or(0);
                for (k, &dep) in table {
                    match *k {
                        Key::Length => deps.push(dep),
                        Key::Index(i) if i >= new_len => deps.push(dep),
                        _ => {}
                    }
                }
            }
            _ => {
                if let Some(key) = &key {
                    if let Some(&dep) = table.get(key) {
                        deps.push(dep);
                    }
                }
                match op {
                    TriggerOp::Add => {
                        if kind != TargetKind::Sequence {
                            if let Some(&dep) = table.get(&Key::Iterate) {
                                deps.push(dep);
                            }
                            if kind == TargetKind::Keyed {
                                if let Some(&dep) = table.get(&Key::MapKeyIterate) {
                                    deps.push(dep);
                                }
                            }
                        } else if matches!(key, Some(Key::Index(_))) {
                            // A new index extends the sequence
                            if let Some(&dep) = table.get(&Key::Length) {
                                deps.push(dep);
                            }
                        }
                    }
                    TriggerOp::Delete => {
                        if kind != TargetKind::Sequence {
                            if let Some(&dep) = table.get(&Key::Iterate) {
                                deps.push(dep);
                            }
                            if kind == TargetKind::Keyed {
                                if let Some(&dep) = table.get(&Key::MapKeyIterate) {
                                    deps.push(dep);
                                }
                            }
                        }
                    }
                    TriggerOp::Set => {
                        if kind == TargetKind::Keyed {
                            if let Some(&dep) = table.get(&Key::Iterate) {
                                deps.push(dep);
                            }
                        }
                    }
                    TriggerOp::Clear => unreachable!(),
                }
            }
        }
    });
    if known.is_none() {
        // Target was never tracked
        return;
    }

    let event = DebugEvent {
        target: Some(target),
        key,
        op: DebugOp::Trigger(op),
    };

    match deps.len() {
        0 => {}
        1 => trigger_effects(deps[0].snapshot(), &event),
        _ => {
            // Merge the surviving deps into one deduplicated membership,
            // then dispatch once
            let mut merged: IndexSet<EffectId, FastHashBuilder> = IndexSet::default();
            for dep in deps {
                merged.extend(dep.snapshot());
            }
            trigger_effects(merged.into_iter().collect(), &event);
        }
    }
}

/// Fire a snapshot of effects: computed-backed effects first, so derived
/// values are invalidated (and may re-notify) before plain effects read
/// them.
pub(crate) fn trigger_effects(effects: SmallVec<[EffectId; 8]>, event: &DebugEvent) {
    for &effect in &effects {
        if effect.computed_kind().is_some() {
            trigger_effect(effect, event);
        }
    }
    for &effect in &effects {
        if effect.computed_kind().is_none() {
            trigger_effect(effect, event);
        }
    }
}

/// Fire one effect: run it, or hand it to its scheduler.
///
/// An effect that writes a slot it also reads would re-trigger itself
/// mid-run; that self-feedback is suppressed unless the effect opted into
/// `allow_recurse`.
pub(crate) fn trigger_effect(effect: EffectId, event: &DebugEvent) {
    if active_effect() == Some(effect) && !effect.allow_recurse() {
        return;
    }
    effect.fire_on_trigger(event);
    if effect.has_scheduler() {
        effect.run_scheduler(false);
    } else {
        run_effect(effect);
    }
}

/// Notify everything subscribed to a ref-style owner's dep.
pub(crate) fn trigger_ref(dep: DepId) {
    let event = DebugEvent {
        target: None,
        key: None,
        op: DebugOp::Trigger(TriggerOp::Set),
    };
    trigger_effects(dep.snapshot(), &event);
}

/// Drop every dep table of a target.
///
/// Rust has no weak maps, so the proxy layer must tell the core when an
/// observable object goes away; until then the target's dep tables are
/// retained.
pub fn release_target(target: TargetId) {
    arena_release_target(target);
}
