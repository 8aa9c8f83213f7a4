// Dep arena - storage for dependency sets
//
// A dep is the set of effects that observed one (target, key) slot, plus two
// recursion-level bitmasks driving the incremental re-tracking sweep:
// - w: the dep was already in the running effect's list before this run
// - n: the dep was tracked again during this run
// Bit position == effect nesting depth, so nested runs mark independently.
//
// The arena uses global static storage with RwLock for thread-safe access.
// DepId is a lightweight newtype that indexes into the slab. The target map
// (target -> key -> dep) also lives here; deps are resolved through it on
// track, or created standalone for value owners such as computeds.

use crate::hash::FastHashBuilder;
use indexmap::IndexSet;
use papaya::HashMap as PapayaHashMap;
use parking_lot::RwLock;
use slab::Slab;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use super::EffectId;

/// Global dep arena - stores every dependency set in the process
static DEP_ARENA: RwLock<Slab<DepData>> = RwLock::new(Slab::new());

/// Global target map: target -> (key -> dep)
///
/// Targets are inserted lazily on first track. Rust has no weak maps, so a
/// target's table is retained until the host calls `release_target`.
///
/// Uses papaya's lock-free HashMap for efficient concurrent reads; each
/// per-target table is an ordinary HashMap behind its own RwLock.
static TARGET_MAP: LazyLock<PapayaHashMap<TargetId, RwLock<HashMap<Key, DepId, FastHashBuilder>>>> =
    LazyLock::new(PapayaHashMap::new);

/// Counter backing [`TargetId::fresh`].
static NEXT_TARGET: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of an observable object.
///
/// The proxy layer that intercepts property access owns the mapping from its
/// objects to these tokens; the core never inspects the object itself.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TargetId(u64);

impl TargetId {
    /// Wrap a host-assigned token.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocate a process-unique target token.
    pub fn fresh() -> Self {
        Self(NEXT_TARGET.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw token value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Identifies one observable slot of a target.
///
/// `Iterate` and `MapKeyIterate` are the two process-wide iteration
/// sentinels: effects that enumerate a collection's values (or, for keyed
/// collections, its keys) subscribe to these instead of to every element.
/// `Length` is the dedicated sequence-length slot.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Key {
    /// A named property slot.
    Prop(Arc<str>),
    /// A sequence index slot.
    Index(u64),
    /// The sequence length slot.
    Length,
    /// Dependency on the enumeration of a collection's values.
    Iterate,
    /// Dependency on the enumeration of a keyed collection's keys.
    MapKeyIterate,
}

impl Key {
    /// Shorthand for a named property key.
    pub fn prop(name: &str) -> Self {
        Key::Prop(Arc::from(name))
    }
}

/// Unique identifier for a dependency set in the arena.
///
/// This is a zero-cost wrapper around a slab index. A dep freed by
/// `release_target` leaves stale DepIds behind in effect dep lists;
/// accessing a stale DepId is a harmless no-op.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct DepId(u32);

impl DepId {
    /// Create a new DepId from a raw index
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    /// Convert to usize for slab indexing
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the dep with a closure (read-only)
    ///
    /// Returns None if the dep has been freed (stale access).
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&DepData) -> R,
    {
        let arena = DEP_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Subscribe an effect to this dep (deduplicated)
    pub(crate) fn add_effect(self, effect: EffectId) {
        self.with(|dep| {
            dep.effects.write().insert(effect);
        });
    }

    /// Remove an effect from this dep
    pub(crate) fn remove_effect(self, effect: EffectId) {
        self.with(|dep| {
            dep.effects.write().swap_remove(&effect);
        });
    }

    /// Whether an effect is subscribed to this dep
    pub(crate) fn has_effect(self, effect: EffectId) -> bool {
        self.with(|dep| dep.effects.read().contains(&effect))
            .unwrap_or(false)
    }

    /// Copy the current membership into a stable sequence.
    ///
    /// Trigger dispatch iterates the snapshot so that subscription changes
    /// made by running effects cannot perturb the ongoing notification.
    pub(crate) fn snapshot(self) -> SmallVec<[EffectId; 8]> {
        self.with(|dep| dep.effects.read().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Was this dep in the running effect's list before the current run?
    pub(crate) fn was_tracked(self, bit: u32) -> bool {
        self.with(|dep| dep.w.load(Ordering::Relaxed) & bit != 0)
            .unwrap_or(false)
    }

    /// Has this dep been tracked again during the current run?
    pub(crate) fn new_tracked(self, bit: u32) -> bool {
        self.with(|dep| dep.n.load(Ordering::Relaxed) & bit != 0)
            .unwrap_or(false)
    }

    /// Stamp the was-tracked marker for one nesting depth
    pub(crate) fn set_w(self, bit: u32) {
        self.with(|dep| dep.w.fetch_or(bit, Ordering::Relaxed));
    }

    /// Stamp the newly-tracked marker for one nesting depth
    pub(crate) fn set_n(self, bit: u32) {
        self.with(|dep| dep.n.fetch_or(bit, Ordering::Relaxed));
    }

    /// Clear both markers for one nesting depth
    pub(crate) fn clear_markers(self, bit: u32) {
        self.with(|dep| {
            dep.w.fetch_and(!bit, Ordering::Relaxed);
            dep.n.fetch_and(!bit, Ordering::Relaxed);
        });
    }
}

/// One dependency set stored in the arena.
///
/// Membership is unordered and unique; the same dep may appear in many
/// effects' dep lists and an effect in many deps. The marker words are only
/// touched by the effect currently running at the corresponding depth.
pub(crate) struct DepData {
    /// Effects subscribed to this slot.
    /// IndexSet gives O(1) insert/lookup, dedup, and a deterministic
    /// iteration order for trigger snapshots.
    pub(crate) effects: RwLock<IndexSet<EffectId, FastHashBuilder>>,

    /// Was-tracked marker bits, one per effect nesting depth.
    pub(crate) w: AtomicU32,

    /// Newly-tracked marker bits, one per effect nesting depth.
    pub(crate) n: AtomicU32,
}

impl DepData {
    fn new() -> Self {
        Self {
            effects: RwLock::new(IndexSet::default()),
            w: AtomicU32::new(0),
            n: AtomicU32::new(0),
        }
    }
}

// Arena manipulation functions

/// Allocate a fresh empty dep and return its id
pub(crate) fn create_dep() -> DepId {
    let mut arena = DEP_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(DepData::new());
    DepId::new(key as u32)
}

/// Free a dep from the arena
pub(crate) fn dep_arena_remove(id: DepId) {
    let mut arena = DEP_ARENA.write();
    if arena.contains(id.index()) {
        arena.remove(id.index());
    }
}

/// Resolve the dep for a (target, key) slot, creating intermediate
/// structures as needed.
pub(crate) fn get_or_create_dep(target: TargetId, key: &Key) -> DepId {
    let map = TARGET_MAP.pin();
    let table = map.get_or_insert_with(target, || RwLock::new(HashMap::with_hasher(FastHashBuilder)));
    if let Some(&dep) = table.read().get(key) {
        return dep;
    }
    // Racing creators are resolved by re-checking under the write lock.
    let mut table = table.write();
    match table.get(key) {
        Some(&dep) => dep,
        None => {
            let dep = create_dep();
            table.insert(key.clone(), dep);
            dep
        }
    }
}

/// Run a closure over a target's key table, if the target has ever been
/// tracked.
pub(crate) fn with_target_deps<F, R>(target: TargetId, f: F) -> Option<R>
where
    F: FnOnce(&HashMap<Key, DepId, FastHashBuilder>) -> R,
{
    let map = TARGET_MAP.pin();
    map.get(&target).map(|table| f(&table.read()))
}

/// Drop a target's key table and free its deps.
///
/// Effects subscribed through those deps keep stale DepIds in their lists;
/// every stale access is a no-op and the ids fall out on the next re-run
/// sweep or stop.
pub(crate) fn release_target(target: TargetId) {
    let map = TARGET_MAP.pin();
    if let Some(table) = map.remove(&target) {
        for &dep in table.read().values() {
            dep_arena_remove(dep);
        }
    }
}
