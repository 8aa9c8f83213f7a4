//! Memoized derived values backed by a lazy effect.
//!
//! A computed wraps a getter in an effect so that the getter's reads are
//! tracked like any other effect's. The result is cached until an upstream
//! write invalidates it; readers of the computed subscribe to the
//! computed's own dep and are notified eagerly when it is invalidated.

use crate::arena::{ComputedKind, DepId, create_dep, dep_arena_remove};
use crate::effect::{Effect, EffectOptions};
use crate::tracking::{track_ref, trigger_ref};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Create a memoized derived value.
///
/// The getter does not run until the first [`get`](Computed::get).
pub fn computed<T, F>(getter: F) -> Arc<Computed<T>>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut() -> T + Send + 'static,
{
    Computed::new(getter)
}

/// Memoized derived value with eager downstream notification.
///
/// # How it works
/// 1. The getter is wrapped in a lazy effect whose run stores the result
///    into the value cell.
/// 2. Reading [`get`](Computed::get) subscribes the running effect to this
///    computed's own dep, then recomputes if the dirty flag is set. The
///    recompute runs inside the effect's tracking scope, so the computed
///    re-subscribes to exactly the upstream slots the getter still reads.
/// 3. When an upstream slot changes, the effect's scheduler flips the dirty
///    flag and notifies this computed's subscribers, who will re-read and
///    recompute on demand.
///
/// # Example
/// ```ignore
/// let power = computed(move || {
///     track(circuit, TrackOp::Get, Key::prop("voltage"));
///     voltage.load(Ordering::Relaxed) * 2
/// });
///
/// let p1 = power.get(); // computes
/// let p2 = power.get(); // cached
/// ```
pub struct Computed<T> {
    /// Cached getter result; None until the first computation.
    value: Arc<RwLock<Option<T>>>,

    /// Set by the scheduler on upstream change, cleared by `get`.
    dirty: Arc<AtomicBool>,

    /// This computed's own dep; readers subscribe here.
    dep: DepId,

    /// The backing effect running the getter under tracking.
    effect: Effect,
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a computed. See [`computed`].
    pub fn new<F>(getter: F) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
    {
        let dep = create_dep();
        let value: Arc<RwLock<Option<T>>> = Arc::new(RwLock::new(None));
        let dirty = Arc::new(AtomicBool::new(true));

        let value_cell = value.clone();
        let mut getter = getter;

        let dirty_flag = dirty.clone();
        let effect = EffectOptions::new()
            .lazy()
            .computed_kind(ComputedKind::Eager)
            .scheduler_raw(Box::new(move |_chained| {
                // First invalidation notifies; repeats before the next read
                // are collapsed
                if !dirty_flag.swap(true, Ordering::AcqRel) {
                    trigger_ref(dep);
                }
            }))
            .build(move || {
                *value_cell.write() = Some(getter());
            });

        Arc::new(Self {
            value,
            dirty,
            dep,
            effect,
        })
    }

    /// Read the value, recomputing if an upstream change invalidated it.
    ///
    /// Inside an effect this also subscribes the effect to the computed.
    pub fn get(&self) -> T {
        track_ref(self.dep);
        if self.dirty.swap(false, Ordering::AcqRel) {
            self.effect.run();
        }
        self.value
            .read()
            .clone()
            .expect("recompute above fills the cell")
    }
}

impl<T> Drop for Computed<T> {
    fn drop(&mut self) {
        // The effect field unsubscribes and frees itself on drop
        dep_arena_remove(self.dep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Key, TargetId};
    use crate::tracking::{TargetKind, TrackOp, TriggerOp, track, trigger};
    use std::sync::atomic::{AtomicI64, AtomicUsize};

    fn set(target: TargetId, key: Key) {
        trigger(target, TargetKind::Plain, TriggerOp::Set, Some(key), None);
    }

    #[test]
    fn computes_on_first_read_then_caches() {
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in = calls.clone();
        let answer = computed(move || {
            calls_in.fetch_add(1, Ordering::Relaxed);
            42
        });

        assert_eq!(calls.load(Ordering::Relaxed), 0, "lazy until first read");
        assert_eq!(answer.get(), 42);
        assert_eq!(answer.get(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn upstream_write_invalidates_and_recomputes_on_read() {
        let target = TargetId::fresh();
        let source = Arc::new(AtomicI64::new(3));
        let calls = Arc::new(AtomicUsize::new(0));

        let source_in = source.clone();
        let calls_in = calls.clone();
        let doubled = computed(move || {
            calls_in.fetch_add(1, Ordering::Relaxed);
            track(target, TrackOp::Get, Key::prop("n"));
            source_in.load(Ordering::Relaxed) * 2
        });

        assert_eq!(doubled.get(), 6);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        source.store(5, Ordering::Relaxed);
        set(target, Key::prop("n"));

        // Nothing recomputes until read
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(doubled.get(), 10);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn notifies_subscribed_effects_eagerly() {
        use crate::effect::Effect;

        let target = TargetId::fresh();
        let source = Arc::new(AtomicI64::new(1));
        let seen = Arc::new(AtomicI64::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let source_in = source.clone();
        let derived = computed(move || {
            track(target, TrackOp::Get, Key::prop("n"));
            source_in.load(Ordering::Relaxed) + 100
        });

        let derived_in = derived.clone();
        let seen_in = seen.clone();
        let runs_in = runs.clone();
        let _reader = Effect::new(move || {
            runs_in.fetch_add(1, Ordering::Relaxed);
            seen_in.store(derived_in.get(), Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(seen.load(Ordering::Relaxed), 101);

        source.store(2, Ordering::Relaxed);
        set(target, Key::prop("n"));

        assert_eq!(runs.load(Ordering::Relaxed), 2);
        assert_eq!(seen.load(Ordering::Relaxed), 102);
    }

    #[test]
    fn chained_computeds_propagate() {
        let target = TargetId::fresh();
        let source = Arc::new(AtomicI64::new(1));

        let source_in = source.clone();
        let base = computed(move || {
            track(target, TrackOp::Get, Key::prop("n"));
            source_in.load(Ordering::Relaxed)
        });

        let base_in = base.clone();
        let plus_one = computed(move || base_in.get() + 1);

        assert_eq!(plus_one.get(), 2);

        source.store(7, Ordering::Relaxed);
        set(target, Key::prop("n"));

        assert_eq!(plus_one.get(), 8);
    }

    #[test]
    fn repeated_invalidations_collapse_until_the_next_read() {
        use crate::effect::Effect;
        use std::sync::atomic::AtomicBool;

        let target = TargetId::fresh();
        let runs = Arc::new(AtomicUsize::new(0));
        let read_it = Arc::new(AtomicBool::new(true));

        let derived = computed(move || {
            track(target, TrackOp::Get, Key::prop("n"));
            0
        });

        let derived_in = derived.clone();
        let runs_in = runs.clone();
        let read_it_in = read_it.clone();
        let _reader = Effect::new(move || {
            runs_in.fetch_add(1, Ordering::Relaxed);
            if read_it_in.load(Ordering::Relaxed) {
                let _ = derived_in.get();
            }
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        // The reader stops consuming the computed, so after the next
        // invalidation the dirty flag stays set
        read_it.store(false, Ordering::Relaxed);
        set(target, Key::prop("n"));
        assert_eq!(runs.load(Ordering::Relaxed), 2);

        // Already dirty and unread: further writes are absorbed silently
        set(target, Key::prop("n"));
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn dropping_a_computed_detaches_it_upstream() {
        let target = TargetId::fresh();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in = calls.clone();
        let derived = computed(move || {
            calls_in.fetch_add(1, Ordering::Relaxed);
            track(target, TrackOp::Get, Key::prop("n"));
            0
        });
        let _ = derived.get();
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        drop(derived);

        // No stale recompute, no panic
        set(target, Key::prop("n"));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
