//! Zero-sized hash builder for the crate's internal hash collections.
//!
//! Dep membership sets, the target map, and the scheduler's recursion
//! bookkeeping all hash small `Copy` ids. `FastHashBuilder` gives them a
//! foldhash-backed hasher with a fixed seed and no per-collection state.

use std::hash::BuildHasher;

pub use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized `BuildHasher` backed by foldhash with a fixed seed.
///
/// HashDoS resistance is irrelevant here: every hashed value is an internal
/// id, never attacker-controlled input. The fixed seed keeps hashing
/// deterministic across instances and across runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x9e37_79b9_7f4a_7c15).build_hasher()
    }
}
