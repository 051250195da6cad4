//! Hashing for the graph's internal edge sets.
//!
//! Dependency and subscriber sets are keyed by arena indices, hashed
//! millions of times per session; `FastHashBuilder` is a zero-sized
//! `BuildHasher` over foldhash with a fixed seed. Internal ids are not
//! attacker-controlled, so HashDoS resistance is not needed here.

use foldhash::fast::FixedState;
use std::hash::BuildHasher;

/// Zero-sized, deterministic `BuildHasher` for id-keyed collections.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = foldhash::fast::FoldHasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x9e3779b97f4a7c15).build_hasher()
    }
}
