//! A reduce-by-key pre-stage for a distributed dataflow engine.
//!
//! Each worker pre-aggregates its key/value pairs in a partitioned hash
//! table, spilling partitions to local storage when its memory budget runs
//! out, and streams each partition to the worker that will finish the
//! reduction. Before the final flush the workers run a two-round exchange of
//! Golomb-Rice coded key fingerprints to learn which reduced keys exist on
//! more than one worker, without shipping the values themselves.

use std::hash::{Hash, Hasher};

pub mod config;
pub mod data;
pub mod dedup;
pub mod emitter;
pub mod error;
pub mod golomb;
pub mod net;
pub mod spill;
pub mod stage;
pub mod standalone;
pub mod table;
pub mod workload;

pub use config::{KeyMode, ReduceConfig};
pub use error::{Error, Result};

/////////////////////////////////////////////////////////////////////////////
// Ranges
/////////////////////////////////////////////////////////////////////////////

/// A half-open interval `[begin, end)`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Range {
    pub begin: u64,
    pub end: u64,
}

impl Range {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    #[inline]
    pub fn contains(&self, value: u64) -> bool {
        self.begin <= value && value < self.end
    }
}

/// The `index`-th of `parts` contiguous, proportionally sized slices of
/// `[0, global_size)`. Slices of consecutive indices touch, and together
/// they cover the whole interval.
pub fn calculate_local_range(global_size: u64, parts: usize, index: usize) -> Range {
    assert!(parts > 0, "cannot split a range into zero parts");
    assert!(index < parts, "slice {index} out of {parts}");
    let bound = |i: usize| (u128::from(global_size) * i as u128 / parts as u128) as u64;
    Range::new(bound(index), bound(index + 1))
}

/////////////////////////////////////////////////////////////////////////////
// Key hashing
/////////////////////////////////////////////////////////////////////////////

/// Hashes a key with FNV-1a. The table places keys and the fingerprint
/// exchange projects keys through this one function, so every worker agrees
/// on both.
pub fn key_hash<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}
