//! Lightweight operation counters for the buffer cache.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters updated on the cache's hot paths.
///
/// All updates are relaxed: the counters order nothing and a snapshot is
/// only ever approximate while the cache is under load.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    relocations: AtomicU64,
    exhaustions: AtomicU64,
}

impl CacheStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relocation(&self) {
        self.relocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exhaustion(&self) {
        self.exhaustions.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            relocations: self.relocations.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Fetches satisfied by a slot already bound to the requested block.
    pub hits: u64,
    /// Fetches that had to claim a slot.
    pub misses: u64,
    /// Slots rebound to a new block identity.
    pub evictions: u64,
    /// Victim slots moved from a foreign bucket to the block's home bucket.
    pub relocations: u64,
    /// Misses that failed because every slot was referenced.
    pub exhaustions: u64,
}
