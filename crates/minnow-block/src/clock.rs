//! Logical clock stamping free events in the buffer cache.

use minnow_types::Tick;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic tick source shared by a cache and its tests.
///
/// The cache advances the clock once per stamped event, so two free events
/// never carry the same tick and recency comparisons are total. The clock
/// is injected into [`BufferCache::new`](crate::BufferCache::new) rather
/// than constructed internally, which lets tests drive time
/// deterministically.
pub struct Clock {
    ticks: AtomicU64,
}

impl Clock {
    /// Create a clock whose next advance yields `start + 1`.
    #[must_use]
    pub fn new(start: Tick) -> Self {
        Self {
            ticks: AtomicU64::new(start.0),
        }
    }

    /// Most recently issued tick.
    #[must_use]
    pub fn now(&self) -> Tick {
        Tick(self.ticks.load(Ordering::Acquire))
    }

    /// Issue the next tick.
    pub fn advance(&self) -> Tick {
        Tick(self.ticks.fetch_add(1, Ordering::AcqRel).saturating_add(1))
    }
}

impl Default for Clock {
    /// Start at [`Tick::ZERO`], keeping the zero stamp reserved for slots
    /// that have never been freed.
    fn default() -> Self {
        Self::new(Tick::ZERO)
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock").field("now", &self.now()).finish()
    }
}
