#![forbid(unsafe_code)]
//! Umbrella crate for the minnow block layer.
//!
//! Downstream code depends on this crate alone; the member crates are an
//! internal layering detail.

pub use minnow_block::{
    BlockDevice, BlockGuard, BufferCache, CacheStats, Clock, FileBlockDevice, PinnedBlock,
    StatsSnapshot,
};
pub use minnow_error::{MinnowError, Result};
pub use minnow_types::{
    BlockKey, BlockNumber, BlockSize, CacheConfig, ConfigError, DeviceId, Tick,
};
