#![forbid(unsafe_code)]
//! Core identifier and geometry types shared across the minnow crates.
//!
//! Everything here is a plain value type: newtype IDs for devices and
//! blocks, the validated [`BlockSize`], the monotonic [`Tick`] stamp, and
//! the [`CacheConfig`] that fixes the buffer cache geometry at startup.
//! This crate deliberately has no I/O and no locking so that every other
//! crate can depend on it without cycles.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a registered block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Block number within a single device, in units of that device's block
/// size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Cache identity of one block: the pair of device and block number.
///
/// Two buffers with the same `BlockKey` would alias the same on-disk
/// block, so the cache guarantees at most one live slot per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub device: DeviceId,
    pub block: BlockNumber,
}

impl BlockKey {
    #[must_use]
    pub fn new(device: DeviceId, block: BlockNumber) -> Self {
        Self { device, block }
    }
}

/// Monotonic logical timestamp ordering free events in the cache.
///
/// Ticks only ever increase. `Tick::ZERO` is reserved for slots that have
/// never been freed, which makes fresh slots the preferred eviction
/// victims.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

impl Tick {
    pub const ZERO: Tick = Tick(0);
}

/// Validated block size in bytes.
///
/// Must be a power of two between 512 and 65536 inclusive, which covers
/// everything from raw sectors to large filesystem blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub const MIN: u32 = 512;
    pub const MAX: u32 = 65536;

    /// Create a validated block size.
    pub fn new(value: u32) -> Result<Self, ConfigError> {
        if value.is_power_of_two() && (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ConfigError::InvalidField {
                field: "block_size",
                reason: "must be a power of two in 512..=65536",
            })
        }
    }

    /// Size in bytes.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Size in bytes as a `usize`, for sizing in-memory buffers.
    #[must_use]
    pub fn bytes(self) -> usize {
        usize::try_from(self.0).expect("block size fits in usize")
    }

    /// Byte offset of the start of `block`, or `None` on overflow.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }
}

/// Fixed geometry of the buffer cache, chosen once at startup.
///
/// The defaults are deliberately small: 30 slots spread over 13 buckets
/// of 1024-byte blocks. A prime bucket count keeps sequential block
/// numbers from piling into one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total number of block slots in the pool. Never grows or shrinks
    /// after the cache is built.
    pub pool_slots: usize,
    /// Number of hash buckets the slot pool is partitioned into.
    pub bucket_count: usize,
    /// Byte size of one cached block.
    pub block_size: BlockSize,
}

impl CacheConfig {
    /// Check the geometry for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_slots == 0 {
            return Err(ConfigError::InvalidField {
                field: "pool_slots",
                reason: "must be at least 1",
            });
        }
        if self.bucket_count == 0 {
            return Err(ConfigError::InvalidField {
                field: "bucket_count",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pool_slots: 30,
            bucket_count: 13,
            block_size: BlockSize(1024),
        }
    }
}

/// Validation error for configuration values.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}
