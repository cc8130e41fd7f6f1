#![forbid(unsafe_code)]
//! Block device abstraction and the fixed-pool buffer cache.
//!
//! This crate provides the [`BlockDevice`] trait, a file-backed
//! implementation over flat image files, and [`BufferCache`]: a fixed pool
//! of block-sized slots partitioned across hash buckets, with per-slot
//! content locks held across device I/O and approximate
//! least-recently-freed eviction.
//!
//! # Example
//!
//! ```
//! use minnow_block::{BlockDevice, BufferCache, Clock};
//! use minnow_error::Result;
//! use minnow_types::{BlockNumber, BlockSize, CacheConfig, DeviceId};
//! use parking_lot::Mutex;
//! use std::sync::Arc;
//!
//! struct MemDevice {
//!     bytes: Mutex<Vec<u8>>,
//!     block_size: BlockSize,
//! }
//!
//! impl BlockDevice for MemDevice {
//!     fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
//!         let bytes = self.bytes.lock();
//!         let start = usize::try_from(block.0).expect("block index fits") * buf.len();
//!         buf.copy_from_slice(&bytes[start..start + buf.len()]);
//!         Ok(())
//!     }
//!
//!     fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<()> {
//!         let mut bytes = self.bytes.lock();
//!         let start = usize::try_from(block.0).expect("block index fits") * buf.len();
//!         bytes[start..start + buf.len()].copy_from_slice(buf);
//!         Ok(())
//!     }
//!
//!     fn block_size(&self) -> BlockSize {
//!         self.block_size
//!     }
//!
//!     fn block_count(&self) -> u64 {
//!         8
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let block_size = BlockSize::new(1024).expect("valid block size");
//! let device: Arc<dyn BlockDevice> = Arc::new(MemDevice {
//!     bytes: Mutex::new(vec![0; 8 * 1024]),
//!     block_size,
//! });
//! let config = CacheConfig { block_size, ..CacheConfig::default() };
//! let cache = BufferCache::new(config, Arc::new(Clock::default()), [(DeviceId(0), device)])?;
//!
//! let mut guard = cache.fetch(DeviceId(0), BlockNumber(3))?;
//! guard[0] = 0xA5;
//! guard.flush()?;
//! drop(guard);
//! # Ok(())
//! # }
//! ```

mod cache;
mod clock;
mod stats;

pub use cache::{BlockGuard, BufferCache, PinnedBlock};
pub use clock::Clock;
pub use stats::{CacheStats, StatsSnapshot};

use minnow_error::{MinnowError, Result};
use minnow_types::{BlockNumber, BlockSize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// A random-access block device.
///
/// Implementations transfer exactly one block per call and may block the
/// calling thread. The cache performs device I/O while holding only the
/// target slot's content lock, so a slow device stalls readers of that one
/// block and nobody else.
pub trait BlockDevice: Send + Sync {
    /// Read `block` into `buf`, whose length must equal the device block
    /// size.
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()>;

    /// Write `block` from `buf`, whose length must equal the device block
    /// size.
    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<()>;

    /// Block size this device transfers.
    fn block_size(&self) -> BlockSize;

    /// Number of addressable blocks.
    fn block_count(&self) -> u64;
}

/// Block device backed by a flat image file.
///
/// Opens read-write when permissions allow and falls back to read-only;
/// writes to a read-only device fail with [`MinnowError::ReadOnly`].
/// Cloning shares the underlying file handle.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    block_size: BlockSize,
    blocks: u64,
    writable: bool,
}

impl FileBlockDevice {
    /// Open an image file as a block device.
    ///
    /// The file length must be an exact multiple of `block_size`.
    pub fn open(path: impl AsRef<Path>, block_size: BlockSize) -> Result<Self> {
        let path = path.as_ref();
        let (file, writable) = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => (file, true),
            Err(_) => (File::open(path)?, false),
        };
        let len = file.metadata()?.len();
        let size = u64::from(block_size.get());
        if len % size != 0 {
            return Err(MinnowError::Config(format!(
                "image {} is {len} bytes, not a multiple of the {size}-byte block size",
                path.display()
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            block_size,
            blocks: len / size,
            writable,
        })
    }

    /// Whether the backing file was opened writable.
    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Validate one transfer and return its byte offset in the image.
    fn transfer_offset(&self, block: BlockNumber, len: usize) -> Result<u64> {
        if len != self.block_size.bytes() {
            return Err(MinnowError::BufferLength {
                got: len,
                expected: self.block_size.bytes(),
            });
        }
        if block.0 >= self.blocks {
            return Err(MinnowError::OutOfRange {
                block: block.0,
                blocks: self.blocks,
            });
        }
        self.block_size
            .block_to_byte(block)
            .ok_or(MinnowError::OutOfRange {
                block: block.0,
                blocks: self.blocks,
            })
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        let offset = self.transfer_offset(block, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(MinnowError::ReadOnly);
        }
        let offset = self.transfer_offset(block, buf.len())?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.blocks
    }
}
