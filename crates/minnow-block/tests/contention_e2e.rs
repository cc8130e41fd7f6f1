#![forbid(unsafe_code)]
//! Multi-thread contention tests for the buffer cache: content-lock
//! mutual exclusion, single-fill on racing misses, exhaustion
//! backpressure, and pin residency under eviction churn.

use minnow_block::{BlockDevice, BlockGuard, BufferCache, Clock};
use minnow_error::{MinnowError, Result};
use minnow_types::{BlockNumber, BlockSize, CacheConfig, DeviceId};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;

const DEV: DeviceId = DeviceId(0);

/// Zero-filled in-memory device that logs every block it serves.
struct MemDevice {
    bytes: Mutex<Vec<u8>>,
    block_size: BlockSize,
    read_log: Mutex<Vec<BlockNumber>>,
}

impl MemDevice {
    fn new(blocks: u64) -> Arc<Self> {
        let block_size = BlockSize::new(512).expect("valid block size");
        let len = usize::try_from(blocks).expect("small device") * block_size.bytes();
        Arc::new(Self {
            bytes: Mutex::new(vec![0_u8; len]),
            block_size,
            read_log: Mutex::new(Vec::new()),
        })
    }

    fn byte_range(&self, block: BlockNumber) -> std::ops::Range<usize> {
        let start = usize::try_from(block.0).expect("small device") * self.block_size.bytes();
        start..start + self.block_size.bytes()
    }

    fn reads_of(&self, block: BlockNumber) -> usize {
        self.read_log.lock().iter().filter(|b| **b == block).count()
    }

    /// Counter persisted in the first four bytes of `block`.
    fn persisted_counter(&self, block: BlockNumber) -> u32 {
        let bytes = self.bytes.lock();
        let start = self.byte_range(block).start;
        u32::from_le_bytes(bytes[start..start + 4].try_into().expect("4 bytes"))
    }
}

impl BlockDevice for MemDevice {
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        self.read_log.lock().push(block);
        let bytes = self.bytes.lock();
        buf.copy_from_slice(&bytes[self.byte_range(block)]);
        Ok(())
    }

    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<()> {
        let range = self.byte_range(block);
        let mut bytes = self.bytes.lock();
        bytes[range].copy_from_slice(buf);
        Ok(())
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        u64::try_from(self.bytes.lock().len() / self.block_size.bytes()).expect("small device")
    }
}

fn build_cache(
    pool_slots: usize,
    bucket_count: usize,
    device: &Arc<MemDevice>,
) -> Arc<BufferCache> {
    let config = CacheConfig {
        pool_slots,
        bucket_count,
        block_size: device.block_size,
    };
    let dyn_device: Arc<dyn BlockDevice> = device.clone();
    Arc::new(
        BufferCache::new(config, Arc::new(Clock::default()), [(DEV, dyn_device)])
            .expect("cache construction"),
    )
}

/// Fetch that treats exhaustion as backpressure and retries.
fn fetch_with_retry(cache: &BufferCache, block: BlockNumber) -> BlockGuard<'_> {
    for _ in 0..100_000 {
        match cache.fetch(DEV, block) {
            Ok(guard) => return guard,
            Err(MinnowError::Exhausted { .. }) => thread::yield_now(),
            Err(err) => panic!("unexpected fetch error: {err}"),
        }
    }
    panic!("cache stayed exhausted across 100000 attempts");
}

fn read_counter(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[..4].try_into().expect("4 bytes"))
}

fn write_counter(bytes: &mut [u8], value: u32) {
    bytes[..4].copy_from_slice(&value.to_le_bytes());
}

#[test]
fn guards_on_one_block_are_mutually_exclusive() {
    const THREADS: usize = 8;
    const ITERS: u32 = 64;

    let device = MemDevice::new(8);
    let cache = build_cache(4, 2, &device);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ITERS {
                    let mut guard = cache.fetch(DEV, BlockNumber(0)).expect("fetch");
                    let value = read_counter(&guard);
                    write_counter(&mut guard, value + 1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread");
    }

    // A read-modify-write through overlapping guards would lose updates.
    let guard = cache.fetch(DEV, BlockNumber(0)).expect("final fetch");
    let total = u32::try_from(THREADS).expect("small") * ITERS;
    assert_eq!(read_counter(&guard), total);

    // The racing first misses must have filled the slot exactly once.
    assert_eq!(device.reads_of(BlockNumber(0)), 1);
}

#[test]
fn racing_misses_on_one_block_bind_and_fill_once() {
    const THREADS: usize = 8;

    let device = MemDevice::new(16);
    let cache = build_cache(8, 4, &device);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let guard = cache.fetch(DEV, BlockNumber(5)).expect("fetch");
                assert!(guard.iter().all(|&b| b == 0));
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread");
    }

    assert_eq!(device.reads_of(BlockNumber(5)), 1);
    let snap = cache.stats().snapshot();
    assert_eq!(snap.misses, 1, "one thread claims the slot");
    assert_eq!(snap.hits, u64::try_from(THREADS).expect("small") - 1);
}

#[test]
fn counters_survive_eviction_churn_without_lost_updates() {
    const THREADS: u64 = 8;
    const ITERS: u64 = 48;
    const BLOCKS: u64 = 16;

    let device = MemDevice::new(BLOCKS);
    let cache = build_cache(4, 3, &device);
    let barrier = Arc::new(Barrier::new(usize::try_from(THREADS).expect("small")));

    let handles: Vec<_> = (0..THREADS)
        .map(|thread_index| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut incremented = [0_u32; 16];
                barrier.wait();
                for iter in 0..ITERS {
                    let block = (thread_index * 5 + iter * 3) % BLOCKS;
                    let mut guard = fetch_with_retry(&cache, BlockNumber(block));
                    let value = read_counter(&guard);
                    write_counter(&mut guard, value + 1);
                    // Flush while still holding the guard so the device
                    // copy is never behind a released buffer.
                    guard.flush().expect("flush");
                    incremented[usize::try_from(block).expect("small")] += 1;
                }
                incremented
            })
        })
        .collect();

    let mut expected = [0_u32; 16];
    for handle in handles {
        let incremented = handle.join().expect("worker thread");
        for (block, count) in incremented.iter().enumerate() {
            expected[block] += count;
        }
    }

    // Write-through plus single-slot identity means the device copy holds
    // every increment, no matter how often slots were recycled.
    for block in 0..BLOCKS {
        let expected = expected[usize::try_from(block).expect("small")];
        assert_eq!(
            device.persisted_counter(BlockNumber(block)),
            expected,
            "block {block} lost updates"
        );
    }
    assert!(cache.stats().snapshot().evictions > 0, "churn must evict");
}

#[test]
fn pinned_block_stays_resident_through_a_storm() {
    const THREADS: u64 = 6;
    const ITERS: u64 = 32;

    let device = MemDevice::new(32);
    let cache = build_cache(4, 2, &device);

    let guard = cache.fetch(DEV, BlockNumber(0)).expect("fetch pinned block");
    let pin = guard.pin();
    drop(guard);

    let barrier = Arc::new(Barrier::new(usize::try_from(THREADS).expect("small")));
    let handles: Vec<_> = (0..THREADS)
        .map(|thread_index| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for iter in 0..ITERS {
                    // Never block 0: everything else churns through the
                    // three unpinned slots.
                    let block = 1 + (thread_index * 11 + iter * 7) % 31;
                    drop(fetch_with_retry(&cache, BlockNumber(block)));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread");
    }

    assert_eq!(
        device.reads_of(BlockNumber(0)),
        1,
        "pinned block must never be refilled"
    );
    drop(cache.fetch(DEV, BlockNumber(0)).expect("refetch pinned"));
    assert_eq!(device.reads_of(BlockNumber(0)), 1);
    pin.unpin();
}
