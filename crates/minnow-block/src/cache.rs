//! Fixed-pool buffer cache with hash-bucket partitioning.
//!
//! # Design
//!
//! The cache owns `pool_slots` block-sized payload slots, allocated once
//! at construction and never resized. Identity metadata for each slot
//! lives inside exactly one bucket's mutex-guarded vector; relocating a
//! slot moves the metadata value between vectors, so membership and the
//! `ref_count`/`last_free` scalars are always protected by the lock of
//! the bucket currently holding them.
//!
//! Two lock classes exist:
//!
//! - Bucket locks are short-hold. They cover lookups, refcount changes,
//!   and the eviction walk, and are never held across device I/O.
//! - Content locks (one per slot) are long-hold. A [`BlockGuard`] keeps
//!   its slot's content lock for its whole lifetime, including any device
//!   read or write.
//!
//! A miss keeps the block's home bucket locked across the entire victim
//! search, so concurrent misses on the same key serialize and the loser
//! finds the winner's slot already bound instead of double-caching it.
//! The walk visits buckets in ring order starting at the home bucket;
//! blocking acquisition is only permitted toward higher bucket indices,
//! and lower indices are probed with `try_lock` and skipped when
//! contended. Every blocking wait therefore ascends the bucket order and
//! the walks cannot deadlock against each other.

use crate::BlockDevice;
use crate::clock::Clock;
use crate::stats::CacheStats;
use minnow_error::{MinnowError, Result};
use minnow_types::{BlockKey, BlockNumber, BlockSize, CacheConfig, DeviceId, Tick};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};

/// Metadata for one slot, owned by the slot's current home bucket.
#[derive(Debug)]
struct SlotMeta {
    /// Index of the payload slot this entry controls.
    slot: usize,
    /// Cached block identity; `None` until the slot wins its first
    /// assignment, so an unused slot can never satisfy a lookup.
    key: Option<BlockKey>,
    /// Live holders: outstanding guards plus pins. Zero means the slot is
    /// eligible for eviction.
    ref_count: u32,
    /// Stamp of the most recent transition of `ref_count` to zero.
    last_free: Tick,
}

/// One payload slot. The mutex is the long-hold content lock.
struct Slot {
    /// Whether the payload holds the bytes of the currently bound block.
    /// Cleared under the bucket lock at assignment, set by whichever
    /// content-lock holder performs the fill read.
    valid: AtomicBool,
    payload: Mutex<Box<[u8]>>,
}

struct Bucket {
    entries: Mutex<Vec<SlotMeta>>,
}

/// Fixed-size cache of block buffers shared by all threads of a process.
///
/// See the module docs for the locking discipline. All methods take
/// `&self`; the cache is meant to be built once and shared, either by
/// reference or inside an `Arc`.
pub struct BufferCache {
    buckets: Vec<Bucket>,
    slots: Vec<Slot>,
    devices: HashMap<DeviceId, Arc<dyn BlockDevice>>,
    clock: Arc<Clock>,
    config: CacheConfig,
    stats: CacheStats,
}

impl BufferCache {
    /// Build a cache with the given geometry over a fixed set of devices.
    ///
    /// Every registered device must transfer blocks of the configured
    /// size. All payload memory is allocated here; steady-state operation
    /// never allocates.
    pub fn new(
        config: CacheConfig,
        clock: Arc<Clock>,
        devices: impl IntoIterator<Item = (DeviceId, Arc<dyn BlockDevice>)>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|err| MinnowError::Config(err.to_string()))?;
        let devices: HashMap<_, _> = devices.into_iter().collect();
        for (id, device) in &devices {
            if device.block_size() != config.block_size {
                return Err(MinnowError::Config(format!(
                    "device {} transfers {}-byte blocks, cache is configured for {}",
                    id.0,
                    device.block_size().get(),
                    config.block_size.get()
                )));
            }
        }

        let block_bytes = config.block_size.bytes();
        let slots: Vec<Slot> = (0..config.pool_slots)
            .map(|_| Slot {
                valid: AtomicBool::new(false),
                payload: Mutex::new(vec![0_u8; block_bytes].into_boxed_slice()),
            })
            .collect();

        // Seed the metadata round-robin across buckets. Each vector gets
        // capacity for the whole pool up front so later relocations are
        // plain moves, never allocations.
        let mut seeded: Vec<Vec<SlotMeta>> = (0..config.bucket_count)
            .map(|_| Vec::with_capacity(config.pool_slots))
            .collect();
        for slot in 0..config.pool_slots {
            seeded[slot % config.bucket_count].push(SlotMeta {
                slot,
                key: None,
                ref_count: 0,
                last_free: Tick::ZERO,
            });
        }
        let buckets = seeded
            .into_iter()
            .map(|entries| Bucket {
                entries: Mutex::new(entries),
            })
            .collect();

        info!(
            target: "minnow::block::cache",
            pool_slots = config.pool_slots,
            bucket_count = config.bucket_count,
            block_size = config.block_size.get(),
            devices = devices.len(),
            "buffer cache initialized"
        );
        Ok(Self {
            buckets,
            slots,
            devices,
            clock,
            config,
            stats: CacheStats::new(),
        })
    }

    /// Fetch the buffer for `block` on `device`, filling it from the
    /// device on a miss.
    ///
    /// Blocks until the slot's content lock is available; the returned
    /// guard holds that lock until dropped. Fails with
    /// [`MinnowError::Exhausted`] when every slot in the pool is
    /// referenced, which callers may treat as backpressure and retry.
    pub fn fetch(&self, device: DeviceId, block: BlockNumber) -> Result<BlockGuard<'_>> {
        let dev = self.device(device)?;
        let key = BlockKey::new(device, block);
        let slot = self.resolve(key)?;

        // The reference taken in resolve keeps the identity bound while we
        // wait for the content lock, which is always acquired with no
        // bucket lock held.
        let payload = self.slots[slot].payload.lock();
        let mut guard = BlockGuard {
            cache: self,
            slot,
            key,
            payload: Some(payload),
        };
        if !self.slots[slot].valid.load(Ordering::Acquire) {
            // On failure the guard drops normally: the reference is
            // released and the slot stays invalid for the next attempt.
            dev.read_block(block, &mut guard)?;
            self.slots[slot].valid.store(true, Ordering::Release);
            trace!(
                target: "minnow::block::cache",
                device = key.device.0,
                block = key.block.0,
                slot,
                "filled from device"
            );
        }
        Ok(guard)
    }

    /// Total number of payload slots.
    #[must_use]
    pub fn pool_slots(&self) -> usize {
        self.slots.len()
    }

    /// Number of hash buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Block size of every cached buffer.
    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.config.block_size
    }

    /// Operation counters.
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// The clock stamping free events.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    fn device(&self, device: DeviceId) -> Result<&Arc<dyn BlockDevice>> {
        self.devices
            .get(&device)
            .ok_or(MinnowError::UnknownDevice { device: device.0 })
    }

    /// Home bucket for a key: identity hash of the block number, reduced
    /// modulo the bucket count.
    fn bucket_index(&self, block: BlockNumber) -> usize {
        let count = u64::try_from(self.buckets.len()).expect("bucket count fits in u64");
        usize::try_from(block.0 % count).expect("bucket index fits in usize")
    }

    /// Map `key` to a referenced slot: hit in the home bucket or claim a
    /// victim. Returns with the slot's `ref_count` incremented.
    fn resolve(&self, key: BlockKey) -> Result<usize> {
        let target = self.bucket_index(key.block);
        let mut target_entries = self.buckets[target].entries.lock();

        if let Some(meta) = target_entries
            .iter_mut()
            .find(|meta| meta.key == Some(key))
        {
            meta.ref_count += 1;
            let slot = meta.slot;
            self.stats.record_hit();
            trace!(
                target: "minnow::block::cache",
                device = key.device.0,
                block = key.block.0,
                slot,
                "hit"
            );
            return Ok(slot);
        }

        self.stats.record_miss();
        self.claim_victim(target, target_entries, key)
    }

    /// Eviction walk for a miss on `key`, whose home bucket lock the
    /// caller passes in still held.
    ///
    /// The home lock stays held for the entire walk so that a concurrent
    /// miss on the same key waits here and then hits. At most one other
    /// bucket lock is held at a time, always acquired by the discipline
    /// in [`Self::lock_for_walk`].
    fn claim_victim(
        &self,
        target: usize,
        mut target_entries: MutexGuard<'_, Vec<SlotMeta>>,
        key: BlockKey,
    ) -> Result<usize> {
        let bucket_count = self.buckets.len();
        for step in 0..bucket_count {
            let index = (target + step) % bucket_count;

            if index == target {
                // Home bucket is already locked; scan it in place.
                if let Some(pos) = Self::victim_position(&target_entries) {
                    return Ok(self.assign(&mut target_entries, pos, key));
                }
                continue;
            }

            let Some(mut entries) = self.lock_for_walk(index, target) else {
                continue;
            };
            let Some(pos) = Self::victim_position(&entries) else {
                continue;
            };

            // Relocate: unlink the victim here, relink it in the home
            // bucket, then rebind it. Both locks are held only for the
            // unlink itself.
            let meta = entries.swap_remove(pos);
            drop(entries);
            self.stats.record_relocation();
            debug!(
                target: "minnow::block::cache",
                slot = meta.slot,
                from_bucket = index,
                to_bucket = target,
                "relocating victim to home bucket"
            );
            target_entries.push(meta);
            let pos = target_entries.len() - 1;
            return Ok(self.assign(&mut target_entries, pos, key));
        }

        self.stats.record_exhaustion();
        warn!(
            target: "minnow::block::cache",
            device = key.device.0,
            block = key.block.0,
            pool_slots = self.slots.len(),
            "cache exhausted, no unreferenced slot"
        );
        Err(MinnowError::Exhausted {
            pool_slots: self.slots.len(),
        })
    }

    /// Acquire the bucket at `index` for a walk whose home bucket
    /// (`target`) is already locked by the caller.
    ///
    /// Buckets above the target may be waited on; buckets below it must
    /// not be, so they are only probed. A contended lower bucket is
    /// skipped for this walk rather than risking a cyclic wait.
    fn lock_for_walk(&self, index: usize, target: usize) -> Option<MutexGuard<'_, Vec<SlotMeta>>> {
        if index > target {
            Some(self.buckets[index].entries.lock())
        } else {
            let entries = self.buckets[index].entries.try_lock();
            if entries.is_none() {
                warn!(
                    target: "minnow::block::cache",
                    bucket = index,
                    "skipping contended bucket during eviction walk"
                );
            }
            entries
        }
    }

    /// Position of the least-recently-freed unreferenced entry, if any.
    /// Ties keep the earliest entry, matching the scan order.
    fn victim_position(entries: &[SlotMeta]) -> Option<usize> {
        let mut best: Option<(usize, Tick)> = None;
        for (pos, meta) in entries.iter().enumerate() {
            if meta.ref_count != 0 {
                continue;
            }
            if best.is_none_or(|(_, stamp)| meta.last_free < stamp) {
                best = Some((pos, meta.last_free));
            }
        }
        best.map(|(pos, _)| pos)
    }

    /// Rebind the entry at `pos` to `key` under the home bucket's lock:
    /// new identity, one reference for the caller, payload marked stale.
    fn assign(&self, entries: &mut [SlotMeta], pos: usize, key: BlockKey) -> usize {
        let meta = &mut entries[pos];
        let evicted = meta.key.replace(key);
        meta.ref_count = 1;
        let slot = meta.slot;
        self.slots[slot].valid.store(false, Ordering::Release);
        self.stats.record_eviction();
        debug!(
            target: "minnow::block::cache",
            slot,
            device = key.device.0,
            block = key.block.0,
            evicted_device = evicted.map(|old| old.device.0),
            evicted_block = evicted.map(|old| old.block.0),
            "bound slot to block"
        );
        slot
    }

    /// Take an extra reference on an already-referenced slot.
    fn retain_slot(&self, slot: usize, key: BlockKey) {
        let mut entries = self.buckets[self.bucket_index(key.block)].entries.lock();
        let meta = Self::meta_mut(&mut entries, slot);
        meta.ref_count += 1;
        trace!(
            target: "minnow::block::cache",
            slot,
            ref_count = meta.ref_count,
            "retained"
        );
    }

    /// Drop one reference; the transition to zero stamps the free clock
    /// and makes the slot eligible for eviction again.
    fn release_slot(&self, slot: usize, key: BlockKey) {
        let mut entries = self.buckets[self.bucket_index(key.block)].entries.lock();
        let meta = Self::meta_mut(&mut entries, slot);
        assert!(
            meta.ref_count > 0,
            "slot {slot} released with no outstanding references"
        );
        meta.ref_count -= 1;
        if meta.ref_count == 0 {
            meta.last_free = self.clock.advance();
        }
        trace!(
            target: "minnow::block::cache",
            slot,
            ref_count = meta.ref_count,
            "released"
        );
    }

    /// Locate `slot`'s metadata inside its locked home bucket. Callers
    /// hold a reference on the slot, which pins its membership.
    fn meta_mut<'b>(entries: &'b mut [SlotMeta], slot: usize) -> &'b mut SlotMeta {
        entries
            .iter_mut()
            .find(|meta| meta.slot == slot)
            .expect("referenced slot is present in its home bucket")
    }
}

impl fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("pool_slots", &self.slots.len())
            .field("bucket_count", &self.buckets.len())
            .field("block_size", &self.config.block_size.get())
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

/// Exclusive handle to one cached block.
///
/// Holds the slot's content lock and one reference for its whole
/// lifetime; dereferences to the block's bytes. Dropping the guard
/// releases the content lock first and the reference second, so the slot
/// only becomes an eviction candidate once its bytes are quiescent.
pub struct BlockGuard<'a> {
    cache: &'a BufferCache,
    slot: usize,
    key: BlockKey,
    /// `Some` for the guard's entire life; taken in drop to control the
    /// release order.
    payload: Option<MutexGuard<'a, Box<[u8]>>>,
}

impl<'a> BlockGuard<'a> {
    /// Identity of the guarded block.
    #[must_use]
    pub fn key(&self) -> BlockKey {
        self.key
    }

    /// Device the block belongs to.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.key.device
    }

    /// Block number on its device.
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.key.block
    }

    /// Write the buffer's current contents back to the device.
    ///
    /// The guard keeps the content lock across the write, so the bytes on
    /// the device are exactly the bytes the caller sees.
    pub fn flush(&self) -> Result<()> {
        let dev = self.cache.device(self.key.device)?;
        dev.write_block(self.key.block, self)?;
        debug!(
            target: "minnow::block::cache",
            device = self.key.device.0,
            block = self.key.block.0,
            slot = self.slot,
            "flushed to device"
        );
        Ok(())
    }

    /// Keep the block resident after this guard is gone.
    ///
    /// The pin holds a reference but no content lock, so a pinned block
    /// stays in the cache while remaining fetchable by anyone. Useful for
    /// blocks that must survive until some later event, such as journal
    /// blocks awaiting commit.
    #[must_use]
    pub fn pin(&self) -> PinnedBlock<'a> {
        self.cache.retain_slot(self.slot, self.key);
        PinnedBlock {
            cache: self.cache,
            slot: self.slot,
            key: self.key,
        }
    }
}

impl Deref for BlockGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.payload
            .as_ref()
            .expect("payload lock held for the guard's lifetime")
    }
}

impl DerefMut for BlockGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.payload
            .as_mut()
            .expect("payload lock held for the guard's lifetime")
    }
}

impl fmt::Debug for BlockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockGuard")
            .field("device", &self.key.device)
            .field("block", &self.key.block)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        // Content lock goes first; the bucket lock inside release_slot is
        // never taken while a content lock is held.
        drop(self.payload.take());
        self.cache.release_slot(self.slot, self.key);
    }
}

/// Reference that keeps a block resident without locking its contents.
///
/// Created by [`BlockGuard::pin`]; dropped or [`unpin`](Self::unpin)ned
/// to restore eviction eligibility.
#[derive(Debug)]
pub struct PinnedBlock<'a> {
    cache: &'a BufferCache,
    slot: usize,
    key: BlockKey,
}

impl PinnedBlock<'_> {
    /// Identity of the pinned block.
    #[must_use]
    pub fn key(&self) -> BlockKey {
        self.key
    }

    /// Release the pin. Equivalent to dropping it; named for call sites
    /// where the release is the point.
    pub fn unpin(self) {
        drop(self);
    }
}

impl Drop for PinnedBlock<'_> {
    fn drop(&mut self) {
        self.cache.release_slot(self.slot, self.key);
    }
}
