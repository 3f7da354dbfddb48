//! Block cache shared by every mounted volume.
//!
//! Buffers live in a fixed arena. A hash map from (volume, sector) to slot
//! index finds cached sectors, a free-index list hands out unused slots, and
//! when both run dry the least recently used unreferenced buffer is evicted,
//! written back first if dirty.
//!
//! The arena, map and free list sit behind the cache lock. Sector contents
//! have a lock of their own, and device reads and writes run with the cache
//! lock released: a slot being filled is published as `loading` and other
//! callers wait on a condition variable until it is ready. Nothing else is
//! locked while the cache lock is held.
//!
//! A slot goes back on the free list only when its reference count is zero.
//! Invalidating a volume detaches referenced slots (no owner, still pinned)
//! and the last guard to drop returns them.

use crate::device::{DeviceHandle, PlatformHooks};
use crate::error::{FsError, Result};
use hfs_types::SECTOR_SIZE;
use log::trace;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// Cache-wide identity of a mounted volume: its volume reference number.
pub type VolumeId = i16;

type SectorData = Arc<Mutex<Box<[u8]>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Owner {
    volume: VolumeId,
    device: DeviceHandle,
    sector: u32,
}

impl Owner {
    fn offset(&self) -> u64 {
        self.sector as u64 * SECTOR_SIZE as u64
    }
}

struct CacheBuffer {
    owner: Option<Owner>,
    data: SectorData,
    ref_count: u32,
    dirty: bool,
    loading: bool,
    last_use: u64,
}

/// Running totals kept by the cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writes: u64,
}

struct CacheInner {
    buffers: Vec<CacheBuffer>,
    index: HashMap<(VolumeId, u32), usize>,
    free: Vec<usize>,
    clock: u64,
    stats: CacheStats,
}

pub struct BlockCache {
    inner: Mutex<CacheInner>,
    loaded: Condvar,
}

/// A referenced cache buffer. Dropping it releases the reference; use
/// [`BufferGuard::release`] to also mark the buffer dirty.
pub struct BufferGuard<'a> {
    cache: &'a BlockCache,
    slot: usize,
    data: SectorData,
    dirty: bool,
}

impl BufferGuard<'_> {
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.data.lock()[offset..offset + out.len()]);
    }

    /// Overwrite part of the sector. The buffer becomes dirty on release.
    pub fn write(&mut self, offset: usize, src: &[u8]) {
        self.data.lock()[offset..offset + src.len()].copy_from_slice(src);
        self.dirty = true;
    }

    pub fn release(mut self, dirty: bool) {
        self.dirty |= dirty;
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        self.cache.inner.lock().release(self.slot, self.dirty);
    }
}

impl CacheInner {
    fn touch(&mut self, slot: usize) {
        self.clock += 1;
        self.buffers[slot].last_use = self.clock;
    }

    /// Drop one reference to `slot`.
    fn release(&mut self, slot: usize, dirty: bool) {
        let buffer = &mut self.buffers[slot];
        buffer.ref_count = buffer.ref_count.saturating_sub(1);
        if buffer.owner.is_some() {
            buffer.dirty |= dirty;
        } else if buffer.ref_count == 0 {
            // Detached while referenced.
            buffer.dirty = false;
            self.free.push(slot);
        }
    }
}

/// Write a dirty buffer back to its device. The buffer stays pinned and the
/// cache lock is released for the device write. Does nothing if the slot no
/// longer belongs to `expected` or is clean by now.
fn write_back(
    inner: &mut MutexGuard<'_, CacheInner>,
    hooks: &dyn PlatformHooks,
    slot: usize,
    expected: Owner,
) -> Result<()> {
    let data = {
        let buffer = &mut inner.buffers[slot];
        if buffer.owner != Some(expected) || !buffer.dirty {
            return Ok(());
        }
        buffer.ref_count += 1;
        // Writers that touch the buffer meanwhile mark it dirty again on release.
        buffer.dirty = false;
        Arc::clone(&buffer.data)
    };

    let result = MutexGuard::unlocked(inner, || {
        let data = data.lock();
        hooks.write(expected.device, expected.offset(), &data)
    });

    if result.is_ok() {
        inner.stats.writes += 1;
    }
    inner.release(slot, result.is_err());
    result
}

/// Find a slot for a new sector, evicting if the free list is empty. The
/// lock may be released while a dirty victim is written back.
fn claim_slot(inner: &mut MutexGuard<'_, CacheInner>, hooks: &dyn PlatformHooks) -> Result<usize> {
    loop {
        if let Some(slot) = inner.free.pop() {
            return Ok(slot);
        }

        let victim = inner
            .buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| b.ref_count == 0 && b.owner.is_some())
            .min_by_key(|(_, b)| b.last_use)
            .map(|(slot, _)| slot)
            .ok_or(FsError::OutOfMemory)?;

        let buffer = &inner.buffers[victim];
        if let (Some(owner), true) = (buffer.owner, buffer.dirty) {
            write_back(inner, hooks, victim, owner)?;
            continue;
        }

        if let Some(owner) = inner.buffers[victim].owner.take() {
            trace!("evicting sector {} of volume {}", owner.sector, owner.volume);
            inner.index.remove(&(owner.volume, owner.sector));
        }
        inner.stats.evictions += 1;
        return Ok(victim);
    }
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        let buffers = (0..capacity)
            .map(|_| CacheBuffer {
                owner: None,
                data: Arc::new(Mutex::new(vec![0u8; SECTOR_SIZE].into_boxed_slice())),
                ref_count: 0,
                dirty: false,
                loading: false,
                last_use: 0,
            })
            .collect();
        Self {
            inner: Mutex::new(CacheInner {
                buffers,
                index: HashMap::with_capacity(capacity),
                free: (0..capacity).rev().collect(),
                clock: 0,
                stats: CacheStats::default(),
            }),
            loaded: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Reference the buffer holding `sector`, reading it from the device on a
    /// miss.
    pub fn get(
        &self,
        hooks: &dyn PlatformHooks,
        volume: VolumeId,
        device: DeviceHandle,
        sector: u32,
    ) -> Result<BufferGuard<'_>> {
        self.pin(hooks, volume, device, sector, true)
    }

    /// Like [`BlockCache::get`], but a miss yields a zeroed buffer instead of
    /// reading the device. For sectors about to be overwritten in full.
    pub fn get_blank(
        &self,
        hooks: &dyn PlatformHooks,
        volume: VolumeId,
        device: DeviceHandle,
        sector: u32,
    ) -> Result<BufferGuard<'_>> {
        self.pin(hooks, volume, device, sector, false)
    }

    fn guard(&self, slot: usize, data: SectorData) -> BufferGuard<'_> {
        BufferGuard {
            cache: self,
            slot,
            data,
            dirty: false,
        }
    }

    fn pin(
        &self,
        hooks: &dyn PlatformHooks,
        volume: VolumeId,
        device: DeviceHandle,
        sector: u32,
        load: bool,
    ) -> Result<BufferGuard<'_>> {
        let key = (volume, sector);
        let mut inner = self.inner.lock();

        let slot = loop {
            if let Some(&slot) = inner.index.get(&key) {
                if inner.buffers[slot].loading {
                    self.loaded.wait(&mut inner);
                    continue;
                }
                inner.stats.hits += 1;
                inner.buffers[slot].ref_count += 1;
                inner.touch(slot);
                let data = Arc::clone(&inner.buffers[slot].data);
                return Ok(self.guard(slot, data));
            }

            let slot = claim_slot(&mut inner, hooks)?;
            // Another caller may have cached the sector while the lock was
            // released for a write-back.
            if inner.index.contains_key(&key) {
                inner.free.push(slot);
                continue;
            }
            break slot;
        };

        inner.stats.misses += 1;
        let owner = Owner {
            volume,
            device,
            sector,
        };
        let buffer = &mut inner.buffers[slot];
        buffer.owner = Some(owner);
        buffer.ref_count = 1;
        buffer.dirty = false;
        buffer.loading = true;
        let data = Arc::clone(&buffer.data);
        inner.index.insert(key, slot);
        inner.touch(slot);

        let filled = MutexGuard::unlocked(&mut inner, || {
            let mut contents = data.lock();
            if load {
                hooks.read(device, owner.offset(), &mut contents)
            } else {
                contents.fill(0);
                Ok(())
            }
        });

        inner.buffers[slot].loading = false;
        self.loaded.notify_all();
        if let Err(err) = filled {
            if inner.index.get(&key) == Some(&slot) {
                inner.index.remove(&key);
            }
            inner.buffers[slot].owner = None;
            inner.release(slot, false);
            return Err(err);
        }

        Ok(self.guard(slot, data))
    }

    /// Copy a whole sector out of the cache.
    pub fn read_sector(
        &self,
        hooks: &dyn PlatformHooks,
        volume: VolumeId,
        device: DeviceHandle,
        sector: u32,
        out: &mut [u8],
    ) -> Result<()> {
        let buffer = self.get(hooks, volume, device, sector)?;
        buffer.read(0, out);
        Ok(())
    }

    /// Replace a whole sector in the cache, leaving it dirty.
    pub fn write_sector(
        &self,
        hooks: &dyn PlatformHooks,
        volume: VolumeId,
        device: DeviceHandle,
        sector: u32,
        src: &[u8],
    ) -> Result<()> {
        let mut buffer = self.get_blank(hooks, volume, device, sector)?;
        buffer.write(0, src);
        buffer.release(true);
        Ok(())
    }

    /// Write back every dirty buffer belonging to `volume`.
    pub fn flush_volume(&self, hooks: &dyn PlatformHooks, volume: VolumeId) -> Result<()> {
        self.flush_matching(hooks, |owner| owner.volume == volume)
    }

    pub fn flush_all(&self, hooks: &dyn PlatformHooks) -> Result<()> {
        self.flush_matching(hooks, |_| true)
    }

    fn flush_matching(
        &self,
        hooks: &dyn PlatformHooks,
        selected: impl Fn(&Owner) -> bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let dirty: Vec<(usize, Owner)> = inner
            .buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| b.dirty)
            .filter_map(|(slot, b)| b.owner.filter(&selected).map(|owner| (slot, owner)))
            .collect();
        for (slot, owner) in dirty {
            write_back(&mut inner, hooks, slot, owner)?;
        }
        Ok(())
    }

    /// Drop every buffer of `volume` without writing it. Referenced buffers
    /// are detached and return to the free list when their last guard drops.
    pub fn invalidate(&self, volume: VolumeId) {
        let mut inner = self.inner.lock();
        let CacheInner {
            buffers,
            index,
            free,
            ..
        } = &mut *inner;
        for (slot, buffer) in buffers.iter_mut().enumerate() {
            let Some(owner) = buffer.owner.filter(|o| o.volume == volume) else {
                continue;
            };
            index.remove(&(volume, owner.sector));
            buffer.owner = None;
            buffer.dirty = false;
            if buffer.ref_count == 0 {
                free.push(slot);
            }
        }
    }

    /// Number of dirty buffers held for `volume`.
    pub fn dirty_count(&self, volume: VolumeId) -> usize {
        self.inner
            .lock()
            .buffers
            .iter()
            .filter(|b| b.dirty && b.owner.is_some_and(|o| o.volume == volume))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DiskImages;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn disk(sectors: usize) -> (DiskImages, DeviceHandle) {
        let disks = DiskImages::new();
        let mut image = vec![0u8; sectors * SECTOR_SIZE];
        for (i, chunk) in image.chunks_mut(SECTOR_SIZE).enumerate() {
            chunk[0] = i as u8;
        }
        disks.insert_memory(1, image);
        let dev = disks.open(1).unwrap();
        (disks, dev)
    }

    #[test]
    fn get_reads_through_and_counts_hits() {
        let (disks, dev) = disk(8);
        let cache = BlockCache::new(4);

        let mut out = [0u8; SECTOR_SIZE];
        cache.read_sector(&disks, -1, dev, 5, &mut out).unwrap();
        assert_eq!(out[0], 5);
        cache.read_sector(&disks, -1, dev, 5, &mut out).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn dirty_buffers_reach_disk_only_on_flush() {
        let (disks, dev) = disk(8);
        let cache = BlockCache::new(4);

        let mut buf = cache.get(&disks, -1, dev, 2).unwrap();
        buf.write(10, b"xyz");
        buf.release(true);
        assert_eq!(cache.dirty_count(-1), 1);

        let image = disks.snapshot(1).unwrap();
        assert_eq!(&image[1024 + 10..1024 + 13], &[0, 0, 0]);

        cache.flush_volume(&disks, -1).unwrap();
        let image = disks.snapshot(1).unwrap();
        assert_eq!(&image[1024 + 10..1024 + 13], b"xyz");
        assert_eq!(cache.dirty_count(-1), 0);
    }

    #[test]
    fn lru_eviction_writes_back_dirty_victim() {
        let (disks, dev) = disk(16);
        let cache = BlockCache::new(2);

        cache.write_sector(&disks, -1, dev, 1, &[0xAA; SECTOR_SIZE]).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        cache.read_sector(&disks, -1, dev, 2, &mut out).unwrap();
        // Sector 1 is least recently used and gets evicted.
        cache.read_sector(&disks, -1, dev, 3, &mut out).unwrap();

        assert_eq!(cache.stats().evictions, 1);
        let image = disks.snapshot(1).unwrap();
        assert_eq!(image[SECTOR_SIZE], 0xAA);
    }

    #[test]
    fn pinned_buffers_are_never_evicted() {
        let (disks, dev) = disk(8);
        let cache = BlockCache::new(2);

        let _a = cache.get(&disks, -1, dev, 0).unwrap();
        let _b = cache.get(&disks, -1, dev, 1).unwrap();
        assert!(matches!(
            cache.get(&disks, -1, dev, 2),
            Err(FsError::OutOfMemory)
        ));
    }

    #[test]
    fn invalidate_discards_volume_buffers() {
        let (disks, dev) = disk(8);
        let cache = BlockCache::new(4);

        cache.write_sector(&disks, -1, dev, 4, &[7; SECTOR_SIZE]).unwrap();
        cache.invalidate(-1);
        assert_eq!(cache.dirty_count(-1), 0);

        let mut out = [0u8; SECTOR_SIZE];
        cache.read_sector(&disks, -1, dev, 4, &mut out).unwrap();
        assert_eq!(out[0], 4);
    }

    #[test]
    fn invalidated_buffer_is_not_reused_while_referenced() {
        let (disks, dev) = disk(8);
        let cache = BlockCache::new(1);

        let mut stale = cache.get(&disks, -1, dev, 0).unwrap();
        cache.invalidate(-1);
        assert!(matches!(
            cache.get(&disks, -2, dev, 5),
            Err(FsError::OutOfMemory)
        ));

        stale.write(0, &[0xEE]);
        drop(stale);

        let fresh = cache.get(&disks, -2, dev, 5).unwrap();
        let mut byte = [0u8; 1];
        fresh.read(0, &mut byte);
        assert_eq!(byte[0], 5);
        drop(fresh);

        cache.flush_all(&disks).unwrap();
        let image = disks.snapshot(1).unwrap();
        assert_eq!(image[0], 0);
        assert_eq!(image[5 * SECTOR_SIZE], 5);
        assert_eq!(cache.dirty_count(-2), 0);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn detached_buffer_does_not_disturb_new_owner() {
        let (disks, dev) = disk(8);
        let cache = BlockCache::new(2);

        let mut stale = cache.get(&disks, -1, dev, 0).unwrap();
        cache.invalidate(-1);
        let fresh = cache.get(&disks, -2, dev, 5).unwrap();
        stale.write(0, &[0xEE]);
        drop(stale);

        // The new owner is still pinned and cannot be evicted.
        let _other = cache.get(&disks, -2, dev, 6).unwrap();
        assert!(matches!(
            cache.get(&disks, -2, dev, 7),
            Err(FsError::OutOfMemory)
        ));
        drop(fresh);

        cache.flush_volume(&disks, -2).unwrap();
        let image = disks.snapshot(1).unwrap();
        assert_eq!(image[5 * SECTOR_SIZE], 5);
        assert_eq!(cache.dirty_count(-2), 0);
    }

    /// Forwards to an image set and counts device transfers made while the
    /// cache lock is held.
    struct LockWatch<'a> {
        disks: &'a DiskImages,
        cache: &'a BlockCache,
        under_lock: AtomicUsize,
    }

    impl LockWatch<'_> {
        fn note(&self) {
            if self.cache.inner.is_locked() {
                self.under_lock.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    impl PlatformHooks for LockWatch<'_> {
        fn open(&self, drive: u16) -> Result<DeviceHandle> {
            self.disks.open(drive)
        }

        fn close(&self, device: DeviceHandle) -> Result<()> {
            self.disks.close(device)
        }

        fn read(&self, device: DeviceHandle, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.note();
            self.disks.read(device, offset, buf)
        }

        fn write(&self, device: DeviceHandle, offset: u64, buf: &[u8]) -> Result<()> {
            self.note();
            self.disks.write(device, offset, buf)
        }

        fn flush(&self, device: DeviceHandle) -> Result<()> {
            self.disks.flush(device)
        }

        fn eject(&self, device: DeviceHandle) -> Result<()> {
            self.disks.eject(device)
        }

        fn size(&self, device: DeviceHandle) -> Result<u64> {
            self.disks.size(device)
        }
    }

    #[test]
    fn device_transfers_run_outside_the_cache_lock() {
        let (disks, dev) = disk(8);
        let cache = BlockCache::new(2);
        let hooks = LockWatch {
            disks: &disks,
            cache: &cache,
            under_lock: AtomicUsize::new(0),
        };

        cache.write_sector(&hooks, -1, dev, 1, &[0xAA; SECTOR_SIZE]).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        cache.read_sector(&hooks, -1, dev, 2, &mut out).unwrap();
        // Evicts dirty sector 1, then reads sector 3.
        cache.read_sector(&hooks, -1, dev, 3, &mut out).unwrap();
        cache.write_sector(&hooks, -1, dev, 4, &[0xBB; SECTOR_SIZE]).unwrap();
        cache.flush_volume(&hooks, -1).unwrap();

        assert_eq!(out[0], 3);
        assert_eq!(hooks.under_lock.load(Ordering::Relaxed), 0);
        let image = disks.snapshot(1).unwrap();
        assert_eq!(image[SECTOR_SIZE], 0xAA);
        assert_eq!(image[4 * SECTOR_SIZE], 0xBB);
        assert_eq!(cache.stats().writes, 2);
    }
}
