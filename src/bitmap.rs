//! Volume allocation bitmap.
//!
//! One bit per allocation block, most significant bit first, stored on disk in
//! the sectors starting at `drVBMSt`. The in-memory copy is authoritative
//! between flushes.

use crate::disk::Disk;
use crate::error::{FsError, Result};
use hfs_types::SECTOR_SIZE;
use log::debug;

/// Allocation blocks tracked per bitmap sector.
pub const BITS_PER_SECTOR: u32 = SECTOR_SIZE as u32 * 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
    total_blocks: u32,
    free_blocks: u32,
    alloc_ptr: u32,
    dirty: bool,
}

#[inline]
fn mask(block: u32) -> u8 {
    1 << (7 - (block % 8))
}

impl Bitmap {
    /// A bitmap with every block free.
    pub fn new(total_blocks: u32) -> Self {
        let sectors = Self::sectors_for(total_blocks) as usize;
        Self {
            bits: vec![0u8; sectors * SECTOR_SIZE],
            total_blocks,
            free_blocks: total_blocks,
            alloc_ptr: 0,
            dirty: true,
        }
    }

    /// Sectors occupied by the bitmap of a volume with `total_blocks` blocks.
    pub fn sectors_for(total_blocks: u32) -> u32 {
        total_blocks.div_ceil(BITS_PER_SECTOR).max(1)
    }

    /// Read the bitmap of a mounted volume. The free count is recomputed from
    /// the bits rather than trusted from the MDB.
    pub fn load(disk: &Disk<'_>, start_sector: u32, total_blocks: u32, alloc_ptr: u32) -> Result<Self> {
        let sectors = Self::sectors_for(total_blocks);
        let mut bits = vec![0u8; sectors as usize * SECTOR_SIZE];
        for (i, chunk) in bits.chunks_mut(SECTOR_SIZE).enumerate() {
            disk.read_sector(start_sector + i as u32, chunk)?;
        }

        let mut bitmap = Self {
            bits,
            total_blocks,
            free_blocks: 0,
            alloc_ptr: if alloc_ptr < total_blocks { alloc_ptr } else { 0 },
            dirty: false,
        };
        bitmap.free_blocks = bitmap.count_free();
        Ok(bitmap)
    }

    /// Write every bitmap sector back through the cache.
    pub fn store(&mut self, disk: &Disk<'_>, start_sector: u32) -> Result<()> {
        for (i, chunk) in self.bits.chunks(SECTOR_SIZE).enumerate() {
            disk.write_sector(start_sector + i as u32, chunk)?;
        }
        self.dirty = false;
        Ok(())
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    pub fn free_blocks(&self) -> u32 {
        self.free_blocks
    }

    pub fn alloc_ptr(&self) -> u32 {
        self.alloc_ptr
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_used(&self, block: u32) -> bool {
        self.bits[(block / 8) as usize] & mask(block) != 0
    }

    fn set(&mut self, block: u32) {
        self.bits[(block / 8) as usize] |= mask(block);
    }

    fn clear(&mut self, block: u32) {
        self.bits[(block / 8) as usize] &= !mask(block);
    }

    /// Mark a run used regardless of the allocation pointer. For volume
    /// formatting.
    pub fn reserve(&mut self, start: u32, count: u32) -> Result<()> {
        self.check_range(start, count)?;
        for block in start..start + count {
            if !self.is_used(block) {
                self.set(block);
                self.free_blocks -= 1;
            }
        }
        self.dirty = true;
        Ok(())
    }

    fn check_range(&self, start: u32, count: u32) -> Result<()> {
        match start.checked_add(count) {
            Some(end) if end <= self.total_blocks => Ok(()),
            _ => Err(FsError::Param),
        }
    }

    /// First run of at least `min` free blocks within `from..to`.
    fn first_fit(&self, from: u32, to: u32, min: u32) -> Option<u32> {
        let mut run_start = from;
        let mut run_len = 0;
        for block in from..to {
            if self.is_used(block) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = block;
            }
            run_len += 1;
            if run_len >= min {
                return Some(run_start);
            }
        }
        None
    }

    /// Allocate a run of between `min` and `max` blocks, searching first-fit
    /// from `hint` (0 means the allocation pointer) and wrapping once to the
    /// start of the volume.
    pub fn allocate(&mut self, hint: u32, min: u32, max: u32) -> Result<(u32, u32)> {
        if min == 0 || min > max {
            return Err(FsError::Param);
        }
        if self.free_blocks < min {
            return Err(FsError::DiskFull);
        }

        let mut from = if hint == 0 { self.alloc_ptr } else { hint };
        if from >= self.total_blocks {
            from = 0;
        }

        let start = self
            .first_fit(from, self.total_blocks, min)
            .or_else(|| self.first_fit(0, self.total_blocks, min))
            .ok_or_else(|| {
                debug!("no run of {min} free blocks among {} free", self.free_blocks);
                FsError::DiskFull
            })?;

        let mut count = min;
        while count < max && start + count < self.total_blocks && !self.is_used(start + count) {
            count += 1;
        }

        for block in start..start + count {
            self.set(block);
        }
        self.free_blocks -= count;
        self.alloc_ptr = start + count;
        if self.alloc_ptr >= self.total_blocks {
            self.alloc_ptr = 0;
        }
        self.dirty = true;

        Ok((start, count))
    }

    /// Release a run. Blocks that were already free are left alone.
    pub fn free(&mut self, start: u32, count: u32) -> Result<()> {
        self.check_range(start, count)?;
        for block in start..start + count {
            if self.is_used(block) {
                self.clear(block);
                self.free_blocks += 1;
            }
        }
        if start < self.alloc_ptr {
            self.alloc_ptr = start;
        }
        self.dirty = true;
        Ok(())
    }

    pub fn count_free(&self) -> u32 {
        (0..self.total_blocks).filter(|&b| !self.is_used(b)).count() as u32
    }

    /// Verify `free_blocks == total_blocks - popcount(bitmap)`.
    pub fn check(&self) -> Result<()> {
        let free = self.count_free();
        if free != self.free_blocks {
            debug!(
                "bitmap free count {} disagrees with scan {}",
                self.free_blocks, free
            );
            return Err(FsError::Corrupt);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_msb_first() {
        let mut map = Bitmap::new(16);
        map.reserve(0, 1).unwrap();
        map.reserve(9, 1).unwrap();
        assert_eq!(map.bits[0], 0x80);
        assert_eq!(map.bits[1], 0x40);
    }

    #[test]
    fn allocate_takes_exactly_min_when_max_equals_min() {
        let mut map = Bitmap::new(100);
        let before = map.free_blocks();
        let (start, count) = map.allocate(0, 10, 10).unwrap();
        assert_eq!(count, 10);
        assert_eq!(map.free_blocks(), before - 10);
        assert!((start..start + count).all(|b| map.is_used(b)));
        assert_eq!(map.count_free(), 90);
        map.check().unwrap();
    }

    #[test]
    fn allocate_then_free_restores_bitmap() {
        let mut map = Bitmap::new(64);
        map.reserve(0, 5).unwrap();
        let snapshot = (map.bits.clone(), map.free_blocks());

        let (start, count) = map.allocate(0, 7, 7).unwrap();
        map.free(start, count).unwrap();
        assert_eq!((map.bits.clone(), map.free_blocks()), snapshot);
    }

    #[test]
    fn allocate_grows_run_towards_max() {
        let mut map = Bitmap::new(32);
        map.reserve(12, 1).unwrap();
        let (start, count) = map.allocate(0, 2, 100).unwrap();
        assert_eq!((start, count), (0, 12));
        assert_eq!(map.alloc_ptr(), 12);
    }

    #[test]
    fn allocate_wraps_to_start() {
        let mut map = Bitmap::new(32);
        map.reserve(20, 12).unwrap();
        let (start, _) = map.allocate(25, 4, 4).unwrap();
        assert_eq!(start, 0);
    }

    #[test]
    fn fragmented_volume_reports_disk_full() {
        let mut map = Bitmap::new(16);
        for b in (0..16).step_by(2) {
            map.reserve(b, 1).unwrap();
        }
        assert_eq!(map.free_blocks(), 8);
        assert_eq!(map.allocate(0, 2, 2), Err(FsError::DiskFull));
        assert_eq!(map.allocate(0, 9, 9), Err(FsError::DiskFull));
    }

    #[test]
    fn parameter_errors() {
        let mut map = Bitmap::new(16);
        assert_eq!(map.allocate(0, 0, 4), Err(FsError::Param));
        assert_eq!(map.allocate(0, 5, 4), Err(FsError::Param));
        assert_eq!(map.free(10, 10), Err(FsError::Param));
    }

    #[test]
    fn free_lowers_allocation_pointer() {
        let mut map = Bitmap::new(64);
        let (a, _) = map.allocate(0, 8, 8).unwrap();
        let _ = map.allocate(0, 8, 8).unwrap();
        assert_eq!(map.alloc_ptr(), 16);
        map.free(a, 8).unwrap();
        assert_eq!(map.alloc_ptr(), 0);
        // Freeing free blocks does not inflate the count.
        map.free(a, 8).unwrap();
        assert_eq!(map.free_blocks(), 56);
    }
}
