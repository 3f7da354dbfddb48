//! Extent manager: maps fork-relative allocation blocks to volume blocks and
//! grows or shrinks a fork's allocation.
//!
//! A fork keeps its first three extents inline. Further extents live in the
//! extents overflow B-tree, three per record, keyed by the fork's file ID,
//! fork type and the fork-relative block the record starts at. The overflow
//! store is reached through the [`Overflow`] trait.

use crate::bitmap::Bitmap;
use crate::error::{FsError, Result};
use hfs_types::{CatalogNodeId, ExtentDescriptor, ExtentRecord, ForkType, SECTOR_SIZE};
use log::debug;

/// Placement of the allocation blocks on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Allocation block size in bytes.
    pub block_size: u32,
    /// Sector holding allocation block 0.
    pub alloc_start: u32,
    pub total_blocks: u32,
    /// Volume default clump size in bytes.
    pub clump_size: u32,
}

impl Geometry {
    pub fn sectors_per_block(&self) -> u32 {
        self.block_size / SECTOR_SIZE as u32
    }

    /// Device sector containing `byte` of allocation block `block`.
    pub fn sector_of(&self, block: u32, byte: u32) -> u32 {
        self.alloc_start + block * self.sectors_per_block() + byte / SECTOR_SIZE as u32
    }

    /// Allocation blocks needed to hold `bytes`.
    pub fn blocks_for(&self, bytes: u64) -> u32 {
        bytes.div_ceil(self.block_size as u64) as u32
    }
}

/// Allocation state of one fork, as carried by an FCB or a B-tree file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkExtents {
    pub file_id: CatalogNodeId,
    pub fork_type: ForkType,
    pub extents: ExtentRecord,
    /// Allocated bytes, always a whole number of allocation blocks.
    pub physical_eof: u32,
    /// Growth granularity in bytes. Zero means the volume default.
    pub clump_size: u32,
}

impl ForkExtents {
    pub fn new(file_id: CatalogNodeId, fork_type: ForkType) -> Self {
        Self {
            file_id,
            fork_type,
            extents: ExtentRecord::default(),
            physical_eof: 0,
            clump_size: 0,
        }
    }
}

/// One extents overflow record: starting fork block and three extents.
pub type OverflowRecord = (u16, ExtentRecord);

/// Storage for extents beyond the third.
pub trait Overflow {
    /// Overflow records of a fork, in fork block order.
    fn records(&mut self, file_id: CatalogNodeId, fork: ForkType) -> Result<Vec<OverflowRecord>>;

    /// Replace every overflow record of a fork. `bitmap` is available for
    /// growing the overflow store itself.
    fn set_records(
        &mut self,
        file_id: CatalogNodeId,
        fork: ForkType,
        records: &[OverflowRecord],
        bitmap: &mut Bitmap,
    ) -> Result<()>;
}

/// Overflow store for forks that must fit in their three inline extents,
/// such as the B-tree files themselves.
pub struct NoOverflow;

impl Overflow for NoOverflow {
    fn records(&mut self, _: CatalogNodeId, _: ForkType) -> Result<Vec<OverflowRecord>> {
        Ok(Vec::new())
    }

    fn set_records(
        &mut self,
        _: CatalogNodeId,
        _: ForkType,
        records: &[OverflowRecord],
        _: &mut Bitmap,
    ) -> Result<()> {
        if records.is_empty() {
            Ok(())
        } else {
            Err(FsError::ExtentRange)
        }
    }
}

/// Every extent of a fork in order, inline ones first.
pub fn all_extents(fork: &ForkExtents, overflow: &mut dyn Overflow) -> Result<Vec<ExtentDescriptor>> {
    let mut list: Vec<ExtentDescriptor> = fork
        .extents
        .iter()
        .copied()
        .take_while(|e| !e.is_empty())
        .collect();
    if list.len() == fork.extents.len() {
        for (_, record) in overflow.records(fork.file_id, fork.fork_type)? {
            list.extend(record.iter().copied().take_while(|e| !e.is_empty()));
        }
    }
    Ok(list)
}

fn allocated_blocks(list: &[ExtentDescriptor]) -> u32 {
    list.iter().map(|e| e.block_count as u32).sum()
}

/// Split an extent list back into the inline record and overflow records.
fn split_extents(list: &[ExtentDescriptor]) -> (ExtentRecord, Vec<OverflowRecord>) {
    let mut inline = ExtentRecord::default();
    for (slot, extent) in inline.iter_mut().zip(list) {
        *slot = *extent;
    }

    let mut records = Vec::new();
    if list.len() > inline.len() {
        let mut fabn = allocated_blocks(&list[..inline.len()]);
        for chunk in list[inline.len()..].chunks(3) {
            let mut record = ExtentRecord::default();
            for (slot, extent) in record.iter_mut().zip(chunk) {
                *slot = *extent;
            }
            records.push((fabn as u16, record));
            fabn += allocated_blocks(chunk);
        }
    }
    (inline, records)
}

fn store_extents(
    fork: &mut ForkExtents,
    list: &[ExtentDescriptor],
    overflow: &mut dyn Overflow,
    bitmap: &mut Bitmap,
) -> Result<()> {
    let (inline, records) = split_extents(list);
    let existing = if fork.extents.iter().all(|e| !e.is_empty()) {
        overflow.records(fork.file_id, fork.fork_type)?
    } else {
        Vec::new()
    };
    if existing != records {
        overflow.set_records(fork.file_id, fork.fork_type, &records, bitmap)?;
    }
    fork.extents = inline;
    Ok(())
}

/// Volume block holding fork block `file_block`, and how many blocks of the
/// same extent follow it (including itself).
pub fn map(fork: &ForkExtents, file_block: u32, overflow: &mut dyn Overflow) -> Result<(u32, u32)> {
    let mut fabn = 0u32;
    for extent in fork.extents.iter().take_while(|e| !e.is_empty()) {
        let count = extent.block_count as u32;
        if file_block < fabn + count {
            let skip = file_block - fabn;
            return Ok((extent.start_block as u32 + skip, count - skip));
        }
        fabn += count;
    }

    if fork.extents.iter().all(|e| !e.is_empty()) {
        for (start, record) in overflow.records(fork.file_id, fork.fork_type)? {
            let mut fabn = start as u32;
            for extent in record.iter().take_while(|e| !e.is_empty()) {
                let count = extent.block_count as u32;
                if file_block < fabn + count {
                    let skip = file_block - fabn;
                    return Ok((extent.start_block as u32 + skip, count - skip));
                }
                fabn += count;
            }
        }
    }

    Err(FsError::ExtentRange)
}

fn append_run(list: &mut Vec<ExtentDescriptor>, start: u32, count: u32) {
    if let Some(last) = list.last_mut() {
        if last.end() == start && last.block_count as u32 + count <= u16::MAX as u32 {
            last.block_count += count as u16;
            return;
        }
    }
    list.push(ExtentDescriptor::new(start as u16, count as u16));
}

/// Grow a fork so it can hold `new_size` bytes. Returns the number of
/// allocation blocks added.
pub fn extend(
    geometry: &Geometry,
    fork: &mut ForkExtents,
    new_size: u64,
    bitmap: &mut Bitmap,
    overflow: &mut dyn Overflow,
) -> Result<u32> {
    let mut list = all_extents(fork, overflow)?;
    let current = allocated_blocks(&list);
    let needed = geometry.blocks_for(new_size);
    if needed <= current {
        return Ok(0);
    }

    let need = needed - current;
    let clump = if fork.clump_size > 0 {
        fork.clump_size
    } else {
        geometry.clump_size
    };
    let clump_blocks = geometry.blocks_for(clump as u64).max(1);
    let want = need.div_ceil(clump_blocks) * clump_blocks;
    let hint = list.last().map_or(0, |e| e.end());

    // A whole clump right after the last extent, else the exact need anywhere.
    let first = if list.is_empty() {
        bitmap.allocate(0, want, want)
    } else if hint + want <= bitmap.total_blocks()
        && (hint..hint + want).all(|block| !bitmap.is_used(block))
    {
        bitmap.allocate(hint, want, want)
    } else {
        Err(FsError::DiskFull)
    };

    let mut runs: Vec<(u32, u32)> = Vec::new();
    match first.or_else(|_| bitmap.allocate(0, need, need)) {
        Ok(run) => runs.push(run),
        Err(FsError::DiskFull) if bitmap.free_blocks() >= need => {
            // Nothing contiguous is left; gather the need in pieces.
            let mut remaining = need;
            while remaining > 0 {
                match bitmap.allocate(0, 1, remaining) {
                    Ok((start, count)) => {
                        runs.push((start, count));
                        remaining -= count;
                    }
                    Err(err) => {
                        release_runs(bitmap, &runs);
                        return Err(err);
                    }
                }
            }
        }
        Err(err) => return Err(err),
    }

    let added: u32 = runs.iter().map(|(_, count)| count).sum();
    for &(start, count) in &runs {
        append_run(&mut list, start, count);
    }

    if let Err(err) = store_extents(fork, &list, overflow, bitmap) {
        debug!(
            "could not record {} new extents for file {}: {err}",
            runs.len(),
            fork.file_id
        );
        release_runs(bitmap, &runs);
        return Err(err);
    }

    fork.physical_eof = (current + added) * geometry.block_size;
    Ok(added)
}

fn release_runs(bitmap: &mut Bitmap, runs: &[(u32, u32)]) {
    for &(start, count) in runs {
        let _ = bitmap.free(start, count);
    }
}

/// Shrink a fork's allocation to the blocks needed for `new_size` bytes,
/// freeing from the last extent backwards.
pub fn truncate(
    geometry: &Geometry,
    fork: &mut ForkExtents,
    new_size: u64,
    bitmap: &mut Bitmap,
    overflow: &mut dyn Overflow,
) -> Result<()> {
    let mut list = all_extents(fork, overflow)?;
    let total = allocated_blocks(&list);
    let needed = geometry.blocks_for(new_size);
    if needed >= total {
        return Ok(());
    }

    let mut to_free = total - needed;
    while to_free > 0 {
        let Some(last) = list.last_mut() else {
            break;
        };
        let count = last.block_count as u32;
        if count <= to_free {
            bitmap.free(last.start_block as u32, count)?;
            to_free -= count;
            list.pop();
        } else {
            bitmap.free(last.end() - to_free, to_free)?;
            last.block_count -= to_free as u16;
            to_free = 0;
        }
    }

    store_extents(fork, &list, overflow, bitmap)?;
    fork.physical_eof = needed * geometry.block_size;
    Ok(())
}
