//! B-tree files living inside a volume: node storage backed by a fork, and
//! the extents overflow file seen as an [`Overflow`] store.

use crate::bitmap::Bitmap;
use crate::btree::{BTree, NodeStore};
use crate::disk::Disk;
use crate::error::{FsError, Result};
use crate::extents::{self, ForkExtents, Geometry, NoOverflow, Overflow, OverflowRecord};
use deku::prelude::*;
use hfs_types::{CatalogNodeId, ExtentDataRecord, ExtentKey, ForkType, NODE_SIZE};
use std::cmp::Ordering;

/// Nodes of a B-tree file, addressed through the file's inline extents.
pub struct TreeStore<'a> {
    disk: Disk<'a>,
    geometry: Geometry,
    fork: &'a mut ForkExtents,
    /// Needed only to grow the file. Lookups pass `None`.
    bitmap: Option<&'a mut Bitmap>,
}

impl<'a> TreeStore<'a> {
    pub fn new(
        disk: Disk<'a>,
        geometry: Geometry,
        fork: &'a mut ForkExtents,
        bitmap: Option<&'a mut Bitmap>,
    ) -> Self {
        Self {
            disk,
            geometry,
            fork,
            bitmap,
        }
    }

    fn sector_of(&self, node: u32) -> Result<u32> {
        let byte = node as u64 * NODE_SIZE as u64;
        if byte >= self.fork.physical_eof as u64 {
            return Err(FsError::Corrupt);
        }
        let block_size = self.geometry.block_size as u64;
        let (block, _run) = extents::map(self.fork, (byte / block_size) as u32, &mut NoOverflow)?;
        Ok(self.geometry.sector_of(block, (byte % block_size) as u32))
    }
}

impl NodeStore for TreeStore<'_> {
    fn read_node(&mut self, node: u32, buf: &mut [u8]) -> Result<()> {
        let sector = self.sector_of(node)?;
        self.disk.read_sector(sector, buf)
    }

    fn write_node(&mut self, node: u32, buf: &[u8]) -> Result<()> {
        let sector = self.sector_of(node)?;
        self.disk.write_sector(sector, buf)
    }

    fn grow(&mut self, nodes: u32) -> Result<u32> {
        let bitmap = self.bitmap.as_deref_mut().ok_or(FsError::WriteProtected)?;
        extents::extend(
            &self.geometry,
            self.fork,
            nodes as u64 * NODE_SIZE as u64,
            bitmap,
            &mut NoOverflow,
        )?;
        Ok(self.fork.physical_eof / NODE_SIZE as u32)
    }
}

/// Extent key order: file ID, then fork type, then starting fork block.
pub fn compare_extent_keys(a: &[u8], b: &[u8]) -> Ordering {
    let parts = |key: &[u8]| {
        let fork = key.first().copied().unwrap_or(0);
        let file = key
            .get(1..5)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_be_bytes)
            .unwrap_or(0);
        let start = key
            .get(5..7)
            .and_then(|b| b.try_into().ok())
            .map(u16::from_be_bytes)
            .unwrap_or(0);
        (file, fork, start)
    };
    parts(a).cmp(&parts(b))
}

fn extent_key(file_id: CatalogNodeId, fork_type: ForkType, start_block: u16) -> Result<Vec<u8>> {
    let key = ExtentKey {
        fork_type,
        file_id,
        start_block,
    };
    Ok(key.to_bytes()?)
}

/// Overflow extents kept in the volume's extents B-tree.
pub struct ExtentsOverflow<'a> {
    disk: Disk<'a>,
    geometry: Geometry,
    tree: &'a mut BTree,
    file: &'a mut ForkExtents,
}

impl<'a> ExtentsOverflow<'a> {
    pub fn new(
        disk: Disk<'a>,
        geometry: Geometry,
        tree: &'a mut BTree,
        file: &'a mut ForkExtents,
    ) -> Self {
        Self {
            disk,
            geometry,
            tree,
            file,
        }
    }
}

impl Overflow for ExtentsOverflow<'_> {
    fn records(&mut self, file_id: CatalogNodeId, fork: ForkType) -> Result<Vec<OverflowRecord>> {
        let mut store = TreeStore::new(self.disk, self.geometry, self.file, None);
        let mut raw = Vec::new();
        self.tree
            .scan_from(&mut store, &extent_key(file_id, fork, 0)?, |key, data| {
                match ExtentKey::from_bytes((key, 0)) {
                    Ok((_, k)) if k.file_id == file_id && k.fork_type == fork => {
                        raw.push((k.start_block, data.to_vec()));
                        true
                    }
                    _ => false,
                }
            })?;

        raw.into_iter()
            .map(|(start, data)| {
                let (_, record) = ExtentDataRecord::from_bytes((&data, 0))?;
                Ok((start, record.extents))
            })
            .collect()
    }

    /// Rewrite a fork's overflow records. New start keys go in first, so a
    /// tree that cannot grow fails before any existing record is touched;
    /// those inserts are undone on failure. Changed records are then
    /// replaced in place and stale ones deleted, neither of which needs new
    /// nodes.
    fn set_records(
        &mut self,
        file_id: CatalogNodeId,
        fork: ForkType,
        records: &[OverflowRecord],
        bitmap: &mut Bitmap,
    ) -> Result<()> {
        let existing = self.records(file_id, fork)?;
        let known = |start: u16| existing.iter().find(|(s, _)| *s == start).map(|(_, e)| e);
        let mut store = TreeStore::new(self.disk, self.geometry, self.file, Some(bitmap));

        let mut inserted: Vec<Vec<u8>> = Vec::new();
        for (start, extents) in records.iter().filter(|(start, _)| known(*start).is_none()) {
            let key = extent_key(file_id, fork, *start)?;
            let data = ExtentDataRecord { extents: *extents }.to_bytes()?;
            if let Err(err) = self.tree.insert(&mut store, &key, &data) {
                for key in &inserted {
                    let _ = self.tree.delete(&mut store, key);
                }
                return Err(err);
            }
            inserted.push(key);
        }

        for (start, extents) in records {
            if known(*start).is_some_and(|old| old != extents) {
                let data = ExtentDataRecord { extents: *extents }.to_bytes()?;
                self.tree
                    .replace(&mut store, &extent_key(file_id, fork, *start)?, &data)?;
            }
        }

        for (start, _) in &existing {
            if records.iter().all(|(s, _)| s != start) {
                self.tree
                    .delete(&mut store, &extent_key(file_id, fork, *start)?)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::device::{DiskImages, PlatformHooks};
    use hfs_types::{EXTENT_KEY_LEN, EXTENTS_FILE_ID, ExtentDescriptor, SECTOR_SIZE};

    const BLOCKS: u32 = 16;

    fn record(start: u16, first_block: u16) -> OverflowRecord {
        (
            start,
            [
                ExtentDescriptor::new(first_block, 1),
                ExtentDescriptor::new(first_block + 2, 1),
                ExtentDescriptor::new(first_block + 4, 1),
            ],
        )
    }

    fn geometry() -> Geometry {
        Geometry {
            block_size: 512,
            alloc_start: 0,
            total_blocks: BLOCKS,
            clump_size: 512,
        }
    }

    #[test]
    fn rewrite_inserts_replaces_and_drops_records() {
        let images = DiskImages::new();
        images.insert_memory(1, vec![0u8; BLOCKS as usize * SECTOR_SIZE]);
        let device = images.open(1).unwrap();
        let cache = BlockCache::new(32);
        let disk = Disk::new(&images, &cache, -1, device);
        let geometry = geometry();
        let mut bitmap = Bitmap::new(BLOCKS);
        let mut file = ForkExtents::new(EXTENTS_FILE_ID, ForkType::Data);
        extents::extend(&geometry, &mut file, NODE_SIZE as u64, &mut bitmap, &mut NoOverflow).unwrap();
        let mut tree = BTree::create(
            &mut TreeStore::new(disk, geometry, &mut file, None),
            EXTENT_KEY_LEN as u16,
            1,
            compare_extent_keys,
        )
        .unwrap();

        let mut overflow = ExtentsOverflow::new(disk, geometry, &mut tree, &mut file);
        let first = vec![record(3, 100), record(6, 200), record(9, 300)];
        overflow
            .set_records(20, ForkType::Data, &first, &mut bitmap)
            .unwrap();
        assert_eq!(overflow.records(20, ForkType::Data).unwrap(), first);

        let second = vec![record(3, 100), record(6, 250)];
        overflow
            .set_records(20, ForkType::Data, &second, &mut bitmap)
            .unwrap();
        assert_eq!(overflow.records(20, ForkType::Data).unwrap(), second);
        assert!(overflow.records(21, ForkType::Data).unwrap().is_empty());
    }

    #[test]
    fn failed_rewrite_keeps_existing_records() {
        let images = DiskImages::new();
        images.insert_memory(1, vec![0u8; BLOCKS as usize * SECTOR_SIZE]);
        let device = images.open(1).unwrap();
        let cache = BlockCache::new(32);
        let disk = Disk::new(&images, &cache, -1, device);
        let geometry = geometry();
        let mut bitmap = Bitmap::new(BLOCKS);
        let mut file = ForkExtents::new(EXTENTS_FILE_ID, ForkType::Data);
        extents::extend(&geometry, &mut file, NODE_SIZE as u64, &mut bitmap, &mut NoOverflow).unwrap();
        let mut tree = BTree::create(
            &mut TreeStore::new(disk, geometry, &mut file, None),
            EXTENT_KEY_LEN as u16,
            1,
            compare_extent_keys,
        )
        .unwrap();

        let original = vec![record(3, 100), record(6, 200)];
        ExtentsOverflow::new(disk, geometry, &mut tree, &mut file)
            .set_records(20, ForkType::Data, &original, &mut bitmap)
            .unwrap();

        // The extents file has no room left to grow.
        while bitmap.free_blocks() > 0 {
            bitmap.allocate(0, 1, BLOCKS).unwrap();
        }

        let mut grown = original.clone();
        grown.extend((0..40u16).map(|i| record(9 + 3 * i, 300 + 6 * i)));
        let mut overflow = ExtentsOverflow::new(disk, geometry, &mut tree, &mut file);
        assert_eq!(
            overflow.set_records(20, ForkType::Data, &grown, &mut bitmap),
            Err(FsError::DiskFull)
        );
        assert_eq!(overflow.records(20, ForkType::Data).unwrap(), original);
    }
}
