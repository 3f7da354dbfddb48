//! Mounted volume state: MDB, allocation bitmap and the two B-tree files.
//!
//! A [`Volume`] is the VCB. Its [`VolumeState`] sits behind the volume lock
//! and is only touched through a [`Disk`] built by the caller from the file
//! manager's hooks and cache.

use crate::bitmap::Bitmap;
use crate::btree::BTree;
use crate::cache::VolumeId;
use crate::catalog::{Catalog, compare_catalog_keys, mac_now};
use crate::config::FormatOptions;
use crate::device::DeviceHandle;
use crate::disk::Disk;
use crate::error::{FsError, Result};
use crate::extents::{self, ForkExtents, Geometry, NoOverflow};
use crate::treefile::{ExtentsOverflow, TreeStore, compare_extent_keys};
use deku::prelude::*;
use enumflags2::{BitFlags, bitflags};
use hfs_types::{
    CATALOG_FILE_ID, CatalogNodeId, CATALOG_KEY_MAX_LEN, EXTENT_KEY_LEN, EXTENTS_FILE_ID, ForkType,
    HFS_SIGNATURE, MAX_VOLUME_NAME_LEN, MDB_SECTOR, MFS_SIGNATURE, MasterDirectoryBlock,
    NODE_SIZE, SECTOR_SIZE,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;

/// `drAtrb` bit: the volume is locked by hardware.
pub const ATTR_HARDWARE_LOCK: u16 = 1 << 7;
/// `drAtrb` bit: the volume was cleanly unmounted.
pub const ATTR_UNMOUNTED: u16 = 1 << 8;
/// `drAtrb` bit: the volume is locked by software.
pub const ATTR_SOFTWARE_LOCK: u16 = 1 << 15;

/// Smallest device [`VolumeState::format`] accepts.
pub const MIN_VOLUME_BYTES: u64 = 1 << 20;

/// Sectors before the bitmap: two boot blocks and the MDB.
const RESERVED_SECTORS: u32 = 3;
/// Sectors after the allocation area: the alternate MDB and one spare.
const TRAILING_SECTORS: u32 = 2;

/// Run-time state of a mounted volume.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFlag {
    /// The device refuses writes.
    HardwareLock = 0x01,
    /// The MDB carries the software lock attribute.
    SoftwareLock = 0x02,
    /// In-memory metadata differs from disk.
    Dirty = 0x04,
    /// Ejected; I/O fails until remounted.
    Offline = 0x08,
}

/// Summary returned by `FSGetVInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: Vec<u8>,
    pub vref: VolumeId,
    pub drive: u16,
    pub create_date: u32,
    pub modify_date: u32,
    pub attributes: u16,
    /// Files in the root folder.
    pub root_files: u16,
    /// Folders in the root folder.
    pub root_dirs: u16,
    pub file_count: u32,
    pub folder_count: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub block_size: u32,
    pub clump_size: u32,
    pub alloc_start: u32,
    pub next_cnid: u32,
    pub locked: bool,
    pub offline: bool,
}

impl VolumeInfo {
    pub fn free_bytes(&self) -> u64 {
        self.free_blocks as u64 * self.block_size as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_blocks as u64 * self.block_size as u64
    }
}

/// Pieces of the volume needed to read, write or resize a fork.
pub struct ForkIo<'a> {
    pub geometry: Geometry,
    pub bitmap: &'a mut Bitmap,
    pub overflow: ExtentsOverflow<'a>,
}

/// Everything guarded by the volume lock.
pub struct VolumeState {
    pub mdb: MasterDirectoryBlock,
    pub geometry: Geometry,
    pub bitmap: Bitmap,
    pub catalog: BTree,
    pub catalog_file: ForkExtents,
    pub extents: BTree,
    pub extents_file: ForkExtents,
    pub flags: BitFlags<VolumeFlag>,
    /// Device sector of the alternate MDB.
    pub alternate_sector: u32,
    /// Open count per file, across both forks.
    open_files: HashMap<CatalogNodeId, u32>,
}

fn tree_file(id: u32, size: u32, extents: hfs_types::ExtentRecord, clump: u32) -> ForkExtents {
    ForkExtents {
        extents,
        physical_eof: size,
        clump_size: clump,
        ..ForkExtents::new(id, ForkType::Data)
    }
}

impl VolumeState {
    /// Read and validate the MDB, then load the bitmap and both B-trees.
    pub fn mount(disk: &Disk<'_>, device_bytes: u64, write_protected: bool) -> Result<Self> {
        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_sector(MDB_SECTOR, &mut sector)?;
        match u16::from_be_bytes([sector[0], sector[1]]) {
            HFS_SIGNATURE => {}
            MFS_SIGNATURE => return Err(FsError::ExternalFileSystem),
            other => {
                debug!("unknown volume signature {other:#06x}");
                return Err(FsError::BadMdb);
            }
        }
        let (_rest, mdb) = MasterDirectoryBlock::from_bytes((&sector[..MasterDirectoryBlock::SIZE], 0))
            .map_err(|_| FsError::BadMdb)?;

        let device_sectors = (device_bytes / SECTOR_SIZE as u64) as u32;
        let spb = mdb.sectors_per_block();
        let geometry = Geometry {
            block_size: mdb.block_size,
            alloc_start: mdb.alloc_start as u32,
            total_blocks: mdb.total_blocks as u32,
            clump_size: mdb.clump_size,
        };
        if mdb.block_size == 0
            || mdb.block_size % SECTOR_SIZE as u32 != 0
            || mdb.total_blocks == 0
            || (mdb.alloc_start as u32) < mdb.bitmap_start as u32 + Bitmap::sectors_for(geometry.total_blocks)
            || geometry.alloc_start as u64 + geometry.total_blocks as u64 * spb as u64 > device_sectors as u64
        {
            debug!("implausible MDB geometry: {geometry:?} on {device_sectors} sectors");
            return Err(FsError::BadMdb);
        }

        let bitmap = Bitmap::load(
            disk,
            mdb.bitmap_start as u32,
            geometry.total_blocks,
            mdb.alloc_ptr as u32,
        )?;
        if bitmap.free_blocks() != mdb.free_blocks as u32 {
            warn!(
                "MDB free count {} disagrees with bitmap {}; using the bitmap",
                mdb.free_blocks,
                bitmap.free_blocks()
            );
        }

        let mut catalog_file = tree_file(
            CATALOG_FILE_ID,
            mdb.catalog_size,
            mdb.catalog_extents,
            mdb.catalog_clump,
        );
        let mut extents_file = tree_file(
            EXTENTS_FILE_ID,
            mdb.extents_size,
            mdb.extents_extents,
            mdb.extents_clump,
        );
        let catalog = BTree::open(
            &mut TreeStore::new(*disk, geometry, &mut catalog_file, None),
            compare_catalog_keys,
        )?;
        let extents = BTree::open(
            &mut TreeStore::new(*disk, geometry, &mut extents_file, None),
            compare_extent_keys,
        )?;

        let mut flags = BitFlags::empty();
        if write_protected || mdb.attributes & ATTR_HARDWARE_LOCK != 0 {
            flags |= VolumeFlag::HardwareLock;
        }
        if mdb.attributes & ATTR_SOFTWARE_LOCK != 0 {
            flags |= VolumeFlag::SoftwareLock;
        }

        let mut state = Self {
            mdb,
            geometry,
            bitmap,
            catalog,
            catalog_file,
            extents,
            extents_file,
            flags,
            alternate_sector: device_sectors.saturating_sub(2),
            open_files: HashMap::new(),
        };
        if state.is_writable() {
            // Cleared until the next clean unmount.
            state.mdb.attributes &= !ATTR_UNMOUNTED;
            state.mark_dirty();
        }
        info!(
            "mounted {:?}: {} blocks of {} bytes, {} free",
            String::from_utf8_lossy(state.mdb.name()),
            state.geometry.total_blocks,
            state.geometry.block_size,
            state.bitmap.free_blocks()
        );
        Ok(state)
    }

    /// Lay down an empty volume on the device and return it mounted.
    pub fn format(disk: &Disk<'_>, device_bytes: u64, options: &FormatOptions) -> Result<Self> {
        let name = options.volume_name.as_slice();
        if name.is_empty() || name.contains(&b':') {
            return Err(FsError::BadName);
        }
        if name.len() > MAX_VOLUME_NAME_LEN || device_bytes < MIN_VOLUME_BYTES {
            return Err(FsError::Param);
        }

        let sectors = (device_bytes / SECTOR_SIZE as u64).min(u32::MAX as u64) as u32;
        let available = (sectors - RESERVED_SECTORS - TRAILING_SECTORS) as u64;
        let block_size = match options.block_size {
            Some(size) if size == 0 || size % SECTOR_SIZE as u32 != 0 => return Err(FsError::Param),
            Some(size) => size,
            None => {
                let mut size = SECTOR_SIZE as u32;
                while available * SECTOR_SIZE as u64 / size as u64 > u16::MAX as u64 {
                    size *= 2;
                }
                size
            }
        };
        let spb = block_size / SECTOR_SIZE as u32;
        let rough_blocks = (available / spb as u64).min(u16::MAX as u64) as u32;
        let alloc_start = RESERVED_SECTORS + Bitmap::sectors_for(rough_blocks);
        let total_blocks =
            ((sectors - alloc_start - TRAILING_SECTORS) / spb).min(u16::MAX as u32);
        if total_blocks == 0 {
            return Err(FsError::Param);
        }

        let clump_size = options.clump_size.max(block_size).div_ceil(block_size) * block_size;
        let tree_bytes = options.btree_blocks.max(1) as u32 * block_size;
        let now = mac_now();
        let mut mdb = MasterDirectoryBlock {
            create_date: now,
            modify_date: now,
            bitmap_start: RESERVED_SECTORS as u16,
            total_blocks: total_blocks as u16,
            block_size,
            clump_size,
            alloc_start: alloc_start as u16,
            extents_clump: tree_bytes,
            catalog_clump: tree_bytes,
            ..Default::default()
        };
        mdb.set_name(name);

        let zero = [0u8; SECTOR_SIZE];
        for sector in 0..RESERVED_SECTORS {
            disk.write_sector(sector, &zero)?;
        }

        let geometry = Geometry {
            block_size,
            alloc_start,
            total_blocks,
            clump_size,
        };
        let mut bitmap = Bitmap::new(total_blocks);
        let mut extents_file = tree_file(EXTENTS_FILE_ID, 0, Default::default(), tree_bytes);
        let mut catalog_file = tree_file(CATALOG_FILE_ID, 0, Default::default(), tree_bytes);
        for file in [&mut extents_file, &mut catalog_file] {
            extents::extend(&geometry, file, tree_bytes as u64, &mut bitmap, &mut NoOverflow)?;
        }

        let extents_nodes = extents_file.physical_eof / NODE_SIZE as u32;
        let extents = BTree::create(
            &mut TreeStore::new(*disk, geometry, &mut extents_file, Some(&mut bitmap)),
            EXTENT_KEY_LEN as u16,
            extents_nodes,
            compare_extent_keys,
        )?;
        let catalog_nodes = catalog_file.physical_eof / NODE_SIZE as u32;
        let catalog = BTree::create(
            &mut TreeStore::new(*disk, geometry, &mut catalog_file, Some(&mut bitmap)),
            CATALOG_KEY_MAX_LEN as u16,
            catalog_nodes,
            compare_catalog_keys,
        )?;

        let mut state = Self {
            mdb,
            geometry,
            bitmap,
            catalog,
            catalog_file,
            extents,
            extents_file,
            flags: VolumeFlag::Dirty.into(),
            alternate_sector: sectors - 2,
            open_files: HashMap::new(),
        };
        state.catalog(*disk).create_root(name)?;
        state.flush(disk)?;
        info!(
            "formatted {:?}: {total_blocks} blocks of {block_size} bytes",
            String::from_utf8_lossy(name)
        );
        Ok(state)
    }

    pub fn is_writable(&self) -> bool {
        !self.flags.intersects(
            VolumeFlag::HardwareLock | VolumeFlag::SoftwareLock | VolumeFlag::Offline,
        )
    }

    /// Reject mutation of a locked or offline volume.
    pub fn check_writable(&self) -> Result<()> {
        if self.flags.contains(VolumeFlag::Offline) {
            Err(FsError::VolumeOffline)
        } else if self.flags.contains(VolumeFlag::HardwareLock) {
            Err(FsError::WriteProtected)
        } else if self.flags.contains(VolumeFlag::SoftwareLock) {
            Err(FsError::VolumeLocked)
        } else {
            Ok(())
        }
    }

    pub fn check_online(&self) -> Result<()> {
        if self.flags.contains(VolumeFlag::Offline) {
            Err(FsError::VolumeOffline)
        } else {
            Ok(())
        }
    }

    /// Count one more open of file `id`.
    pub fn retain_file(&mut self, id: CatalogNodeId) {
        *self.open_files.entry(id).or_default() += 1;
    }

    pub fn release_file(&mut self, id: CatalogNodeId) {
        if let Some(count) = self.open_files.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.open_files.remove(&id);
            }
        }
    }

    pub fn is_file_open(&self, id: CatalogNodeId) -> bool {
        self.open_files.contains_key(&id)
    }

    pub fn mark_dirty(&mut self) {
        self.flags |= VolumeFlag::Dirty;
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(VolumeFlag::Dirty) || self.bitmap.is_dirty()
    }

    /// Catalog operations on this volume. Growing the catalog file draws
    /// from the bitmap.
    pub fn catalog<'s>(&'s mut self, disk: Disk<'s>) -> Catalog<'s, TreeStore<'s>> {
        let store = TreeStore::new(
            disk,
            self.geometry,
            &mut self.catalog_file,
            Some(&mut self.bitmap),
        );
        Catalog::new(&mut self.catalog, store, &mut self.mdb)
    }

    /// Bitmap and overflow extents for fork I/O.
    pub fn fork_io<'s>(&'s mut self, disk: Disk<'s>) -> ForkIo<'s> {
        ForkIo {
            geometry: self.geometry,
            bitmap: &mut self.bitmap,
            overflow: ExtentsOverflow::new(
                disk,
                self.geometry,
                &mut self.extents,
                &mut self.extents_file,
            ),
        }
    }

    /// Copy run-time counters back into the MDB.
    fn sync_mdb(&mut self) {
        self.mdb.free_blocks = self.bitmap.free_blocks() as u16;
        self.mdb.alloc_ptr = self.bitmap.alloc_ptr() as u16;
        self.mdb.extents_size = self.extents_file.physical_eof;
        self.mdb.extents_extents = self.extents_file.extents;
        self.mdb.catalog_size = self.catalog_file.physical_eof;
        self.mdb.catalog_extents = self.catalog_file.extents;
    }

    fn write_mdb(&self, disk: &Disk<'_>) -> Result<()> {
        let bytes = self.mdb.to_bytes()?;
        disk.write_at(MDB_SECTOR, 0, &bytes)?;
        disk.write_at(self.alternate_sector, 0, &bytes)
    }

    /// Write the bitmap and both MDB copies if anything changed, then push
    /// the volume's cached sectors to the device.
    pub fn flush(&mut self, disk: &Disk<'_>) -> Result<()> {
        self.check_online()?;
        if self.is_writable() && self.is_dirty() {
            if self.bitmap.is_dirty() {
                self.bitmap.store(disk, self.mdb.bitmap_start as u32)?;
            }
            self.sync_mdb();
            self.mdb.write_count = self.mdb.write_count.wrapping_add(1);
            self.write_mdb(disk)?;
            self.flags.remove(VolumeFlag::Dirty);
            debug!(
                "flushed volume {}: {} free blocks",
                disk.volume,
                self.bitmap.free_blocks()
            );
        }
        disk.flush()
    }

    /// Flush with the clean-unmount attribute set.
    pub fn flush_for_unmount(&mut self, disk: &Disk<'_>) -> Result<()> {
        if self.is_writable() {
            self.mdb.attributes |= ATTR_UNMOUNTED;
            self.mark_dirty();
        }
        self.flush(disk)
    }

    /// Consistency scan of the bitmap and both B-trees.
    pub fn check(&mut self, disk: &Disk<'_>) -> Result<()> {
        self.bitmap.check()?;
        self.catalog.verify(&mut TreeStore::new(
            *disk,
            self.geometry,
            &mut self.catalog_file,
            None,
        ))?;
        self.extents.verify(&mut TreeStore::new(
            *disk,
            self.geometry,
            &mut self.extents_file,
            None,
        ))
    }

    pub fn info(&self, vref: VolumeId, drive: u16) -> VolumeInfo {
        VolumeInfo {
            name: self.mdb.name().to_vec(),
            vref,
            drive,
            create_date: self.mdb.create_date,
            modify_date: self.mdb.modify_date,
            attributes: self.mdb.attributes,
            root_files: self.mdb.root_files,
            root_dirs: self.mdb.root_dirs,
            file_count: self.mdb.file_count,
            folder_count: self.mdb.folder_count,
            total_blocks: self.geometry.total_blocks,
            free_blocks: self.bitmap.free_blocks(),
            block_size: self.geometry.block_size,
            clump_size: self.geometry.clump_size,
            alloc_start: self.geometry.alloc_start,
            next_cnid: self.mdb.next_cnid,
            locked: !self.is_writable() && !self.flags.contains(VolumeFlag::Offline),
            offline: self.flags.contains(VolumeFlag::Offline),
        }
    }
}

/// Volume control block.
pub struct Volume {
    pub vref: VolumeId,
    pub drive: u16,
    pub device: DeviceHandle,
    pub state: Mutex<VolumeState>,
}

impl Volume {
    pub fn new(vref: VolumeId, drive: u16, device: DeviceHandle, state: VolumeState) -> Self {
        Self {
            vref,
            drive,
            device,
            state: Mutex::new(state),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::device::{DiskImages, PlatformHooks};
    use hfs_types::{ROOT_FOLDER_ID, ROOT_PARENT_ID};

    pub(crate) const IMAGE_BYTES: usize = 1 << 20;

    fn fixture() -> (DiskImages, BlockCache, DeviceHandle) {
        let images = DiskImages::new();
        images.insert_blank(1, IMAGE_BYTES);
        let device = images.open(1).unwrap();
        (images, BlockCache::new(64), device)
    }

    fn format(disk: &Disk<'_>) -> VolumeState {
        VolumeState::format(disk, IMAGE_BYTES as u64, &FormatOptions::new("Scratch")).unwrap()
    }

    #[test]
    fn format_lays_out_a_mountable_volume() {
        let (images, cache, device) = fixture();
        let disk = Disk::new(&images, &cache, -1, device);
        let formatted = format(&disk);
        assert_eq!(formatted.geometry.block_size, 512);
        assert_eq!(formatted.mdb.bitmap_start, 3);
        assert_eq!(formatted.geometry.alloc_start, 4);
        assert_eq!(formatted.geometry.total_blocks, 2048 - 4 - 2);
        // Each B-tree file takes its initial clump of 8 blocks.
        assert_eq!(
            formatted.bitmap.free_blocks(),
            formatted.geometry.total_blocks - 16
        );

        let image = images.snapshot(1).unwrap();
        assert_eq!(&image[1024..1026], b"BD");
        let alternate = IMAGE_BYTES - 1024;
        assert_eq!(
            &image[alternate..alternate + MasterDirectoryBlock::SIZE],
            &image[1024..1024 + MasterDirectoryBlock::SIZE]
        );

        cache.invalidate(-1);
        let mut mounted = VolumeState::mount(&disk, IMAGE_BYTES as u64, false).unwrap();
        assert_eq!(mounted.mdb.name(), b"Scratch");
        mounted.check(&disk).unwrap();
        let mut catalog = mounted.catalog(disk);
        let root = catalog.folder(ROOT_FOLDER_ID).unwrap();
        assert_eq!(root.valence, 0);
        assert_eq!(catalog.thread(ROOT_FOLDER_ID).unwrap().parent_id, ROOT_PARENT_ID);
    }

    #[test]
    fn large_devices_get_larger_blocks() {
        let images = DiskImages::new();
        let bytes = 64 << 20;
        images.insert_blank(2, bytes);
        let device = images.open(2).unwrap();
        let cache = BlockCache::new(64);
        let disk = Disk::new(&images, &cache, -2, device);
        let state = VolumeState::format(&disk, bytes as u64, &FormatOptions::new("Big")).unwrap();
        assert_eq!(state.geometry.block_size, 1024);
        assert!(state.geometry.total_blocks <= u16::MAX as u32);
    }

    #[test]
    fn format_rejects_bad_parameters() {
        let (images, cache, device) = fixture();
        let disk = Disk::new(&images, &cache, -1, device);
        let long = FormatOptions::new([b'n'; 28]);
        assert_eq!(
            VolumeState::format(&disk, IMAGE_BYTES as u64, &long).err(),
            Some(FsError::Param)
        );
        assert_eq!(
            VolumeState::format(&disk, 1000, &FormatOptions::new("Tiny")).err(),
            Some(FsError::Param)
        );
        assert_eq!(
            VolumeState::format(&disk, IMAGE_BYTES as u64, &FormatOptions::new("")).err(),
            Some(FsError::BadName)
        );
    }

    #[test]
    fn allocation_survives_flush_and_remount() {
        let (images, cache, device) = fixture();
        let disk = Disk::new(&images, &cache, -1, device);
        let mut state = format(&disk);
        let before = state.bitmap.free_blocks();

        let (start, count) = state.bitmap.allocate(0, 10, 10).unwrap();
        assert_eq!(count, 10);
        assert_eq!(state.bitmap.free_blocks(), before - 10);
        assert!((start..start + count).all(|b| state.bitmap.is_used(b)));
        state.flush(&disk).unwrap();

        cache.invalidate(-1);
        let mounted = VolumeState::mount(&disk, IMAGE_BYTES as u64, false).unwrap();
        assert_eq!(mounted.bitmap.free_blocks(), before - 10);
        assert_eq!(mounted.mdb.free_blocks as u32, before - 10);
        assert!((start..start + count).all(|b| mounted.bitmap.is_used(b)));
    }

    #[test]
    fn signatures_are_checked() {
        let (images, cache, device) = fixture();
        let disk = Disk::new(&images, &cache, -1, device);
        assert_eq!(
            VolumeState::mount(&disk, IMAGE_BYTES as u64, false).err(),
            Some(FsError::BadMdb)
        );

        let mut sector = [0u8; SECTOR_SIZE];
        sector[..2].copy_from_slice(&MFS_SIGNATURE.to_be_bytes());
        disk.write_sector(MDB_SECTOR, &sector).unwrap();
        assert_eq!(
            VolumeState::mount(&disk, IMAGE_BYTES as u64, false).err(),
            Some(FsError::ExternalFileSystem)
        );
    }

    #[test]
    fn write_protected_device_mounts_locked() {
        let (images, cache, device) = fixture();
        let disk = Disk::new(&images, &cache, -1, device);
        format(&disk);
        cache.invalidate(-1);

        let mut state = VolumeState::mount(&disk, IMAGE_BYTES as u64, true).unwrap();
        assert!(!state.is_writable());
        assert_eq!(state.check_writable(), Err(FsError::WriteProtected));
        assert!(state.info(-1, 1).locked);
        // Nothing is written back for a locked volume.
        state.flush(&disk).unwrap();
        assert_eq!(cache.dirty_count(-1), 0);
    }

    #[test]
    fn clean_unmount_sets_attribute() {
        let (images, cache, device) = fixture();
        let disk = Disk::new(&images, &cache, -1, device);
        let mut state = format(&disk);
        state.flush_for_unmount(&disk).unwrap();
        cache.invalidate(-1);

        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_sector(MDB_SECTOR, &mut sector).unwrap();
        let (_, mdb) = MasterDirectoryBlock::from_bytes((&sector[..], 0)).unwrap();
        assert_ne!(mdb.attributes & ATTR_UNMOUNTED, 0);

        let state = VolumeState::mount(&disk, IMAGE_BYTES as u64, false).unwrap();
        assert_eq!(state.mdb.attributes & ATTR_UNMOUNTED, 0);
    }
}
