//! The File Manager: control-block pools, the shared block cache and the
//! platform hooks, with the toolbox-style call surface on top.
//!
//! Locks are taken global, then volume, then FCB. The global lock is only
//! held for table lookups and is never held while waiting on a volume lock.
//!
//! Reference numbers:
//! - open forks count up from 1 (slot index + 1),
//! - volumes count down from -1,
//! - working directories count down from `-(WD_REFNUM_BASE + 1)`,
//! - positive volume arguments are drive numbers, and 0 is the default
//!   volume and directory.

use crate::cache::{BlockCache, CacheStats, VolumeId};
use crate::catalog::{new_file_record, new_folder_record};
use crate::config::{FormatOptions, FsConfig};
use crate::device::PlatformHooks;
use crate::disk::Disk;
use crate::error::{FsError, Result};
use crate::extents::{self, ForkExtents};
use crate::fcb::{Fcb, FcbFlag, Permission, PosMode, RefNum};
use crate::pool::Pool;
use crate::volume::{Volume, VolumeFlag, VolumeInfo, VolumeState};
use enumflags2::BitFlags;
use hfs_types::{
    CatalogKey, CatalogNodeId, CatalogRecord, FILE_LOCKED_FLAG, FileRecord, FinderInfo,
    FolderRecord, ForkType, ROOT_FOLDER_ID,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Working directory reference numbers start below `-WD_REFNUM_BASE`.
pub const WD_REFNUM_BASE: i16 = 32000;

fn vref_of(index: usize) -> VolumeId {
    -(index as i16) - 1
}

fn volume_index(vref: VolumeId) -> Option<usize> {
    (-WD_REFNUM_BASE..0)
        .contains(&vref)
        .then(|| (-(vref as i32) - 1) as usize)
}

fn wd_refnum(index: usize) -> VolumeId {
    (-(WD_REFNUM_BASE as i32) - 1 - index as i32) as VolumeId
}

fn wd_index(refnum: VolumeId) -> Option<usize> {
    (refnum < -WD_REFNUM_BASE).then(|| (-(refnum as i32) - WD_REFNUM_BASE as i32 - 1) as usize)
}

/// True when `refnum` names a working directory rather than a volume.
pub fn is_wd_refnum(refnum: VolumeId) -> bool {
    wd_index(refnum).is_some()
}

/// Entry of the open-fork table. The identity fields never change while the
/// slot is filled.
#[derive(Clone)]
struct OpenFork {
    vref: VolumeId,
    file_id: CatalogNodeId,
    fork_type: ForkType,
    fcb: Arc<Mutex<Fcb>>,
}

/// Working directory control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingDir {
    pub vref: VolumeId,
    pub dir_id: CatalogNodeId,
    /// Process that opened it.
    pub owner: u32,
    pub user_data: u32,
}

struct Globals {
    volumes: Pool<Arc<Volume>>,
    /// Drives whose mount is in progress.
    mounting: Vec<u16>,
    files: Pool<OpenFork>,
    working_dirs: Pool<WorkingDir>,
    default_vref: Option<VolumeId>,
    default_dir: CatalogNodeId,
}

/// Which catalog entry [`FileManager::get_cat_info`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatSelector<'n> {
    /// The entry with this name in the directory. An empty name is the
    /// directory itself.
    Name(&'n [u8]),
    /// The nth entry of the directory, counting from 1.
    Index(usize),
    /// The directory itself.
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatEntry {
    File(FileRecord),
    Folder(FolderRecord),
}

/// Result of `GetCatInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatInfo {
    pub name: Vec<u8>,
    pub parent_id: CatalogNodeId,
    pub entry: CatEntry,
}

impl CatInfo {
    fn new(key: CatalogKey, record: CatalogRecord) -> Result<Self> {
        let entry = match record {
            CatalogRecord::File(file) => CatEntry::File(file),
            CatalogRecord::Folder(folder) => CatEntry::Folder(folder),
            _ => return Err(FsError::Corrupt),
        };
        Ok(Self {
            name: key.name,
            parent_id: key.parent_id,
            entry,
        })
    }

    pub fn id(&self) -> CatalogNodeId {
        match &self.entry {
            CatEntry::File(file) => file.file_id,
            CatEntry::Folder(folder) => folder.folder_id,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.entry, CatEntry::Folder(_))
    }
}

/// Canonical location of a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsSpec {
    pub vref: VolumeId,
    pub parent_id: CatalogNodeId,
    pub name: Vec<u8>,
}

/// Snapshot of an FCB, as returned by `PBGetFCBInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcbInfo {
    pub refnum: RefNum,
    pub vref: VolumeId,
    pub file_id: CatalogNodeId,
    pub parent_id: CatalogNodeId,
    pub name: Vec<u8>,
    pub fork_type: ForkType,
    pub flags: BitFlags<FcbFlag>,
    pub position: u32,
    pub logical_eof: u32,
    pub physical_eof: u32,
    pub clump_size: u32,
    pub open_count: u32,
    pub owner: u32,
}

impl From<&Fcb> for FcbInfo {
    fn from(fcb: &Fcb) -> Self {
        Self {
            refnum: fcb.refnum,
            vref: fcb.vref,
            file_id: fcb.file_id(),
            parent_id: fcb.parent_id,
            name: fcb.name.clone(),
            fork_type: fcb.fork_type(),
            flags: fcb.flags,
            position: fcb.position,
            logical_eof: fcb.logical_eof,
            physical_eof: fcb.physical_eof(),
            clump_size: fcb.fork.clump_size,
            open_count: fcb.open_count,
            owner: fcb.owner,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub cache: CacheStats,
    pub volumes: usize,
    pub open_forks: usize,
    pub working_dirs: usize,
}

/// Free both forks of a deleted file.
fn release_forks(disk: &Disk<'_>, state: &mut VolumeState, file: &FileRecord) -> Result<()> {
    for fork_type in [ForkType::Data, ForkType::Resource] {
        let (_, physical, extents) = file.fork(fork_type);
        let mut fork = ForkExtents {
            extents,
            physical_eof: physical,
            ..ForkExtents::new(file.file_id, fork_type)
        };
        let mut io = state.fork_io(*disk);
        extents::truncate(&io.geometry, &mut fork, 0, io.bitmap, &mut io.overflow)?;
    }
    Ok(())
}

pub struct FileManager {
    hooks: Arc<dyn PlatformHooks>,
    cache: BlockCache,
    config: FsConfig,
    globals: Mutex<Globals>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl FileManager {
    pub fn new(hooks: Arc<dyn PlatformHooks>, config: FsConfig) -> Self {
        let config = config.normalized();
        Self {
            hooks,
            cache: BlockCache::new(config.cache_buffers),
            globals: Mutex::new(Globals {
                volumes: Pool::new(config.max_volumes),
                mounting: Vec::new(),
                files: Pool::new(config.max_open_forks),
                working_dirs: Pool::new(config.max_working_dirs),
                default_vref: None,
                default_dir: ROOT_FOLDER_ID,
            }),
            config,
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn hooks(&self) -> &dyn PlatformHooks {
        self.hooks.as_ref()
    }

    fn disk<'a>(&'a self, volume: &Volume) -> Disk<'a> {
        Disk::new(self.hooks.as_ref(), &self.cache, volume.vref, volume.device)
    }

    /// Volume and directory named by a volume argument and a directory ID.
    fn resolve(&self, vref: VolumeId, dir_id: CatalogNodeId) -> Result<(Arc<Volume>, CatalogNodeId)> {
        let g = self.globals.lock();
        let (volume, default_dir) = if vref == 0 {
            let index = g
                .default_vref
                .and_then(volume_index)
                .ok_or(FsError::NoSuchVolume)?;
            (g.volumes.get(index), g.default_dir)
        } else if let Some(index) = wd_index(vref) {
            let wd = g.working_dirs.get(index).ok_or(FsError::NoSuchVolume)?;
            (volume_index(wd.vref).and_then(|i| g.volumes.get(i)), wd.dir_id)
        } else if let Some(index) = volume_index(vref) {
            (g.volumes.get(index), ROOT_FOLDER_ID)
        } else {
            let drive = vref as u16;
            (
                g.volumes.iter().map(|(_, v)| v).find(|v| v.drive == drive),
                ROOT_FOLDER_ID,
            )
        };
        let volume = volume.cloned().ok_or(FsError::NoSuchVolume)?;
        Ok((volume, if dir_id == 0 { default_dir } else { dir_id }))
    }

    fn volume(&self, vref: VolumeId) -> Result<Arc<Volume>> {
        let g = self.globals.lock();
        volume_index(vref)
            .and_then(|index| g.volumes.get(index))
            .cloned()
            .ok_or(FsError::NoSuchVolume)
    }

    fn fork_entry(&self, refnum: RefNum) -> Result<OpenFork> {
        let index = usize::try_from(refnum)
            .ok()
            .and_then(|r| r.checked_sub(1))
            .filter(|&i| i < self.config.max_open_forks)
            .ok_or(FsError::BadRefNum)?;
        self.globals
            .lock()
            .files
            .get(index)
            .cloned()
            .ok_or(FsError::FileNotOpen)
    }

    fn forks_of(&self, vref: VolumeId) -> Vec<Arc<Mutex<Fcb>>> {
        self.globals
            .lock()
            .files
            .iter()
            .filter(|(_, entry)| entry.vref == vref)
            .map(|(_, entry)| entry.fcb.clone())
            .collect()
    }

    fn update_open_forks(&self, vref: VolumeId, file_id: CatalogNodeId, mut update: impl FnMut(&mut Fcb)) {
        let forks: Vec<_> = self
            .globals
            .lock()
            .files
            .iter()
            .filter(|(_, e)| e.vref == vref && e.file_id == file_id)
            .map(|(_, e)| e.fcb.clone())
            .collect();
        for fcb in forks {
            update(&mut fcb.lock());
        }
    }

    /// Run a read-only catalog operation on a resolved volume.
    fn inspect<T>(
        &self,
        vref: VolumeId,
        dir_id: CatalogNodeId,
        op: impl FnOnce(&Disk<'_>, &mut VolumeState, CatalogNodeId) -> Result<T>,
    ) -> Result<T> {
        let (volume, dir) = self.resolve(vref, dir_id)?;
        let disk = self.disk(&volume);
        let mut state = volume.state.lock();
        state.check_online()?;
        op(&disk, &mut state, dir)
    }

    /// Run a mutating operation on a resolved, writable volume.
    fn mutate<T>(
        &self,
        vref: VolumeId,
        dir_id: CatalogNodeId,
        op: impl FnOnce(&Disk<'_>, &mut VolumeState, CatalogNodeId) -> Result<T>,
    ) -> Result<T> {
        let (volume, dir) = self.resolve(vref, dir_id)?;
        let disk = self.disk(&volume);
        let mut state = volume.state.lock();
        state.check_writable()?;
        let result = op(&disk, &mut state, dir);
        state.mark_dirty();
        result
    }

    /// Run an operation on an open fork with its volume and FCB locked.
    fn with_fork<T>(
        &self,
        refnum: RefNum,
        op: impl FnOnce(&Disk<'_>, &mut VolumeState, &mut Fcb) -> Result<T>,
    ) -> Result<T> {
        let entry = self.fork_entry(refnum)?;
        let volume = self.volume(entry.vref)?;
        let disk = self.disk(&volume);
        let mut state = volume.state.lock();
        state.check_online()?;
        let mut fcb = entry.fcb.lock();
        if fcb.open_count == 0 {
            return Err(FsError::FileNotOpen);
        }
        op(&disk, &mut state, &mut fcb)
    }

    // Volumes

    /// Mount the volume in `drive`. Returns its volume reference number.
    pub fn mount(&self, drive: u16) -> Result<VolumeId> {
        let index = {
            let mut g = self.globals.lock();
            if g.mounting.contains(&drive) || g.volumes.find(|v| v.drive == drive).is_some() {
                return Err(FsError::VolumeOnline);
            }
            let index = g.volumes.reserve().ok_or(FsError::TooManyFilesOpen)?;
            g.mounting.push(drive);
            index
        };

        let vref = vref_of(index);
        let loaded = self.load_volume(drive, vref);

        let mut g = self.globals.lock();
        g.mounting.retain(|&d| d != drive);
        match loaded {
            Ok(volume) => {
                g.volumes.fill(index, Arc::new(volume));
                if g.default_vref.is_none() {
                    g.default_vref = Some(vref);
                    g.default_dir = ROOT_FOLDER_ID;
                }
                Ok(vref)
            }
            Err(err) => {
                g.volumes.unreserve(index);
                Err(err)
            }
        }
    }

    fn load_volume(&self, drive: u16, vref: VolumeId) -> Result<Volume> {
        let device = self.hooks.open(drive)?;
        self.cache.invalidate(vref);
        let disk = Disk::new(self.hooks.as_ref(), &self.cache, vref, device);
        let mounted = self.hooks.size(device).and_then(|bytes| {
            let mut state = VolumeState::mount(&disk, bytes, self.hooks.is_write_protected(device))?;
            state.flush(&disk)?;
            Ok(state)
        });
        match mounted {
            Ok(state) => {
                info!("drive {drive} mounted as volume {vref}");
                Ok(Volume::new(vref, drive, device, state))
            }
            Err(err) => {
                debug!("mount of drive {drive} failed: {err}");
                self.cache.invalidate(vref);
                let _ = self.hooks.close(device);
                Err(err)
            }
        }
    }

    /// Close every fork and working directory of the volume, write it back
    /// and release it. An offline volume is released without writing.
    pub fn unmount(&self, vref: VolumeId) -> Result<()> {
        let (volume, _) = self.resolve(vref, 0)?;
        let forks = {
            let mut g = self.globals.lock();
            let index = volume_index(volume.vref).ok_or(FsError::NoSuchVolume)?;
            let forks: Vec<(usize, OpenFork)> = g
                .files
                .iter()
                .filter(|(_, e)| e.vref == volume.vref)
                .map(|(i, e)| (i, e.clone()))
                .collect();
            for (i, _) in &forks {
                g.files.remove(*i);
            }
            let dirs: Vec<usize> = g
                .working_dirs
                .iter()
                .filter(|(_, wd)| wd.vref == volume.vref)
                .map(|(i, _)| i)
                .collect();
            for i in dirs {
                g.working_dirs.remove(i);
            }
            g.volumes.remove(index);
            if g.default_vref == Some(volume.vref) {
                let next = g.volumes.iter().next().map(|(i, _)| vref_of(i));
                g.default_vref = next;
                g.default_dir = ROOT_FOLDER_ID;
            }
            forks
        };

        let disk = self.disk(&volume);
        let mut first_err = None;
        {
            let mut state = volume.state.lock();
            let online = !state.flags.contains(VolumeFlag::Offline);
            for (_, entry) in &forks {
                let mut fcb = entry.fcb.lock();
                fcb.open_count = 0;
                if online && state.is_writable() {
                    if let Err(err) = fcb.store_record(&mut state.catalog(disk)) {
                        warn!("could not record fork {} of file {}: {err}", fcb.refnum, fcb.file_id());
                        first_err.get_or_insert(err);
                    }
                }
            }
            if online {
                if let Err(err) = state.flush_for_unmount(&disk) {
                    first_err.get_or_insert(err);
                }
            }
        }

        self.cache.invalidate(volume.vref);
        if let Err(err) = self.hooks.close(volume.device) {
            debug!("closing drive {} failed: {err}", volume.drive);
        }
        info!("volume {} unmounted", volume.vref);
        first_err.map_or(Ok(()), Err)
    }

    /// Write back the catalog records of every dirty fork on the volume, then
    /// the volume itself.
    fn flush_volume(&self, volume: &Volume) -> Result<()> {
        let forks = self.forks_of(volume.vref);
        let disk = self.disk(volume);
        let mut state = volume.state.lock();
        state.check_online()?;
        if state.is_writable() {
            for fcb in &forks {
                fcb.lock().store_record(&mut state.catalog(disk))?;
            }
        }
        state.flush(&disk)
    }

    pub fn flush_vol(&self, vref: VolumeId) -> Result<()> {
        let (volume, _) = self.resolve(vref, 0)?;
        self.flush_volume(&volume)
    }

    /// Flush every online volume. Returns the first failure.
    pub fn flush_all(&self) -> Result<()> {
        let volumes: Vec<_> = self
            .globals
            .lock()
            .volumes
            .iter()
            .map(|(_, v)| v.clone())
            .collect();
        let mut first_err = None;
        for volume in volumes {
            match self.flush_volume(&volume) {
                Ok(()) | Err(FsError::VolumeOffline) => {}
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Flush the volume, eject its medium and leave it mounted but offline.
    pub fn eject(&self, vref: VolumeId) -> Result<()> {
        let (volume, _) = self.resolve(vref, 0)?;
        if volume.state.lock().flags.contains(VolumeFlag::Offline) {
            return Ok(());
        }
        self.flush_volume(&volume)?;
        let mut state = volume.state.lock();
        self.hooks.eject(volume.device)?;
        state.flags |= VolumeFlag::Offline;
        self.cache.invalidate(volume.vref);
        info!("volume {} ejected", volume.vref);
        Ok(())
    }

    pub fn get_vinfo(&self, vref: VolumeId) -> Result<VolumeInfo> {
        let (volume, _) = self.resolve(vref, 0)?;
        let info = volume.state.lock().info(volume.vref, volume.drive);
        Ok(info)
    }

    /// Info of the `index`th mounted volume, counting from 1.
    pub fn get_vinfo_indexed(&self, index: usize) -> Result<VolumeInfo> {
        if index == 0 {
            return Err(FsError::Param);
        }
        let volume = self
            .globals
            .lock()
            .volumes
            .iter()
            .nth(index - 1)
            .map(|(_, v)| v.clone())
            .ok_or(FsError::NoSuchVolume)?;
        let info = volume.state.lock().info(volume.vref, volume.drive);
        Ok(info)
    }

    /// Make a volume and directory the default.
    pub fn set_vol(&self, vref: VolumeId, dir_id: CatalogNodeId) -> Result<()> {
        let (volume, dir) = self.resolve(vref, dir_id)?;
        {
            let disk = self.disk(&volume);
            let mut state = volume.state.lock();
            state.check_online()?;
            state.catalog(disk).folder(dir)?;
        }
        let mut g = self.globals.lock();
        g.default_vref = Some(volume.vref);
        g.default_dir = dir;
        Ok(())
    }

    /// Make the volume called `name` the default. A trailing colon is allowed.
    pub fn set_vol_by_name(&self, name: &[u8]) -> Result<()> {
        let name = name.strip_suffix(b":").unwrap_or(name);
        let volumes: Vec<_> = self
            .globals
            .lock()
            .volumes
            .iter()
            .map(|(_, v)| v.clone())
            .collect();
        let volume = volumes
            .into_iter()
            .find(|v| v.state.lock().mdb.name().eq_ignore_ascii_case(name))
            .ok_or(FsError::NoSuchVolume)?;
        let mut g = self.globals.lock();
        g.default_vref = Some(volume.vref);
        g.default_dir = ROOT_FOLDER_ID;
        Ok(())
    }

    /// Default volume reference number and directory.
    pub fn get_vol(&self) -> Result<(VolumeId, CatalogNodeId)> {
        let g = self.globals.lock();
        let vref = g.default_vref.ok_or(FsError::NoSuchVolume)?;
        Ok((vref, g.default_dir))
    }

    /// Write an empty volume to the medium in `drive`, which must not be
    /// mounted.
    pub fn format(&self, drive: u16, options: &FormatOptions) -> Result<()> {
        {
            let g = self.globals.lock();
            if g.mounting.contains(&drive) || g.volumes.find(|v| v.drive == drive).is_some() {
                return Err(FsError::FileBusy);
            }
        }
        // Positive IDs are never handed to mounted volumes.
        let scratch = VolumeId::try_from(drive).map_err(|_| FsError::Param)?;
        let device = self.hooks.open(drive)?;
        if self.hooks.is_write_protected(device) {
            let _ = self.hooks.close(device);
            return Err(FsError::WriteProtected);
        }

        self.cache.invalidate(scratch);
        let disk = Disk::new(self.hooks.as_ref(), &self.cache, scratch, device);
        let formatted = self
            .hooks
            .size(device)
            .and_then(|bytes| VolumeState::format(&disk, bytes, options).map(|_| ()));
        self.cache.invalidate(scratch);
        let closed = self.hooks.close(device);
        formatted.and(closed)
    }

    /// Consistency check of the bitmap and both B-trees.
    pub fn check_volume(&self, vref: VolumeId) -> Result<()> {
        let (volume, _) = self.resolve(vref, 0)?;
        let disk = self.disk(&volume);
        let mut state = volume.state.lock();
        state.check_online()?;
        state.check(&disk)
    }

    // Files and folders

    /// Create an empty file. Returns its CNID.
    pub fn create(
        &self,
        vref: VolumeId,
        dir_id: CatalogNodeId,
        name: &[u8],
        creator: u32,
        file_type: u32,
    ) -> Result<CatalogNodeId> {
        self.mutate(vref, dir_id, |disk, state, dir| {
            state
                .catalog(*disk)
                .create(dir, name, new_file_record(file_type, creator))
        })
    }

    /// Create a folder. Returns its directory ID.
    pub fn create_dir(&self, vref: VolumeId, dir_id: CatalogNodeId, name: &[u8]) -> Result<CatalogNodeId> {
        self.mutate(vref, dir_id, |disk, state, dir| {
            state.catalog(*disk).create(dir, name, new_folder_record())
        })
    }

    /// Delete a closed file, releasing its blocks, or an empty folder.
    pub fn delete(&self, vref: VolumeId, dir_id: CatalogNodeId, name: &[u8]) -> Result<()> {
        self.mutate(vref, dir_id, |disk, state, dir| {
            let record = state.catalog(*disk).lookup(dir, name)?;
            if let CatalogRecord::File(file) = &record {
                if state.is_file_open(file.file_id) {
                    return Err(FsError::FileBusy);
                }
            }
            let removed = state.catalog(*disk).delete(dir, name)?;
            if let CatalogRecord::File(file) = &removed {
                release_forks(disk, state, file)?;
            }
            Ok(())
        })
    }

    /// Delete an empty folder.
    pub fn delete_dir(&self, vref: VolumeId, dir_id: CatalogNodeId, name: &[u8]) -> Result<()> {
        self.mutate(vref, dir_id, |disk, state, dir| {
            let mut catalog = state.catalog(*disk);
            if !catalog.lookup(dir, name)?.is_folder() {
                return Err(FsError::DirNotFound);
            }
            catalog.delete(dir, name).map(|_| ())
        })
    }

    pub fn rename(&self, vref: VolumeId, dir_id: CatalogNodeId, name: &[u8], new_name: &[u8]) -> Result<()> {
        let (vref, id) = self.mutate(vref, dir_id, |disk, state, dir| {
            let mut catalog = state.catalog(*disk);
            let id = catalog.lookup(dir, name)?.id().ok_or(FsError::Corrupt)?;
            catalog.rename(dir, name, new_name)?;
            Ok((disk.volume, id))
        })?;
        self.update_open_forks(vref, id, |fcb| fcb.name = new_name.to_vec());
        Ok(())
    }

    /// Move an entry into another folder of the same volume.
    pub fn cat_move(
        &self,
        vref: VolumeId,
        dir_id: CatalogNodeId,
        name: &[u8],
        dest_dir: CatalogNodeId,
    ) -> Result<()> {
        let (vref, id) = self.mutate(vref, dir_id, |disk, state, dir| {
            let mut catalog = state.catalog(*disk);
            let id = catalog.lookup(dir, name)?.id().ok_or(FsError::Corrupt)?;
            catalog.move_entry(dir, name, dest_dir)?;
            Ok((disk.volume, id))
        })?;
        self.update_open_forks(vref, id, |fcb| fcb.parent_id = dest_dir);
        Ok(())
    }

    pub fn get_finfo(&self, vref: VolumeId, dir_id: CatalogNodeId, name: &[u8]) -> Result<FinderInfo> {
        self.inspect(vref, dir_id, |disk, state, dir| {
            match state.catalog(*disk).lookup(dir, name)? {
                CatalogRecord::File(file) => Ok(file.user_info),
                _ => Err(FsError::FileNotFound),
            }
        })
    }

    pub fn set_finfo(
        &self,
        vref: VolumeId,
        dir_id: CatalogNodeId,
        name: &[u8],
        info: FinderInfo,
    ) -> Result<()> {
        self.mutate(vref, dir_id, |disk, state, dir| {
            let mut catalog = state.catalog(*disk);
            let CatalogRecord::File(mut file) = catalog.lookup(dir, name)? else {
                return Err(FsError::FileNotFound);
            };
            file.user_info = info;
            catalog.update(file.file_id, &CatalogRecord::File(file))
        })
    }

    /// Set or clear the locked attribute of a file (`SetFLock`/`RstFLock`).
    pub fn set_file_lock(
        &self,
        vref: VolumeId,
        dir_id: CatalogNodeId,
        name: &[u8],
        locked: bool,
    ) -> Result<()> {
        let (vref, id) = self.mutate(vref, dir_id, |disk, state, dir| {
            let mut catalog = state.catalog(*disk);
            let CatalogRecord::File(mut file) = catalog.lookup(dir, name)? else {
                return Err(FsError::FileNotFound);
            };
            if locked {
                file.flags |= FILE_LOCKED_FLAG;
            } else {
                file.flags &= !FILE_LOCKED_FLAG;
            }
            let id = file.file_id;
            catalog.update(id, &CatalogRecord::File(file))?;
            Ok((disk.volume, id))
        })?;
        self.update_open_forks(vref, id, |fcb| fcb.flags.set(FcbFlag::FileLocked, locked));
        Ok(())
    }

    /// Copy the state of open forks over a file record, whose catalog copy
    /// lags until the forks are closed or flushed.
    fn overlay_open_forks(&self, vref: VolumeId, file: &mut FileRecord) {
        self.update_open_forks(vref, file.file_id, |fcb| {
            file.set_fork(
                fcb.fork_type(),
                fcb.logical_eof,
                fcb.physical_eof(),
                fcb.fork.extents,
            );
        });
    }

    pub fn get_cat_info(
        &self,
        vref: VolumeId,
        dir_id: CatalogNodeId,
        selector: CatSelector<'_>,
    ) -> Result<CatInfo> {
        let (vref, mut info) = self.inspect(vref, dir_id, |disk, state, dir| {
            let mut catalog = state.catalog(*disk);
            let (key, record) = match selector {
                CatSelector::Name(name) => {
                    let id = catalog.lookup(dir, name)?.id().ok_or(FsError::Corrupt)?;
                    catalog.lookup_id(id)?
                }
                CatSelector::Index(index) => catalog.child_at(dir, index)?,
                CatSelector::Directory => {
                    catalog.folder(dir)?;
                    catalog.lookup_id(dir)?
                }
            };
            Ok((disk.volume, CatInfo::new(key, record)?))
        })?;
        if let CatEntry::File(file) = &mut info.entry {
            self.overlay_open_forks(vref, file);
        }
        Ok(info)
    }

    /// Change the settable fields of an entry: attributes, Finder info and
    /// dates. Sizes and IDs are left alone.
    pub fn set_cat_info(
        &self,
        vref: VolumeId,
        dir_id: CatalogNodeId,
        name: &[u8],
        entry: &CatEntry,
    ) -> Result<()> {
        self.mutate(vref, dir_id, |disk, state, dir| {
            let mut catalog = state.catalog(*disk);
            let record = match (catalog.lookup(dir, name)?, entry) {
                (CatalogRecord::File(mut file), CatEntry::File(new)) => {
                    file.flags = (file.flags & !FILE_LOCKED_FLAG) | (new.flags & FILE_LOCKED_FLAG);
                    file.user_info = new.user_info;
                    file.finder_info = new.finder_info;
                    file.create_date = new.create_date;
                    file.modify_date = new.modify_date;
                    file.backup_date = new.backup_date;
                    CatalogRecord::File(file)
                }
                (CatalogRecord::Folder(mut folder), CatEntry::Folder(new)) => {
                    folder.flags = new.flags;
                    folder.user_info = new.user_info;
                    folder.finder_info = new.finder_info;
                    folder.create_date = new.create_date;
                    folder.modify_date = new.modify_date;
                    folder.backup_date = new.backup_date;
                    CatalogRecord::Folder(folder)
                }
                _ => return Err(FsError::Param),
            };
            let id = record.id().ok_or(FsError::Corrupt)?;
            catalog.update(id, &record)
        })
    }

    /// Canonical `FSSpec` of an existing entry. An empty name describes the
    /// directory itself.
    pub fn make_fsspec(&self, vref: VolumeId, dir_id: CatalogNodeId, name: &[u8]) -> Result<FsSpec> {
        self.inspect(vref, dir_id, |disk, state, dir| {
            let mut catalog = state.catalog(*disk);
            catalog.folder(dir)?;
            let id = catalog.lookup(dir, name)?.id().ok_or(FsError::Corrupt)?;
            let (key, _) = catalog.lookup_id(id)?;
            Ok(FsSpec {
                vref: disk.volume,
                parent_id: key.parent_id,
                name: key.name,
            })
        })
    }

    // Forks

    /// Open a fork of a file. A repeat open of the same fork shares its FCB
    /// and reference number.
    pub fn open_fork(
        &self,
        vref: VolumeId,
        dir_id: CatalogNodeId,
        name: &[u8],
        fork_type: ForkType,
        permission: Permission,
    ) -> Result<RefNum> {
        let (volume, dir) = self.resolve(vref, dir_id)?;
        let (file, write) = {
            let disk = self.disk(&volume);
            let mut state = volume.state.lock();
            state.check_online()?;
            let CatalogRecord::File(file) = state.catalog(disk).lookup(dir, name)? else {
                return Err(FsError::NotAFile);
            };
            let write = match permission {
                Permission::Current => state.is_writable() && !file.is_locked(),
                other => other.wants_write(),
            };
            if write {
                state.check_writable()?;
                if file.is_locked() {
                    return Err(FsError::FileLocked);
                }
            }
            state.retain_file(file.file_id);
            (file, write)
        };

        let opened = self.attach_fcb(&volume, dir, name, &file, fork_type, write, permission);
        if opened.is_err() {
            volume.state.lock().release_file(file.file_id);
        }
        opened
    }

    #[allow(clippy::too_many_arguments)]
    fn attach_fcb(
        &self,
        volume: &Arc<Volume>,
        dir: CatalogNodeId,
        name: &[u8],
        file: &FileRecord,
        fork_type: ForkType,
        write: bool,
        permission: Permission,
    ) -> Result<RefNum> {
        let mut g = self.globals.lock();
        let still_mounted = volume_index(volume.vref)
            .and_then(|i| g.volumes.get(i))
            .is_some_and(|v| Arc::ptr_eq(v, volume));
        if !still_mounted {
            return Err(FsError::NoSuchVolume);
        }

        let existing = g
            .files
            .find(|e| {
                e.vref == volume.vref
                    && e.file_id == file.file_id
                    && e.fork_type == fork_type
                    && e.fcb.lock().open_count > 0
            })
            .map(|(_, e)| e.fcb.clone());
        if let Some(shared) = existing {
            let mut fcb = shared.lock();
            if write && !fcb.flags.contains(FcbFlag::SharedWrite) {
                return Err(FsError::OpenForWriting);
            }
            fcb.open_count += 1;
            debug!("fork {} reopened, {} opens", fcb.refnum, fcb.open_count);
            return Ok(fcb.refnum);
        }

        let index = g.files.reserve().ok_or(FsError::TooManyFilesOpen)?;
        let refnum = (index + 1) as RefNum;
        let mut flags = BitFlags::empty();
        if write {
            flags |= FcbFlag::Write;
        }
        if permission == Permission::SharedReadWrite {
            flags |= FcbFlag::SharedWrite;
        }
        let fcb = Fcb::new(refnum, volume.vref, dir, name, file, fork_type, flags, 0);
        g.files.fill(
            index,
            OpenFork {
                vref: volume.vref,
                file_id: file.file_id,
                fork_type,
                fcb: Arc::new(Mutex::new(fcb)),
            },
        );
        debug!("opened {fork_type:?} fork of file {} as {refnum}", file.file_id);
        Ok(refnum)
    }

    /// `FSOpen`: the data fork, relative to the default directory.
    pub fn open(&self, vref: VolumeId, name: &[u8], permission: Permission) -> Result<RefNum> {
        self.open_fork(vref, 0, name, ForkType::Data, permission)
    }

    pub fn open_df(
        &self,
        vref: VolumeId,
        dir_id: CatalogNodeId,
        name: &[u8],
        permission: Permission,
    ) -> Result<RefNum> {
        self.open_fork(vref, dir_id, name, ForkType::Data, permission)
    }

    pub fn open_rf(
        &self,
        vref: VolumeId,
        dir_id: CatalogNodeId,
        name: &[u8],
        permission: Permission,
    ) -> Result<RefNum> {
        self.open_fork(vref, dir_id, name, ForkType::Resource, permission)
    }

    /// Drop one open of a fork, or all of them. The last close writes the
    /// fork's sizes and extents to the catalog and frees the FCB.
    fn close_fork(&self, refnum: RefNum, all: bool) -> Result<()> {
        let entry = self.fork_entry(refnum)?;
        let volume = self.volume(entry.vref)?;
        let stored = {
            let disk = self.disk(&volume);
            let mut state = volume.state.lock();
            let mut fcb = entry.fcb.lock();
            if fcb.open_count == 0 {
                return Err(FsError::FileNotOpen);
            }
            let released = if all { fcb.open_count } else { 1 };
            fcb.open_count -= released;
            for _ in 0..released {
                state.release_file(entry.file_id);
            }
            if fcb.open_count > 0 {
                return Ok(());
            }
            if state.check_online().is_ok() && state.is_writable() {
                let stored = fcb.store_record(&mut state.catalog(disk));
                state.mark_dirty();
                stored
            } else {
                Ok(())
            }
        };

        let mut g = self.globals.lock();
        let index = refnum as usize - 1;
        if g.files.get(index).is_some_and(|e| Arc::ptr_eq(&e.fcb, &entry.fcb)) {
            g.files.remove(index);
        }
        debug!("closed fork {refnum}");
        stored
    }

    pub fn close(&self, refnum: RefNum) -> Result<()> {
        self.close_fork(refnum, false)
    }

    /// Read from the mark into `buf`. Fewer bytes than requested are
    /// returned only at the end of the fork.
    pub fn read(&self, refnum: RefNum, buf: &mut [u8]) -> Result<usize> {
        let count = self.with_fork(refnum, |disk, state, fcb| {
            let mut io = state.fork_io(*disk);
            fcb.read(disk, &mut io, buf)
        })?;
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }

    /// Write all of `data` at the mark, or nothing if the space for it cannot
    /// be allocated.
    pub fn write(&self, refnum: RefNum, data: &[u8]) -> Result<usize> {
        let count = self.with_fork(refnum, |disk, state, fcb| {
            if !fcb.is_writable() {
                return Err(FsError::WritePermission);
            }
            state.check_writable()?;
            let mut io = state.fork_io(*disk);
            let count = fcb.write(disk, &mut io, data)?;
            state.mark_dirty();
            Ok(count)
        })?;
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }

    pub fn get_fpos(&self, refnum: RefNum) -> Result<u32> {
        self.with_fork(refnum, |_, _, fcb| Ok(fcb.position))
    }

    pub fn set_fpos(&self, refnum: RefNum, mode: PosMode, offset: i32) -> Result<u32> {
        self.with_fork(refnum, |_, _, fcb| fcb.seek(mode, offset))
    }

    pub fn get_eof(&self, refnum: RefNum) -> Result<u32> {
        self.with_fork(refnum, |_, _, fcb| Ok(fcb.logical_eof))
    }

    pub fn set_eof(&self, refnum: RefNum, len: u32) -> Result<()> {
        self.with_fork(refnum, |disk, state, fcb| {
            if !fcb.is_writable() {
                return Err(FsError::WritePermission);
            }
            state.check_writable()?;
            let mut io = state.fork_io(*disk);
            fcb.set_eof(&mut io, len)?;
            state.mark_dirty();
            Ok(())
        })
    }

    /// Add physical space to a fork without moving its logical EOF. Returns
    /// the bytes added.
    pub fn allocate(&self, refnum: RefNum, bytes: u32) -> Result<u32> {
        self.with_fork(refnum, |disk, state, fcb| {
            if !fcb.is_writable() {
                return Err(FsError::WritePermission);
            }
            state.check_writable()?;
            let mut io = state.fork_io(*disk);
            let added = fcb.allocate(&mut io, bytes)?;
            state.mark_dirty();
            Ok(added)
        })
    }

    // Working directories

    /// Open a working directory on `(volume, dir_id)` for process `owner`.
    /// An identical one already open is shared.
    pub fn open_wd(
        &self,
        vref: VolumeId,
        dir_id: CatalogNodeId,
        owner: u32,
        user_data: u32,
    ) -> Result<VolumeId> {
        let (volume, dir) = self.resolve(vref, dir_id)?;
        {
            let disk = self.disk(&volume);
            let mut state = volume.state.lock();
            state.check_online()?;
            state.catalog(disk).folder(dir)?;
        }

        let mut g = self.globals.lock();
        if volume_index(volume.vref).and_then(|i| g.volumes.get(i)).is_none() {
            return Err(FsError::NoSuchVolume);
        }
        if let Some((index, _)) = g
            .working_dirs
            .find(|wd| wd.vref == volume.vref && wd.dir_id == dir && wd.owner == owner)
        {
            return Ok(wd_refnum(index));
        }
        let index = g
            .working_dirs
            .insert(WorkingDir {
                vref: volume.vref,
                dir_id: dir,
                owner,
                user_data,
            })
            .ok_or(FsError::TooManyWorkingDirs)?;
        Ok(wd_refnum(index))
    }

    /// Close a working directory. Closing a volume reference number does
    /// nothing.
    pub fn close_wd(&self, refnum: VolumeId) -> Result<()> {
        let Some(index) = wd_index(refnum) else {
            return Ok(());
        };
        self.globals
            .lock()
            .working_dirs
            .remove(index)
            .map(|_| ())
            .ok_or(FsError::NoSuchVolume)
    }

    /// The binding behind a working directory, or the volume and default
    /// directory of any other volume argument.
    pub fn get_wd_info(&self, refnum: VolumeId) -> Result<WorkingDir> {
        if let Some(index) = wd_index(refnum) {
            return self
                .globals
                .lock()
                .working_dirs
                .get(index)
                .copied()
                .ok_or(FsError::NoSuchVolume);
        }
        let (volume, dir) = self.resolve(refnum, 0)?;
        Ok(WorkingDir {
            vref: volume.vref,
            dir_id: dir,
            owner: 0,
            user_data: 0,
        })
    }

    /// The `index`th open working directory, counting from 1, optionally
    /// limited to one volume.
    pub fn get_wd_info_indexed(&self, index: usize, vref: VolumeId) -> Result<(VolumeId, WorkingDir)> {
        if index == 0 {
            return Err(FsError::Param);
        }
        let filter = if vref == 0 {
            None
        } else {
            Some(self.resolve(vref, 0)?.0.vref)
        };
        self.globals
            .lock()
            .working_dirs
            .iter()
            .filter(|(_, wd)| filter.is_none_or(|v| wd.vref == v))
            .nth(index - 1)
            .map(|(i, wd)| (wd_refnum(i), *wd))
            .ok_or(FsError::NoSuchVolume)
    }

    // Control block queries and process bookkeeping

    pub fn get_fcb_info(&self, refnum: RefNum) -> Result<FcbInfo> {
        let entry = self.fork_entry(refnum)?;
        let fcb = entry.fcb.lock();
        Ok(FcbInfo::from(&*fcb))
    }

    /// The `index`th open fork, counting from 1, optionally limited to one
    /// volume.
    pub fn get_fcb_info_indexed(&self, index: usize, vref: VolumeId) -> Result<FcbInfo> {
        if index == 0 {
            return Err(FsError::Param);
        }
        let filter = if vref == 0 {
            None
        } else {
            Some(self.resolve(vref, 0)?.0.vref)
        };
        let entry = self
            .globals
            .lock()
            .files
            .iter()
            .filter(|(_, e)| filter.is_none_or(|v| e.vref == v))
            .nth(index - 1)
            .map(|(_, e)| e.fcb.clone())
            .ok_or(FsError::FileNotOpen)?;
        let fcb = entry.lock();
        Ok(FcbInfo::from(&*fcb))
    }

    pub fn set_process_owner(&self, refnum: RefNum, owner: u32) -> Result<()> {
        let entry = self.fork_entry(refnum)?;
        entry.fcb.lock().owner = owner;
        Ok(())
    }

    /// Close every fork and working directory owned by a process that has
    /// gone away. Returns how many forks were closed.
    pub fn release_process_files(&self, owner: u32) -> Result<usize> {
        let refnums: Vec<RefNum> = {
            let mut g = self.globals.lock();
            let dirs: Vec<usize> = g
                .working_dirs
                .iter()
                .filter(|(_, wd)| wd.owner == owner)
                .map(|(i, _)| i)
                .collect();
            for i in dirs {
                g.working_dirs.remove(i);
            }
            g.files
                .iter()
                .filter(|(_, e)| e.fcb.lock().owner == owner)
                .map(|(i, _)| (i + 1) as RefNum)
                .collect()
        };

        let mut first_err = None;
        let mut closed = 0;
        for refnum in refnums {
            match self.close_fork(refnum, true) {
                Ok(()) => closed += 1,
                Err(FsError::FileNotOpen) => {}
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        debug!("released {closed} forks of process {owner}");
        first_err.map_or(Ok(closed), Err)
    }

    pub fn stats(&self) -> FsStats {
        let g = self.globals.lock();
        FsStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            cache: self.cache.stats(),
            volumes: g.volumes.len(),
            open_forks: g.files.len(),
            working_dirs: g.working_dirs.len(),
        }
    }
}
