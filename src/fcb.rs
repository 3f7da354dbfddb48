//! File control blocks: one per open fork, with its mark, EOFs and extents.

use crate::btree::NodeStore;
use crate::cache::VolumeId;
use crate::catalog::{Catalog, mac_now};
use crate::disk::Disk;
use crate::error::{FsError, Result};
use crate::extents::{self, ForkExtents};
use crate::volume::ForkIo;
use enumflags2::{BitFlags, bitflags};
use hfs_types::{CatalogNodeId, CatalogRecord, FileRecord, ForkType, SECTOR_SIZE};
use std::ops::Range;

/// Reference number of an open fork, 1-based.
pub type RefNum = i16;

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcbFlag {
    /// Opened with write permission.
    Write = 0x01,
    /// This is the resource fork.
    Resource = 0x02,
    /// EOFs or extents differ from the catalog record.
    Dirty = 0x04,
    /// Further openers may also write.
    SharedWrite = 0x08,
    /// The file carried the locked attribute when opened.
    FileLocked = 0x10,
    /// The file has its own clump size.
    OwnClump = 0x20,
}

/// Access requested when opening a fork (`ioPermssn`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Write if the volume and file allow it, otherwise read.
    #[default]
    Current,
    Read,
    Write,
    ReadWrite,
    SharedReadWrite,
}

impl Permission {
    pub fn from_raw(raw: i8) -> Result<Self> {
        Ok(match raw {
            0 => Permission::Current,
            1 => Permission::Read,
            2 => Permission::Write,
            3 => Permission::ReadWrite,
            4 => Permission::SharedReadWrite,
            _ => return Err(FsError::Param),
        })
    }

    pub fn wants_write(self) -> bool {
        matches!(
            self,
            Permission::Write | Permission::ReadWrite | Permission::SharedReadWrite
        )
    }
}

/// Base of a positioning request (`ioPosMode`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PosMode {
    #[default]
    AtMark,
    FromStart,
    FromLeof,
    FromMark,
}

impl PosMode {
    pub fn from_raw(raw: u16) -> Result<Self> {
        Ok(match raw & 0x3 {
            0 => PosMode::AtMark,
            1 => PosMode::FromStart,
            2 => PosMode::FromLeof,
            _ => PosMode::FromMark,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Fcb {
    pub refnum: RefNum,
    pub vref: VolumeId,
    pub parent_id: CatalogNodeId,
    pub name: Vec<u8>,
    pub flags: BitFlags<FcbFlag>,
    /// Current mark.
    pub position: u32,
    pub logical_eof: u32,
    pub fork: ForkExtents,
    pub open_count: u32,
    /// Process that owns the fork.
    pub owner: u32,
}

impl Fcb {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        refnum: RefNum,
        vref: VolumeId,
        parent_id: CatalogNodeId,
        name: &[u8],
        file: &FileRecord,
        fork_type: ForkType,
        mut flags: BitFlags<FcbFlag>,
        owner: u32,
    ) -> Self {
        let (logical, physical, extents) = file.fork(fork_type);
        if fork_type == ForkType::Resource {
            flags |= FcbFlag::Resource;
        }
        if file.is_locked() {
            flags |= FcbFlag::FileLocked;
        }
        if file.clump_size != 0 {
            flags |= FcbFlag::OwnClump;
        }
        Self {
            refnum,
            vref,
            parent_id,
            name: name.to_vec(),
            flags,
            position: 0,
            logical_eof: logical.min(physical),
            fork: ForkExtents {
                extents,
                physical_eof: physical,
                clump_size: file.clump_size as u32,
                ..ForkExtents::new(file.file_id, fork_type)
            },
            open_count: 1,
            owner,
        }
    }

    pub fn file_id(&self) -> CatalogNodeId {
        self.fork.file_id
    }

    pub fn fork_type(&self) -> ForkType {
        self.fork.fork_type
    }

    pub fn physical_eof(&self) -> u32 {
        self.fork.physical_eof
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(FcbFlag::Write)
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(FsError::WritePermission)
        }
    }

    /// Move the mark. Past the logical EOF the mark is left at the EOF and
    /// `EndOfFile` is reported; before the start is a position error.
    pub fn seek(&mut self, mode: PosMode, offset: i32) -> Result<u32> {
        let base = match mode {
            PosMode::AtMark => return Ok(self.position),
            PosMode::FromStart => 0,
            PosMode::FromLeof => self.logical_eof as i64,
            PosMode::FromMark => self.position as i64,
        };
        let target = base + offset as i64;
        if target < 0 {
            return Err(FsError::Position);
        }
        if target > self.logical_eof as i64 {
            self.position = self.logical_eof;
            return Err(FsError::EndOfFile);
        }
        self.position = target as u32;
        Ok(self.position)
    }

    /// Walk `len` bytes of the fork from `start`, one sector piece at a time.
    fn transfer(
        &self,
        io: &mut ForkIo<'_>,
        start: u32,
        len: usize,
        mut op: impl FnMut(u32, usize, Range<usize>) -> Result<()>,
    ) -> Result<()> {
        let block_size = io.geometry.block_size;
        let mut done = 0;
        while done < len {
            let pos = start + done as u32;
            let (block, _run) = extents::map(&self.fork, pos / block_size, &mut io.overflow)?;
            let within = pos % block_size;
            let sector = io.geometry.sector_of(block, within);
            let offset = within as usize % SECTOR_SIZE;
            let n = (SECTOR_SIZE - offset).min(len - done);
            op(sector, offset, done..done + n)?;
            done += n;
        }
        Ok(())
    }

    /// Read from the mark, stopping at the logical EOF. Returns the number
    /// of bytes read, which is short only at the end of the fork.
    pub fn read(&mut self, disk: &Disk<'_>, io: &mut ForkIo<'_>, buf: &mut [u8]) -> Result<usize> {
        let available = self.logical_eof.saturating_sub(self.position) as usize;
        let count = buf.len().min(available);
        self.transfer(io, self.position, count, |sector, offset, range| {
            disk.read_at(sector, offset, &mut buf[range])
        })?;
        self.position += count as u32;
        Ok(count)
    }

    /// Write at the mark, growing the fork as needed.
    pub fn write(&mut self, disk: &Disk<'_>, io: &mut ForkIo<'_>, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        let end = self.position as u64 + data.len() as u64;
        if end > u32::MAX as u64 {
            return Err(FsError::DiskFull);
        }
        if end > self.fork.physical_eof as u64 {
            extents::extend(&io.geometry, &mut self.fork, end, io.bitmap, &mut io.overflow)?;
            self.flags |= FcbFlag::Dirty;
        }

        self.transfer(io, self.position, data.len(), |sector, offset, range| {
            disk.write_at(sector, offset, &data[range])
        })?;
        self.position = end as u32;
        if self.position > self.logical_eof {
            self.logical_eof = self.position;
            self.flags |= FcbFlag::Dirty;
        }
        Ok(data.len())
    }

    /// Set the logical EOF, allocating or releasing blocks to match.
    pub fn set_eof(&mut self, io: &mut ForkIo<'_>, len: u32) -> Result<()> {
        self.check_writable()?;
        if len > self.fork.physical_eof {
            extents::extend(&io.geometry, &mut self.fork, len as u64, io.bitmap, &mut io.overflow)?;
        } else {
            extents::truncate(&io.geometry, &mut self.fork, len as u64, io.bitmap, &mut io.overflow)?;
        }
        self.logical_eof = len;
        self.position = self.position.min(len);
        self.flags |= FcbFlag::Dirty;
        Ok(())
    }

    /// Add at least `bytes` of physical space. Returns the bytes added,
    /// which the clump size may round up.
    pub fn allocate(&mut self, io: &mut ForkIo<'_>, bytes: u32) -> Result<u32> {
        self.check_writable()?;
        let before = self.fork.physical_eof;
        let target = before as u64 + bytes as u64;
        if target > u32::MAX as u64 {
            return Err(FsError::DiskFull);
        }
        extents::extend(&io.geometry, &mut self.fork, target, io.bitmap, &mut io.overflow)?;
        self.flags |= FcbFlag::Dirty;
        Ok(self.fork.physical_eof - before)
    }

    /// Copy the EOFs and inline extents into the file's catalog record.
    pub fn store_record<S: NodeStore>(&mut self, catalog: &mut Catalog<'_, S>) -> Result<()> {
        if !self.flags.contains(FcbFlag::Dirty) {
            return Ok(());
        }
        let (_key, record) = catalog.lookup_id(self.file_id())?;
        let CatalogRecord::File(mut file) = record else {
            return Err(FsError::Corrupt);
        };
        file.set_fork(
            self.fork_type(),
            self.logical_eof,
            self.fork.physical_eof,
            self.fork.extents,
        );
        file.modify_date = mac_now();
        catalog.update(self.file_id(), &CatalogRecord::File(file))?;
        self.flags.remove(FcbFlag::Dirty);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fcb(logical: u32) -> Fcb {
        let file = FileRecord {
            file_id: 20,
            data_logical_size: logical,
            data_physical_size: logical.div_ceil(512) * 512,
            ..Default::default()
        };
        Fcb::new(1, -1, 2, b"f", &file, ForkType::Data, FcbFlag::Write.into(), 0)
    }

    #[test]
    fn seek_modes() {
        let mut f = fcb(1000);
        assert_eq!(f.seek(PosMode::FromStart, 10), Ok(10));
        assert_eq!(f.seek(PosMode::FromMark, 5), Ok(15));
        assert_eq!(f.seek(PosMode::FromLeof, -100), Ok(900));
        assert_eq!(f.seek(PosMode::AtMark, 12345), Ok(900));
        assert_eq!(f.seek(PosMode::FromStart, -1), Err(FsError::Position));
        assert_eq!(f.position, 900);
        assert_eq!(f.seek(PosMode::FromLeof, 1), Err(FsError::EndOfFile));
        assert_eq!(f.position, 1000);
    }

    #[test]
    fn open_flags_follow_the_record() {
        let mut file = FileRecord {
            file_id: 30,
            flags: hfs_types::FILE_LOCKED_FLAG,
            clump_size: 4096,
            ..Default::default()
        };
        file.rsrc_logical_size = 10;
        file.rsrc_physical_size = 512;
        let f = Fcb::new(2, -1, 2, b"r", &file, ForkType::Resource, BitFlags::empty(), 7);
        assert!(f.flags.contains(FcbFlag::Resource | FcbFlag::FileLocked | FcbFlag::OwnClump));
        assert!(!f.is_writable());
        assert_eq!((f.logical_eof, f.physical_eof()), (10, 512));
        assert_eq!(f.fork.clump_size, 4096);
        assert_eq!(f.owner, 7);
    }

    #[test]
    fn permissions_decode() {
        assert_eq!(Permission::from_raw(4), Ok(Permission::SharedReadWrite));
        assert!(Permission::ReadWrite.wants_write());
        assert!(!Permission::Read.wants_write());
        assert_eq!(Permission::from_raw(9), Err(FsError::Param));
    }
}
