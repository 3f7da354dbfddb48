//! Platform I/O hooks.
//!
//! The engine never touches storage directly. A [`PlatformHooks`]
//! implementation is injected into the [`crate::FileManager`] and every sector
//! transfer goes through it, addressed by byte offset on an opaque device
//! handle. [`DiskImages`] is a ready-made implementation backed by in-memory
//! buffers or image files.

use crate::error::{FsError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Opaque handle returned by [`PlatformHooks::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

/// Raw device access consumed by the engine.
pub trait PlatformHooks: Send + Sync {
    fn open(&self, drive: u16) -> Result<DeviceHandle>;
    fn close(&self, device: DeviceHandle) -> Result<()>;
    fn read(&self, device: DeviceHandle, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write(&self, device: DeviceHandle, offset: u64, buf: &[u8]) -> Result<()>;
    fn flush(&self, device: DeviceHandle) -> Result<()>;
    fn eject(&self, device: DeviceHandle) -> Result<()>;

    /// Size of the medium in bytes.
    fn size(&self, device: DeviceHandle) -> Result<u64>;

    fn is_write_protected(&self, _device: DeviceHandle) -> bool {
        false
    }
}

enum Backing {
    Memory(Vec<u8>),
    File(File),
}

struct Drive {
    backing: Backing,
    len: u64,
    write_protected: bool,
    ejected: bool,
    open: bool,
}

impl Drive {
    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if self.ejected {
            return Err(FsError::VolumeOffline);
        }
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(FsError::Io),
        }
    }
}

/// Drive table mapping drive numbers to disk images.
#[derive(Default)]
pub struct DiskImages {
    drives: Mutex<HashMap<u16, Drive>>,
}

impl DiskImages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a zero-filled in-memory disk of `len` bytes.
    pub fn insert_blank(&self, drive: u16, len: usize) {
        self.insert_memory(drive, vec![0u8; len]);
    }

    pub fn insert_memory(&self, drive: u16, image: Vec<u8>) {
        let len = image.len() as u64;
        self.drives.lock().insert(
            drive,
            Drive {
                backing: Backing::Memory(image),
                len,
                write_protected: false,
                ejected: false,
                open: false,
            },
        );
    }

    /// Attach an image file. Read-only images mount write-protected.
    pub fn insert_file(&self, drive: u16, path: impl AsRef<Path>, writable: bool) -> Result<()> {
        let file = File::options().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len();
        self.drives.lock().insert(
            drive,
            Drive {
                backing: Backing::File(file),
                len,
                write_protected: !writable,
                ejected: false,
                open: false,
            },
        );
        Ok(())
    }

    pub fn set_write_protected(&self, drive: u16, protected: bool) {
        if let Some(d) = self.drives.lock().get_mut(&drive) {
            d.write_protected = protected;
        }
    }

    /// Copy of an in-memory image, for inspection.
    pub fn snapshot(&self, drive: u16) -> Option<Vec<u8>> {
        match self.drives.lock().get(&drive).map(|d| &d.backing) {
            Some(Backing::Memory(image)) => Some(image.clone()),
            _ => None,
        }
    }

    /// Remove a drive, returning an in-memory image.
    pub fn remove(&self, drive: u16) -> Option<Vec<u8>> {
        match self.drives.lock().remove(&drive).map(|d| d.backing) {
            Some(Backing::Memory(image)) => Some(image),
            _ => None,
        }
    }

    pub fn is_ejected(&self, drive: u16) -> bool {
        self.drives.lock().get(&drive).is_some_and(|d| d.ejected)
    }

    fn drive_number(device: DeviceHandle) -> u16 {
        device.0 as u16
    }
}

impl PlatformHooks for DiskImages {
    fn open(&self, drive: u16) -> Result<DeviceHandle> {
        let mut drives = self.drives.lock();
        let d = drives.get_mut(&drive).ok_or(FsError::NoSuchVolume)?;
        if d.ejected {
            return Err(FsError::VolumeOffline);
        }
        d.open = true;
        Ok(DeviceHandle(drive as u32))
    }

    fn close(&self, device: DeviceHandle) -> Result<()> {
        if let Some(d) = self.drives.lock().get_mut(&Self::drive_number(device)) {
            d.open = false;
        }
        Ok(())
    }

    fn read(&self, device: DeviceHandle, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut drives = self.drives.lock();
        let d = drives
            .get_mut(&Self::drive_number(device))
            .ok_or(FsError::NoSuchVolume)?;
        d.check_range(offset, buf.len())?;
        match &mut d.backing {
            Backing::Memory(image) => {
                let start = offset as usize;
                buf.copy_from_slice(&image[start..start + buf.len()]);
            }
            Backing::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(buf)?;
            }
        }
        Ok(())
    }

    fn write(&self, device: DeviceHandle, offset: u64, buf: &[u8]) -> Result<()> {
        let mut drives = self.drives.lock();
        let d = drives
            .get_mut(&Self::drive_number(device))
            .ok_or(FsError::NoSuchVolume)?;
        if d.write_protected {
            return Err(FsError::WriteProtected);
        }
        d.check_range(offset, buf.len())?;
        match &mut d.backing {
            Backing::Memory(image) => {
                let start = offset as usize;
                image[start..start + buf.len()].copy_from_slice(buf);
            }
            Backing::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(buf)?;
            }
        }
        Ok(())
    }

    fn flush(&self, device: DeviceHandle) -> Result<()> {
        let mut drives = self.drives.lock();
        if let Some(Drive {
            backing: Backing::File(file),
            write_protected: false,
            ..
        }) = drives.get_mut(&Self::drive_number(device))
        {
            file.sync_data()?;
        }
        Ok(())
    }

    fn eject(&self, device: DeviceHandle) -> Result<()> {
        let mut drives = self.drives.lock();
        let d = drives
            .get_mut(&Self::drive_number(device))
            .ok_or(FsError::NoSuchVolume)?;
        d.ejected = true;
        Ok(())
    }

    fn size(&self, device: DeviceHandle) -> Result<u64> {
        self.drives
            .lock()
            .get(&Self::drive_number(device))
            .map(|d| d.len)
            .ok_or(FsError::NoSuchVolume)
    }

    fn is_write_protected(&self, device: DeviceHandle) -> bool {
        self.drives
            .lock()
            .get(&Self::drive_number(device))
            .is_some_and(|d| d.write_protected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_drive_reads_back_writes() {
        let disks = DiskImages::new();
        disks.insert_blank(1, 4096);
        let dev = disks.open(1).unwrap();

        disks.write(dev, 1000, b"hello").unwrap();
        let mut buf = [0u8; 5];
        disks.read(dev, 1000, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(disks.size(dev).unwrap(), 4096);
    }

    #[test]
    fn out_of_range_and_protection() {
        let disks = DiskImages::new();
        disks.insert_blank(1, 1024);
        let dev = disks.open(1).unwrap();

        let mut buf = [0u8; 512];
        assert_eq!(disks.read(dev, 1000, &mut buf), Err(FsError::Io));

        disks.set_write_protected(1, true);
        assert_eq!(disks.write(dev, 0, &buf), Err(FsError::WriteProtected));
        assert!(disks.is_write_protected(dev));
    }

    #[test]
    fn ejected_drive_goes_offline() {
        let disks = DiskImages::new();
        disks.insert_blank(3, 1024);
        let dev = disks.open(3).unwrap();
        disks.eject(dev).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(disks.read(dev, 0, &mut buf), Err(FsError::VolumeOffline));
        assert_eq!(disks.open(3), Err(FsError::VolumeOffline));
        assert!(disks.is_ejected(3));
        assert_eq!(disks.open(9), Err(FsError::NoSuchVolume));
    }

    #[test]
    fn file_backed_drive() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 2048]).unwrap();
        tmp.flush().unwrap();

        let disks = DiskImages::new();
        disks.insert_file(2, tmp.path(), true).unwrap();
        let dev = disks.open(2).unwrap();
        disks.write(dev, 512, b"sector one").unwrap();
        disks.flush(dev).unwrap();

        let mut buf = [0u8; 10];
        disks.read(dev, 512, &mut buf).unwrap();
        assert_eq!(&buf, b"sector one");
    }
}
