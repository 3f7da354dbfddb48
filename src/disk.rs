//! Sector access for one mounted volume, routed through the block cache.

use crate::cache::{BlockCache, VolumeId};
use crate::device::{DeviceHandle, PlatformHooks};
use crate::error::Result;
use hfs_types::SECTOR_SIZE;

/// Everything needed to move sectors between a volume and the cache.
#[derive(Clone, Copy)]
pub struct Disk<'a> {
    pub hooks: &'a dyn PlatformHooks,
    pub cache: &'a BlockCache,
    pub volume: VolumeId,
    pub device: DeviceHandle,
}

impl<'a> Disk<'a> {
    pub fn new(
        hooks: &'a dyn PlatformHooks,
        cache: &'a BlockCache,
        volume: VolumeId,
        device: DeviceHandle,
    ) -> Self {
        Self {
            hooks,
            cache,
            volume,
            device,
        }
    }

    pub fn read_sector(&self, sector: u32, out: &mut [u8]) -> Result<()> {
        self.cache
            .read_sector(self.hooks, self.volume, self.device, sector, out)
    }

    pub fn write_sector(&self, sector: u32, src: &[u8]) -> Result<()> {
        self.cache
            .write_sector(self.hooks, self.volume, self.device, sector, src)
    }

    /// Copy `out.len()` bytes starting `offset` bytes into `sector`. The range
    /// must not cross the sector boundary.
    pub fn read_at(&self, sector: u32, offset: usize, out: &mut [u8]) -> Result<()> {
        debug_assert!(offset + out.len() <= SECTOR_SIZE);
        let buffer = self
            .cache
            .get(self.hooks, self.volume, self.device, sector)?;
        buffer.read(offset, out);
        Ok(())
    }

    /// Overwrite part of a sector, reading the rest from disk first.
    pub fn write_at(&self, sector: u32, offset: usize, src: &[u8]) -> Result<()> {
        debug_assert!(offset + src.len() <= SECTOR_SIZE);
        if offset == 0 && src.len() == SECTOR_SIZE {
            return self.write_sector(sector, src);
        }
        let mut buffer = self
            .cache
            .get(self.hooks, self.volume, self.device, sector)?;
        buffer.write(offset, src);
        buffer.release(true);
        Ok(())
    }

    /// Push this volume's dirty buffers to the device and flush it.
    pub fn flush(&self) -> Result<()> {
        self.cache.flush_volume(self.hooks, self.volume)?;
        self.hooks.flush(self.device)
    }
}
