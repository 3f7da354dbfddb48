#![forbid(unsafe_code)]

//! File Manager engine for classic HFS volumes.
//!
//! A [`FileManager`] owns the control-block pools, the shared block cache and
//! the injected [`PlatformHooks`]. Its methods are the toolbox-style calls
//! (open, read, create, mount, ...), and [`pb`] layers the parameter-block
//! entry points on top. On-disk structures live in the `hfs-types` crate.
//!
//! ```no_run
//! use hfsfm::{DiskImages, FileManager, FormatOptions, FsConfig, Permission};
//! use std::sync::Arc;
//!
//! let images = Arc::new(DiskImages::new());
//! images.insert_blank(1, 1 << 20);
//! let fm = FileManager::new(images, FsConfig::default());
//! fm.format(1, &FormatOptions::new("Scratch"))?;
//! let vref = fm.mount(1)?;
//! fm.create(vref, 0, b"Read Me", u32::from_be_bytes(*b"ttxt"), u32::from_be_bytes(*b"TEXT"))?;
//! let refnum = fm.open(vref, b"Read Me", Permission::ReadWrite)?;
//! fm.write(refnum, b"hello")?;
//! fm.close(refnum)?;
//! fm.unmount(vref)?;
//! # Ok::<(), hfsfm::FsError>(())
//! ```

pub mod bitmap;
pub mod btree;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod device;
pub mod disk;
pub mod error;
pub mod extents;
pub mod fcb;
pub mod manager;
pub mod pb;
pub mod pool;
pub mod treefile;
pub mod volume;

pub use cache::{CacheStats, VolumeId};
pub use config::{FormatOptions, FsConfig};
pub use device::{DeviceHandle, DiskImages, PlatformHooks};
pub use error::{FsError, NO_ERR, OsErr, Result, error_string};
pub use fcb::{FcbFlag, Permission, PosMode, RefNum};
pub use hfs_types;
pub use manager::{
    CatEntry, CatInfo, CatSelector, FcbInfo, FileManager, FsSpec, FsStats, WD_REFNUM_BASE,
    WorkingDir, is_wd_refnum,
};
pub use volume::{VolumeFlag, VolumeInfo};
