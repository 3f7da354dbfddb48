//! Sizing knobs for a [`crate::FileManager`] and for freshly formatted volumes.

/// Smallest block cache the engine accepts.
pub const MIN_CACHE_BUFFERS: usize = 32;

/// Pool and cache sizes. The defaults are the classic system limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsConfig {
    /// Number of 512-byte buffers in the block cache.
    pub cache_buffers: usize,
    pub max_volumes: usize,
    pub max_open_forks: usize,
    pub max_working_dirs: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_buffers: 1024,
            max_volumes: 32,
            max_open_forks: 348,
            max_working_dirs: 40,
        }
    }
}

impl FsConfig {
    /// Clamp values that would leave the engine unusable.
    pub fn normalized(mut self) -> Self {
        self.cache_buffers = self.cache_buffers.max(MIN_CACHE_BUFFERS);
        // Reference numbers are 16-bit: forks count up from 1, volumes down
        // from -1 and working directories down from -32001.
        self.max_volumes = self.max_volumes.clamp(1, 32000);
        self.max_open_forks = self.max_open_forks.clamp(1, i16::MAX as usize);
        self.max_working_dirs = self.max_working_dirs.clamp(1, 767);
        self
    }
}

/// Parameters for [`crate::FileManager::format`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    pub volume_name: Vec<u8>,
    /// Allocation block size in bytes. `None` picks the smallest size that
    /// keeps the block count within 16 bits.
    pub block_size: Option<u32>,
    /// Default clump size in bytes.
    pub clump_size: u32,
    /// Initial size of each B-tree file, in allocation blocks.
    pub btree_blocks: u16,
}

impl FormatOptions {
    pub fn new(volume_name: impl AsRef<[u8]>) -> Self {
        Self {
            volume_name: volume_name.as_ref().to_vec(),
            ..Default::default()
        }
    }
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            volume_name: b"Untitled".to_vec(),
            block_size: None,
            clump_size: 4096,
            btree_blocks: 8,
        }
    }
}
