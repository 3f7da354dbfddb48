// SPDX-License-Identifier: MIT

//! On-disk structures of the classic Hierarchical File System, as laid out in
//! Inside Macintosh: Files > Data Organization on Volumes.
//!
//! Every multi-byte field is big-endian. Fixed-layout structures derive
//! `DekuRead`/`DekuWrite`; the variable-length catalog key is handled by hand.

#![forbid(unsafe_code)]

use deku::ctx::Endian;
use deku::prelude::*;
use std::cmp;
use std::io::{self, Cursor, Read};

/// Signature of an HFS volume, `'BD'`.
pub const HFS_SIGNATURE: u16 = u16::from_be_bytes(*b"BD");
/// Signature of a flat MFS volume. Recognised only to be refused.
pub const MFS_SIGNATURE: u16 = 0xD2D7;

/// Device sectors are always 512 bytes.
pub const SECTOR_SIZE: usize = 512;
/// The primary MDB lives in sector 2.
pub const MDB_SECTOR: u32 = 2;
/// HFS B-tree nodes are one sector each.
pub const NODE_SIZE: usize = 512;

/// Longest file or folder name, in bytes.
pub const MAX_NAME_LEN: usize = 31;
/// Longest volume name, in bytes.
pub const MAX_VOLUME_NAME_LEN: usize = 27;
/// `ckrKeyLen` of a catalog index key.
pub const CATALOG_KEY_MAX_LEN: u8 = 37;
/// `xkrKeyLen` of every extent key.
pub const EXTENT_KEY_LEN: u8 = 7;

/// Seconds between 1904-01-01 and 1970-01-01.
pub const MAC_EPOCH_OFFSET: u64 = 2_082_844_800;

/// Catalog Node ID, identifying a file or folder on a volume.
pub type CatalogNodeId = u32;

pub const ROOT_PARENT_ID: CatalogNodeId = 1;
pub const ROOT_FOLDER_ID: CatalogNodeId = 2;
pub const EXTENTS_FILE_ID: CatalogNodeId = 3;
pub const CATALOG_FILE_ID: CatalogNodeId = 4;
pub const BAD_BLOCKS_FILE_ID: CatalogNodeId = 5;
pub const FIRST_USER_ID: CatalogNodeId = 16;

/// Convert a Unix timestamp to seconds since 1904.
pub fn mac_date_from_unix(unix_seconds: u64) -> u32 {
    (unix_seconds + MAC_EPOCH_OFFSET) as u32
}

/// Borrow the contents of a length-prefixed Pascal string.
pub fn pascal_bytes(raw: &[u8]) -> &[u8] {
    match raw.split_first() {
        Some((&len, rest)) => &rest[..cmp::min(len as usize, rest.len())],
        None => &[],
    }
}

/// Build a fixed-size Pascal string, truncating to fit.
pub fn to_pascal<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let len = cmp::min(bytes.len(), N - 1);
    out[0] = len as u8;
    out[1..=len].copy_from_slice(&bytes[..len]);
    out
}

/// Run of contiguous allocation blocks. Defined as `ExtDescriptor`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: Endian")]
pub struct ExtentDescriptor {
    pub start_block: u16,
    pub block_count: u16,
}

impl ExtentDescriptor {
    pub const fn new(start_block: u16, block_count: u16) -> Self {
        Self {
            start_block,
            block_count,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.block_count == 0
    }

    /// First allocation block past the end of the run.
    pub const fn end(&self) -> u32 {
        self.start_block as u32 + self.block_count as u32
    }
}

/// Three extents, as stored inline in the MDB, catalog file records and
/// extents overflow records. Defined as `ExtDataRec`.
pub type ExtentRecord = [ExtentDescriptor; 3];

/// Values of `xkrFkType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: Endian", type = "u8")]
#[repr(u8)]
pub enum ForkType {
    #[deku(id = "0x00")]
    Data = 0x00,
    #[deku(id = "0xFF")]
    Resource = 0xFF,
}

/// Key of an extents overflow record, without its leading `xkrKeyLen` byte.
/// Defined as `ExtKeyRec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct ExtentKey {
    pub fork_type: ForkType,
    pub file_id: CatalogNodeId,
    pub start_block: u16,
}

/// Data of an extents overflow leaf record. Defined as `ExtDataRec`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct ExtentDataRecord {
    pub extents: ExtentRecord,
}

/// Master Directory Block, found in sector 2 of the volume and mirrored in
/// the second-to-last sector. Defined as `MDB` in Inside Macintosh: Files.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct MasterDirectoryBlock {
    /// `drSigWord`
    pub signature: u16,
    pub create_date: u32,
    pub modify_date: u32,
    /// `drAtrb`
    pub attributes: u16,
    /// `drNmFls`, files in the root folder.
    pub root_files: u16,
    /// `drVBMSt`, first sector of the volume bitmap.
    pub bitmap_start: u16,
    /// `drAllocPtr`, where the next allocation search starts.
    pub alloc_ptr: u16,
    /// `drNmAlBlks`
    pub total_blocks: u16,
    /// `drAlBlkSiz`, always a multiple of 512.
    pub block_size: u32,
    /// `drClpSiz`, default clump size in bytes.
    pub clump_size: u32,
    /// `drAlBlSt`, sector of allocation block 0.
    pub alloc_start: u16,
    /// `drNxtCNID`
    pub next_cnid: CatalogNodeId,
    /// `drFreeBks`
    pub free_blocks: u16,
    /// `drVN`, Pascal string.
    pub volume_name: [u8; 28],
    pub backup_date: u32,
    pub sequence: u16,
    pub write_count: u32,
    pub extents_clump: u32,
    pub catalog_clump: u32,
    /// `drNmRtDirs`, folders in the root folder.
    pub root_dirs: u16,
    pub file_count: u32,
    pub folder_count: u32,
    pub finder_info: [u32; 8],
    pub cache_size: u16,
    pub bitmap_cache_size: u16,
    pub common_cache_size: u16,
    pub extents_size: u32,
    pub extents_extents: ExtentRecord,
    pub catalog_size: u32,
    pub catalog_extents: ExtentRecord,
}

impl MasterDirectoryBlock {
    pub const SIZE: usize = 162;

    pub fn name(&self) -> &[u8] {
        pascal_bytes(&self.volume_name)
    }

    pub fn set_name(&mut self, name: &[u8]) {
        self.volume_name = to_pascal(name);
    }

    /// Sectors per allocation block.
    pub fn sectors_per_block(&self) -> u32 {
        self.block_size / SECTOR_SIZE as u32
    }
}

impl Default for MasterDirectoryBlock {
    fn default() -> Self {
        Self {
            signature: HFS_SIGNATURE,
            create_date: 0,
            modify_date: 0,
            attributes: 0,
            root_files: 0,
            bitmap_start: 3,
            alloc_ptr: 0,
            total_blocks: 0,
            block_size: SECTOR_SIZE as u32,
            clump_size: 0,
            alloc_start: 0,
            next_cnid: FIRST_USER_ID,
            free_blocks: 0,
            volume_name: [0; 28],
            backup_date: 0,
            sequence: 0,
            write_count: 0,
            extents_clump: 0,
            catalog_clump: 0,
            root_dirs: 0,
            file_count: 0,
            folder_count: 0,
            finder_info: [0; 8],
            cache_size: 0,
            bitmap_cache_size: 0,
            common_cache_size: 0,
            extents_size: 0,
            extents_extents: ExtentRecord::default(),
            catalog_size: 0,
            catalog_extents: ExtentRecord::default(),
        }
    }
}

/// B-tree node descriptor, the first 14 bytes of every node.
/// Defined as `NodeDescriptor`.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct NodeDescriptor {
    pub forward_link: u32,
    pub backward_link: u32,
    pub kind: NodeKind,
    pub height: u8,
    pub num_records: u16,
    pub reserved: u16,
}

impl NodeDescriptor {
    pub const SIZE: usize = 14;

    pub fn new(kind: NodeKind, height: u8) -> Self {
        Self {
            forward_link: 0,
            backward_link: 0,
            kind,
            height,
            num_records: 0,
            reserved: 0,
        }
    }
}

/// Known values for `ndType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: Endian", type = "i8")]
#[repr(i8)]
pub enum NodeKind {
    #[deku(id = "-1")]
    Leaf = -1,
    #[deku(id = "0")]
    Index = 0,
    #[deku(id = "1")]
    Header = 1,
    #[deku(id = "2")]
    Map = 2,
}

/// First record of a B-tree header node. Defined as `BTHdrRec`.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct HeaderRecord {
    pub depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf: u32,
    pub last_leaf: u32,
    pub node_size: u16,
    pub max_key_len: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub reserved: [u8; 76],
}

impl HeaderRecord {
    pub const SIZE: usize = 106;

    pub fn empty(max_key_len: u16, total_nodes: u32) -> Self {
        Self {
            depth: 0,
            root_node: 0,
            leaf_records: 0,
            first_leaf: 0,
            last_leaf: 0,
            node_size: NODE_SIZE as u16,
            max_key_len,
            total_nodes,
            free_nodes: total_nodes.saturating_sub(1),
            reserved: [0; 76],
        }
    }
}

/// Size of the user data record that follows the header record.
pub const USER_RECORD_SIZE: usize = 128;

/// Catalog key without its `ckrKeyLen` byte. Defined as `CatKeyRec`.
///
/// On disk: reserved byte, parent ID, then the name as a Pascal string. Leaf
/// keys are as long as the name requires; index keys are zero-padded to
/// [`CATALOG_KEY_MAX_LEN`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogKey {
    pub parent_id: CatalogNodeId,
    pub name: Vec<u8>,
}

impl CatalogKey {
    pub fn new(parent_id: CatalogNodeId, name: &[u8]) -> Self {
        Self {
            parent_id,
            name: name.to_vec(),
        }
    }

    /// Key of the thread record of `id`.
    pub fn thread(id: CatalogNodeId) -> Self {
        Self::new(id, &[])
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.name.len());
        out.push(0);
        out.extend_from_slice(&self.parent_id.to_be_bytes());
        out.push(self.name.len() as u8);
        out.extend_from_slice(&self.name);
        out
    }
}

impl TryFrom<&[u8]> for CatalogKey {
    type Error = io::Error;

    /// Read a key from its bytes. Trailing index-key padding is ignored.
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let mut cur = Cursor::new(value);

        let mut reserved = [0u8; 1];
        cur.read_exact(&mut reserved)?;

        let mut buf = [0u8; 4];
        cur.read_exact(&mut buf)?;
        let parent_id = CatalogNodeId::from_be_bytes(buf);

        let mut len = [0u8; 1];
        cur.read_exact(&mut len)?;
        if len[0] as usize > MAX_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "catalog name longer than 31 bytes",
            ));
        }

        let mut name = vec![0u8; len[0] as usize];
        cur.read_exact(&mut name)?;

        Ok(Self { parent_id, name })
    }
}

/// Finder information for a file. Defined as `FInfo`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: Endian")]
pub struct FinderInfo {
    pub file_type: u32,
    pub creator: u32,
    pub flags: u16,
    pub location_v: i16,
    pub location_h: i16,
    pub folder: i16,
}

/// Catalog folder record, after the record type byte. Defined as
/// `cdrDirRec`.
#[derive(Debug, Default, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: Endian")]
pub struct FolderRecord {
    pub reserved: u8,
    pub flags: u16,
    /// `dirVal`, number of direct children.
    pub valence: u16,
    pub folder_id: CatalogNodeId,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    /// `dirUsrInfo` (DInfo)
    pub user_info: [u8; 16],
    /// `dirFndrInfo` (DXInfo)
    pub finder_info: [u8; 16],
    pub reserved2: [u32; 4],
}

/// `filFlags` bit marking a file as locked.
pub const FILE_LOCKED_FLAG: u8 = 0x01;

/// Catalog file record, after the record type byte. Defined as
/// `cdrFilRec`.
#[derive(Debug, Default, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: Endian")]
pub struct FileRecord {
    pub reserved: u8,
    pub flags: u8,
    pub file_type: u8,
    pub user_info: FinderInfo,
    pub file_id: CatalogNodeId,
    pub data_start_block: u16,
    pub data_logical_size: u32,
    pub data_physical_size: u32,
    pub rsrc_start_block: u16,
    pub rsrc_logical_size: u32,
    pub rsrc_physical_size: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    /// `filFndrInfo` (FXInfo)
    pub finder_info: [u8; 16],
    pub clump_size: u16,
    pub data_extents: ExtentRecord,
    pub rsrc_extents: ExtentRecord,
    pub reserved2: u32,
}

impl FileRecord {
    pub fn is_locked(&self) -> bool {
        self.flags & FILE_LOCKED_FLAG != 0
    }

    /// Logical size, physical size and inline extents of one fork.
    pub fn fork(&self, fork: ForkType) -> (u32, u32, ExtentRecord) {
        match fork {
            ForkType::Data => (
                self.data_logical_size,
                self.data_physical_size,
                self.data_extents,
            ),
            ForkType::Resource => (
                self.rsrc_logical_size,
                self.rsrc_physical_size,
                self.rsrc_extents,
            ),
        }
    }

    pub fn set_fork(&mut self, fork: ForkType, logical: u32, physical: u32, extents: ExtentRecord) {
        match fork {
            ForkType::Data => {
                self.data_logical_size = logical;
                self.data_physical_size = physical;
                self.data_extents = extents;
                self.data_start_block = extents[0].start_block;
            }
            ForkType::Resource => {
                self.rsrc_logical_size = logical;
                self.rsrc_physical_size = physical;
                self.rsrc_extents = extents;
                self.rsrc_start_block = extents[0].start_block;
            }
        }
    }
}

/// Catalog thread record, after the record type byte. Defined as
/// `cdrThdRec`.
#[derive(Debug, Default, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: Endian")]
pub struct ThreadRecord {
    pub reserved: u8,
    pub reserved2: [u32; 2],
    pub parent_id: CatalogNodeId,
    /// `thdCName`, Pascal string.
    pub name: [u8; 32],
}

impl ThreadRecord {
    pub fn new(parent_id: CatalogNodeId, name: &[u8]) -> Self {
        Self {
            parent_id,
            name: to_pascal(name),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &[u8] {
        pascal_bytes(&self.name)
    }
}

/// Catalog leaf record, tagged by `cdrType`.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big", type = "u8")]
pub enum CatalogRecord {
    #[deku(id = "1")]
    Folder(FolderRecord),
    #[deku(id = "2")]
    File(FileRecord),
    #[deku(id = "3")]
    FolderThread(ThreadRecord),
    #[deku(id = "4")]
    FileThread(ThreadRecord),
}

impl CatalogRecord {
    /// CNID of the folder or file this record describes. Threads have none.
    pub fn id(&self) -> Option<CatalogNodeId> {
        match self {
            CatalogRecord::Folder(folder) => Some(folder.folder_id),
            CatalogRecord::File(file) => Some(file.file_id),
            _ => None,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, CatalogRecord::Folder(_))
    }

    pub fn thread(&self) -> Option<&ThreadRecord> {
        match self {
            CatalogRecord::FolderThread(thread) | CatalogRecord::FileThread(thread) => Some(thread),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_disk_layout() {
        let mdb = MasterDirectoryBlock::default();
        assert_eq!(mdb.to_bytes().unwrap().len(), MasterDirectoryBlock::SIZE);

        let header = HeaderRecord::empty(CATALOG_KEY_MAX_LEN as u16, 8);
        assert_eq!(header.to_bytes().unwrap().len(), HeaderRecord::SIZE);

        let desc = NodeDescriptor::new(NodeKind::Leaf, 1);
        assert_eq!(desc.to_bytes().unwrap().len(), NodeDescriptor::SIZE);

        let folder = CatalogRecord::Folder(FolderRecord::default());
        assert_eq!(folder.to_bytes().unwrap().len(), 70);
        let file = CatalogRecord::File(FileRecord::default());
        assert_eq!(file.to_bytes().unwrap().len(), 102);
        let thread = CatalogRecord::FileThread(ThreadRecord::new(2, b"Read Me"));
        assert_eq!(thread.to_bytes().unwrap().len(), 46);
    }

    #[test]
    fn mdb_fields_land_at_documented_offsets() {
        let mut mdb = MasterDirectoryBlock::default();
        mdb.total_blocks = 0x1234;
        mdb.next_cnid = 0x0102_0304;
        mdb.set_name(b"Macintosh HD");
        mdb.catalog_extents[0] = ExtentDescriptor::new(7, 9);

        let bytes = mdb.to_bytes().unwrap();
        assert_eq!(&bytes[0..2], b"BD");
        assert_eq!(&bytes[18..20], &[0x12, 0x34]);
        assert_eq!(&bytes[30..34], &[1, 2, 3, 4]);
        assert_eq!(bytes[36], 12);
        assert_eq!(&bytes[37..49], b"Macintosh HD");
        assert_eq!(&bytes[150..154], &[0, 7, 0, 9]);

        let (_rest, parsed) = MasterDirectoryBlock::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(parsed, mdb);
        assert_eq!(parsed.name(), b"Macintosh HD");
    }

    #[test]
    fn leaf_descriptor_parses() {
        let raw = [0, 0, 0, 5, 0, 0, 0, 3, 0xFF, 1, 0, 4, 0, 0];
        let (_rest, desc) = NodeDescriptor::from_bytes((&raw, 0)).unwrap();
        assert_eq!(desc.forward_link, 5);
        assert_eq!(desc.backward_link, 3);
        assert_eq!(desc.kind, NodeKind::Leaf);
        assert_eq!(desc.num_records, 4);
    }

    #[test]
    fn catalog_key_ignores_index_padding() {
        let key = CatalogKey::new(ROOT_FOLDER_ID, b"System");
        let mut bytes = key.to_bytes();
        assert_eq!(bytes, [0, 0, 0, 0, 2, 6, b'S', b'y', b's', b't', b'e', b'm']);

        bytes.resize(CATALOG_KEY_MAX_LEN as usize, 0);
        assert_eq!(CatalogKey::try_from(bytes.as_slice()).unwrap(), key);
        assert!(CatalogKey::try_from(&bytes[..4]).is_err());
    }

    #[test]
    fn thread_record_round_trips_name() {
        let record = CatalogRecord::FolderThread(ThreadRecord::new(ROOT_FOLDER_ID, b"Docs"));
        let bytes = record.to_bytes().unwrap();
        assert_eq!(bytes[0], 3);

        let (_rest, parsed) = CatalogRecord::from_bytes((&bytes, 0)).unwrap();
        let thread = parsed.thread().unwrap();
        assert_eq!(thread.parent_id, ROOT_FOLDER_ID);
        assert_eq!(thread.name(), b"Docs");
    }

    #[test]
    fn extent_key_layout() {
        let key = ExtentKey {
            fork_type: ForkType::Resource,
            file_id: 17,
            start_block: 3,
        };
        assert_eq!(key.to_bytes().unwrap(), [0xFF, 0, 0, 0, 17, 0, 3]);
    }
}
