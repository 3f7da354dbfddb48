//! Catalog manager: folders, files and their thread records over the catalog
//! B-tree.
//!
//! Every folder or file record is keyed by `(parent ID, name)`. Each one has a
//! thread record keyed by `(own ID, "")` that points back at its parent and
//! name, which is how entries are found by CNID.

use crate::btree::{BTree, NodeStore};
use crate::error::{FsError, Result};
use deku::prelude::*;
use hfs_types::{
    CatalogKey, CatalogNodeId, CatalogRecord, FileRecord, FinderInfo, FolderRecord,
    MasterDirectoryBlock, MAX_NAME_LEN, MAX_VOLUME_NAME_LEN, ROOT_FOLDER_ID, ROOT_PARENT_ID,
    ThreadRecord, mac_date_from_unix,
};
use log::{debug, trace};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as a Macintosh date.
pub fn mac_now() -> u32 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    mac_date_from_unix(unix)
}

/// Split raw catalog key bytes into parent ID and name. Index-key padding
/// after the name is ignored.
fn key_parts(key: &[u8]) -> (u32, &[u8]) {
    let parent = key
        .get(1..5)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .unwrap_or(0);
    let len = key.get(5).copied().unwrap_or(0) as usize;
    let name = key.get(6..).unwrap_or(&[]);
    (parent, &name[..len.min(name.len())])
}

/// Catalog key order: parent ID, then the name compared byte by byte after
/// ASCII upper-casing, a shorter prefix sorting first.
pub fn compare_catalog_keys(a: &[u8], b: &[u8]) -> Ordering {
    let (a_parent, a_name) = key_parts(a);
    let (b_parent, b_name) = key_parts(b);
    a_parent.cmp(&b_parent).then_with(|| {
        a_name
            .iter()
            .map(u8::to_ascii_uppercase)
            .cmp(b_name.iter().map(u8::to_ascii_uppercase))
    })
}

/// Names must be non-empty, fit a Pascal string of 31 bytes and contain no
/// path separator.
pub fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.contains(&b':') {
        return Err(FsError::BadName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::Param);
    }
    Ok(())
}

fn key(parent: CatalogNodeId, name: &[u8]) -> Vec<u8> {
    CatalogKey::new(parent, name).to_bytes()
}

fn decode(data: &[u8]) -> Result<CatalogRecord> {
    let (_rest, record) = CatalogRecord::from_bytes((data, 0))?;
    Ok(record)
}

/// A fresh folder record with all dates set to now.
pub fn new_folder_record() -> CatalogRecord {
    let now = mac_now();
    CatalogRecord::Folder(FolderRecord {
        create_date: now,
        modify_date: now,
        ..Default::default()
    })
}

/// A fresh file record with empty forks.
pub fn new_file_record(file_type: u32, creator: u32) -> CatalogRecord {
    let now = mac_now();
    CatalogRecord::File(FileRecord {
        user_info: FinderInfo {
            file_type,
            creator,
            ..Default::default()
        },
        create_date: now,
        modify_date: now,
        ..Default::default()
    })
}

/// Catalog operations over one volume's catalog tree. Counters kept in the
/// MDB (next CNID, file and folder counts) are maintained here.
pub struct Catalog<'a, S: NodeStore> {
    tree: &'a mut BTree,
    store: S,
    mdb: &'a mut MasterDirectoryBlock,
}

impl<'a, S: NodeStore> Catalog<'a, S> {
    pub fn new(tree: &'a mut BTree, store: S, mdb: &'a mut MasterDirectoryBlock) -> Self {
        Self { tree, store, mdb }
    }

    /// Insert the root folder and its thread into an empty catalog.
    pub fn create_root(&mut self, volume_name: &[u8]) -> Result<()> {
        if volume_name.is_empty() {
            return Err(FsError::BadName);
        }
        if volume_name.len() > MAX_VOLUME_NAME_LEN {
            return Err(FsError::Param);
        }
        let mut root = new_folder_record();
        if let CatalogRecord::Folder(folder) = &mut root {
            folder.folder_id = ROOT_FOLDER_ID;
        }
        let thread = CatalogRecord::FolderThread(ThreadRecord::new(ROOT_PARENT_ID, volume_name));
        self.tree.insert(
            &mut self.store,
            &key(ROOT_PARENT_ID, volume_name),
            &root.to_bytes()?,
        )?;
        self.tree.insert(
            &mut self.store,
            &CatalogKey::thread(ROOT_FOLDER_ID).to_bytes(),
            &thread.to_bytes()?,
        )
    }

    fn get(&mut self, key: &[u8]) -> Result<CatalogRecord> {
        decode(&self.tree.search(&mut self.store, key)?)
    }

    /// The folder or file named `name` in `dir`. An empty name resolves the
    /// folder `dir` itself.
    pub fn lookup(&mut self, dir: CatalogNodeId, name: &[u8]) -> Result<CatalogRecord> {
        if name.is_empty() {
            return Ok(CatalogRecord::Folder(self.folder(dir)?));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::Param);
        }
        self.get(&key(dir, name)).map_err(|err| match err {
            FsError::RecordNotFound => FsError::FileNotFound,
            other => other,
        })
    }

    /// Thread record of a folder or file.
    pub fn thread(&mut self, id: CatalogNodeId) -> Result<ThreadRecord> {
        let record = self
            .get(&CatalogKey::thread(id).to_bytes())
            .map_err(|err| match err {
                FsError::RecordNotFound => FsError::FileNotFound,
                other => other,
            })?;
        record.thread().cloned().ok_or(FsError::Corrupt)
    }

    /// Key and record of the entry with CNID `id`.
    pub fn lookup_id(&mut self, id: CatalogNodeId) -> Result<(CatalogKey, CatalogRecord)> {
        let thread = self.thread(id)?;
        let key = CatalogKey::new(thread.parent_id, thread.name());
        let record = self.get(&key.to_bytes()).map_err(|err| match err {
            FsError::RecordNotFound => FsError::Corrupt,
            other => other,
        })?;
        Ok((key, record))
    }

    /// Folder record of directory `id`.
    pub fn folder(&mut self, id: CatalogNodeId) -> Result<FolderRecord> {
        match self.lookup_id(id) {
            Ok((_, CatalogRecord::Folder(folder))) => Ok(folder),
            Ok(_) | Err(FsError::FileNotFound) => Err(FsError::DirNotFound),
            Err(err) => Err(err),
        }
    }

    /// Overwrite the record of entry `id`, keeping its key.
    pub fn update(&mut self, id: CatalogNodeId, record: &CatalogRecord) -> Result<()> {
        let (key, existing) = self.lookup_id(id)?;
        if existing.is_folder() != record.is_folder() {
            return Err(FsError::Param);
        }
        self.tree
            .replace(&mut self.store, &key.to_bytes(), &record.to_bytes()?)
    }

    fn adjust_valence(&mut self, dir: CatalogNodeId, delta: i32) -> Result<()> {
        let mut folder = self.folder(dir)?;
        folder.valence = (folder.valence as i32 + delta).clamp(0, u16::MAX as i32) as u16;
        folder.modify_date = mac_now();
        self.update(dir, &CatalogRecord::Folder(folder))
    }

    fn adjust_counts(&mut self, dir: CatalogNodeId, is_folder: bool, delta: i32) {
        let bump = |value: &mut u32| *value = (*value as i64 + delta as i64).max(0) as u32;
        let bump16 = |value: &mut u16| *value = (*value as i32 + delta).max(0) as u16;
        if is_folder {
            bump(&mut self.mdb.folder_count);
            if dir == ROOT_FOLDER_ID {
                bump16(&mut self.mdb.root_dirs);
            }
        } else {
            bump(&mut self.mdb.file_count);
            if dir == ROOT_FOLDER_ID {
                bump16(&mut self.mdb.root_files);
            }
        }
        self.mdb.modify_date = mac_now();
    }

    /// Add a folder or file record under `dir` with a fresh CNID, plus its
    /// thread record. Returns the new CNID.
    pub fn create(
        &mut self,
        dir: CatalogNodeId,
        name: &[u8],
        mut record: CatalogRecord,
    ) -> Result<CatalogNodeId> {
        check_name(name)?;
        self.folder(dir)?;

        let id = self.mdb.next_cnid;
        let thread = ThreadRecord::new(dir, name);
        let thread = match &mut record {
            CatalogRecord::Folder(folder) => {
                folder.folder_id = id;
                folder.valence = 0;
                CatalogRecord::FolderThread(thread)
            }
            CatalogRecord::File(file) => {
                file.file_id = id;
                CatalogRecord::FileThread(thread)
            }
            _ => return Err(FsError::Param),
        };

        let primary = key(dir, name);
        let thread_key = CatalogKey::thread(id).to_bytes();
        self.tree.insert(&mut self.store, &primary, &record.to_bytes()?)?;
        if let Err(err) = self
            .tree
            .insert(&mut self.store, &thread_key, &thread.to_bytes()?)
        {
            let _ = self.tree.delete(&mut self.store, &primary);
            return Err(err);
        }
        if let Err(err) = self.adjust_valence(dir, 1) {
            let _ = self.tree.delete(&mut self.store, &thread_key);
            let _ = self.tree.delete(&mut self.store, &primary);
            return Err(err);
        }

        self.mdb.next_cnid = id + 1;
        self.adjust_counts(dir, record.is_folder(), 1);
        trace!("created catalog entry {id} in {dir}");
        Ok(id)
    }

    /// Remove an entry and its thread. Returns the removed record so the
    /// caller can release a file's blocks.
    pub fn delete(&mut self, dir: CatalogNodeId, name: &[u8]) -> Result<CatalogRecord> {
        check_name(name)?;
        let primary = key(dir, name);
        let record = self.lookup(dir, name)?;
        let id = match &record {
            CatalogRecord::Folder(folder) if folder.folder_id == ROOT_FOLDER_ID => {
                return Err(FsError::FileBusy);
            }
            CatalogRecord::Folder(folder) if folder.valence > 0 => return Err(FsError::FileBusy),
            CatalogRecord::File(file) if file.is_locked() => return Err(FsError::FileLocked),
            other => other.id().ok_or(FsError::Corrupt)?,
        };

        self.tree.delete(&mut self.store, &primary)?;
        if let Err(err) = self
            .tree
            .delete(&mut self.store, &CatalogKey::thread(id).to_bytes())
        {
            debug!("thread record of {id} not removed: {err}");
        }

        self.adjust_valence(dir, -1)?;
        self.adjust_counts(dir, record.is_folder(), -1);
        Ok(record)
    }

    /// Re-key an entry, putting the original record back if the new key
    /// cannot be inserted, then point its thread at the new key.
    fn rekey(
        &mut self,
        id: CatalogNodeId,
        old_key: &[u8],
        new_parent: CatalogNodeId,
        new_name: &[u8],
        record: &CatalogRecord,
    ) -> Result<()> {
        let data = record.to_bytes()?;
        let new_key = key(new_parent, new_name);
        self.tree.delete(&mut self.store, old_key)?;
        if let Err(err) = self.tree.insert(&mut self.store, &new_key, &data) {
            let _ = self.tree.insert(&mut self.store, old_key, &data);
            return Err(err);
        }

        let thread = ThreadRecord::new(new_parent, new_name);
        let thread = if record.is_folder() {
            CatalogRecord::FolderThread(thread)
        } else {
            CatalogRecord::FileThread(thread)
        };
        self.tree.replace(
            &mut self.store,
            &CatalogKey::thread(id).to_bytes(),
            &thread.to_bytes()?,
        )
    }

    pub fn rename(&mut self, dir: CatalogNodeId, name: &[u8], new_name: &[u8]) -> Result<()> {
        check_name(name)?;
        check_name(new_name)?;
        let record = self.lookup(dir, name)?;
        let id = record.id().ok_or(FsError::Corrupt)?;
        if let CatalogRecord::File(file) = &record {
            if file.is_locked() {
                return Err(FsError::FileLocked);
            }
        }
        if id == ROOT_FOLDER_ID && new_name.len() > MAX_VOLUME_NAME_LEN {
            return Err(FsError::Param);
        }
        if name == new_name {
            return Ok(());
        }

        let old_key = key(dir, name);
        let new_key = key(dir, new_name);
        if compare_catalog_keys(&old_key, &new_key) != Ordering::Equal
            && self.lookup(dir, new_name).is_ok()
        {
            return Err(FsError::DuplicateName);
        }

        self.rekey(id, &old_key, dir, new_name, &record)?;
        if id == ROOT_FOLDER_ID {
            self.mdb.set_name(new_name);
        }
        self.mdb.modify_date = mac_now();
        Ok(())
    }

    /// True when `ancestor` is `id` or lies on the parent chain of `id`.
    fn is_within(&mut self, id: CatalogNodeId, ancestor: CatalogNodeId) -> Result<bool> {
        let mut current = id;
        // A parent chain longer than the number of CNIDs handed out is a loop.
        for _ in 0..self.mdb.next_cnid {
            if current == ancestor {
                return Ok(true);
            }
            if current == ROOT_FOLDER_ID || current == ROOT_PARENT_ID {
                return Ok(false);
            }
            current = self.thread(current)?.parent_id;
        }
        Err(FsError::Corrupt)
    }

    /// Move `name` from `dir` into folder `dest`.
    pub fn move_entry(&mut self, dir: CatalogNodeId, name: &[u8], dest: CatalogNodeId) -> Result<()> {
        check_name(name)?;
        let record = self.lookup(dir, name)?;
        let id = record.id().ok_or(FsError::Corrupt)?;
        self.folder(dest)?;
        if record.is_folder() && (id == ROOT_FOLDER_ID || self.is_within(dest, id)?) {
            return Err(FsError::BadMove);
        }
        if dir == dest {
            return Ok(());
        }
        if self.lookup(dest, name).is_ok() {
            return Err(FsError::DuplicateName);
        }

        self.rekey(id, &key(dir, name), dest, name, &record)?;
        self.adjust_valence(dir, -1)?;
        self.adjust_valence(dest, 1)?;
        self.adjust_counts(dir, record.is_folder(), -1);
        self.adjust_counts(dest, record.is_folder(), 1);
        Ok(())
    }

    /// Entries directly inside `dir`, in catalog order.
    pub fn children(&mut self, dir: CatalogNodeId) -> Result<Vec<(CatalogKey, CatalogRecord)>> {
        let mut raw = Vec::new();
        self.tree.scan_from(&mut self.store, &key(dir, &[]), |k, data| {
            let (parent, name) = key_parts(k);
            if parent != dir {
                return false;
            }
            if !name.is_empty() {
                raw.push((CatalogKey::new(parent, name), data.to_vec()));
            }
            true
        })?;

        raw.into_iter()
            .map(|(key, data)| Ok((key, decode(&data)?)))
            .collect()
    }

    /// The `index`th entry of `dir`, counting from 1.
    pub fn child_at(&mut self, dir: CatalogNodeId, index: usize) -> Result<(CatalogKey, CatalogRecord)> {
        if index == 0 {
            return Err(FsError::Param);
        }
        let mut seen = 0;
        let mut found = None;
        self.tree.scan_from(&mut self.store, &key(dir, &[]), |k, data| {
            let (parent, name) = key_parts(k);
            if parent != dir {
                return false;
            }
            if name.is_empty() {
                return true;
            }
            seen += 1;
            if seen == index {
                found = Some((CatalogKey::new(parent, name), data.to_vec()));
                return false;
            }
            true
        })?;

        let (key, data) = found.ok_or(FsError::FileNotFound)?;
        Ok((key, decode(&data)?))
    }
}
