//! Parameter-block entry points.
//!
//! Each call reads its inputs from the block, runs the matching
//! [`FileManager`] operation and stores the status in `io_result` as well as
//! returning it. The asynchronous forms complete before they return.

use crate::cache::VolumeId;
use crate::error::{FsError, NO_ERR, OsErr, Result};
use crate::fcb::{Permission, PosMode, RefNum};
use crate::manager::{CatEntry, CatSelector, FileManager};
use hfs_types::{CatalogNodeId, FILE_LOCKED_FLAG, FinderInfo};

/// `ioFlAttrib` bit: the file is locked.
pub const ATTRIB_LOCKED: u8 = 0x01;
/// `ioFlAttrib` bit: the entry is a directory.
pub const ATTRIB_DIRECTORY: u8 = 0x10;

fn complete<T>(io_result: &mut OsErr, result: Result<T>) -> OsErr {
    *io_result = match result {
        Ok(_) => NO_ERR,
        Err(err) => err.os_err(),
    };
    *io_result
}

/// Block for opening, closing and transferring data on a fork.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IoParam {
    pub io_result: OsErr,
    pub io_name: Vec<u8>,
    pub io_vref_num: VolumeId,
    /// Directory for the `PBH` opens. Zero means the one implied by
    /// `io_vref_num`.
    pub io_dir_id: CatalogNodeId,
    pub io_ref_num: RefNum,
    pub io_permssn: i8,
    pub io_buffer: Vec<u8>,
    pub io_req_count: u32,
    pub io_act_count: u32,
    pub io_pos_mode: u16,
    pub io_pos_offset: i32,
}

/// Block for the `PBH` create, delete and rename calls.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileParam {
    pub io_result: OsErr,
    pub io_name: Vec<u8>,
    pub io_vref_num: VolumeId,
    pub io_dir_id: CatalogNodeId,
    /// New name for `PBHRename`.
    pub io_new_name: Vec<u8>,
    /// Type and creator for `PBHCreate`.
    pub io_fl_fndr_info: FinderInfo,
    /// CNID of the created file.
    pub io_fl_num: CatalogNodeId,
}

/// Block for `PBGetCatInfo` and `PBSetCatInfo`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CatInfoParam {
    pub io_result: OsErr,
    pub io_name: Vec<u8>,
    pub io_vref_num: VolumeId,
    /// Positive: the nth entry of the directory. Negative: the directory
    /// itself. Zero: the entry named by `io_name`.
    pub io_fdir_index: i16,
    /// Directory searched. A folder's own ID on return.
    pub io_dir_id: CatalogNodeId,
    pub io_fl_attrib: u8,
    pub io_fl_par_id: CatalogNodeId,
    pub io_fl_num: CatalogNodeId,
    /// The record read, or the one to store.
    pub info: Option<CatEntry>,
}

/// Block for the working directory calls.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WdParam {
    pub io_result: OsErr,
    /// Volume or working directory. The opened working directory on return
    /// from `PBOpenWD`.
    pub io_vref_num: VolumeId,
    /// Positive for an indexed `PBGetWDInfo`.
    pub io_wd_index: i16,
    pub io_wd_proc_id: u32,
    pub io_wd_vref_num: VolumeId,
    pub io_wd_dir_id: CatalogNodeId,
}

/// Block for `PBGetFCBInfo`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FcbParam {
    pub io_result: OsErr,
    /// Volume filter for indexed calls. Zero covers every volume.
    pub io_vref_num: VolumeId,
    pub io_ref_num: RefNum,
    /// Positive for an indexed call, which returns `io_ref_num`.
    pub io_fcb_indx: i16,
    pub io_name: Vec<u8>,
    pub io_fcb_fl_nm: CatalogNodeId,
    pub io_fcb_flags: u8,
    pub io_fcb_eof: u32,
    pub io_fcb_p_len: u32,
    pub io_fcb_cr_ps: u32,
    pub io_fcb_vref_num: VolumeId,
    pub io_fcb_clp_siz: u32,
    pub io_fcb_par_id: CatalogNodeId,
}

/// Block for `PBCatMove`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CatMoveParam {
    pub io_result: OsErr,
    pub io_name: Vec<u8>,
    pub io_vref_num: VolumeId,
    pub io_dir_id: CatalogNodeId,
    /// Destination folder name inside `io_new_dir_id`. Empty names the
    /// folder `io_new_dir_id` itself.
    pub io_new_name: Vec<u8>,
    pub io_new_dir_id: CatalogNodeId,
}

pub fn pb_open_sync(fm: &FileManager, pb: &mut IoParam) -> OsErr {
    let result = Permission::from_raw(pb.io_permssn)
        .and_then(|perm| fm.open(pb.io_vref_num, &pb.io_name, perm))
        .map(|refnum| pb.io_ref_num = refnum);
    complete(&mut pb.io_result, result)
}

pub fn pb_close_sync(fm: &FileManager, pb: &mut IoParam) -> OsErr {
    let result = fm.close(pb.io_ref_num);
    complete(&mut pb.io_result, result)
}

fn position(fm: &FileManager, pb: &IoParam) -> Result<()> {
    match PosMode::from_raw(pb.io_pos_mode)? {
        PosMode::AtMark => Ok(()),
        mode => fm.set_fpos(pb.io_ref_num, mode, pb.io_pos_offset).map(|_| ()),
    }
}

fn read(fm: &FileManager, pb: &mut IoParam) -> Result<()> {
    pb.io_act_count = 0;
    position(fm, pb)?;
    let mut buf = vec![0u8; pb.io_req_count as usize];
    let count = fm.read(pb.io_ref_num, &mut buf)?;
    buf.truncate(count);
    pb.io_buffer = buf;
    pb.io_act_count = count as u32;
    pb.io_pos_offset = fm.get_fpos(pb.io_ref_num)? as i32;
    if count < pb.io_req_count as usize {
        return Err(FsError::EndOfFile);
    }
    Ok(())
}

/// Read `io_req_count` bytes into `io_buffer`. A read cut short by the end
/// of the fork reports `eofErr` with `io_act_count` set.
pub fn pb_read_sync(fm: &FileManager, pb: &mut IoParam) -> OsErr {
    let result = read(fm, pb);
    complete(&mut pb.io_result, result)
}

fn write(fm: &FileManager, pb: &mut IoParam) -> Result<()> {
    pb.io_act_count = 0;
    let data = pb
        .io_buffer
        .get(..pb.io_req_count as usize)
        .ok_or(FsError::Param)?;
    position(fm, pb)?;
    let count = fm.write(pb.io_ref_num, data)?;
    pb.io_act_count = count as u32;
    pb.io_pos_offset = fm.get_fpos(pb.io_ref_num)? as i32;
    Ok(())
}

/// Write the first `io_req_count` bytes of `io_buffer`.
pub fn pb_write_sync(fm: &FileManager, pb: &mut IoParam) -> OsErr {
    let result = write(fm, pb);
    complete(&mut pb.io_result, result)
}

fn cat_selector(pb: &CatInfoParam) -> CatSelector<'_> {
    match pb.io_fdir_index {
        index if index > 0 => CatSelector::Index(index as usize),
        index if index < 0 => CatSelector::Directory,
        _ => CatSelector::Name(&pb.io_name),
    }
}

pub fn pb_get_cat_info_sync(fm: &FileManager, pb: &mut CatInfoParam) -> OsErr {
    let result = fm
        .get_cat_info(pb.io_vref_num, pb.io_dir_id, cat_selector(pb))
        .map(|info| {
            pb.io_fl_num = info.id();
            pb.io_fl_par_id = info.parent_id;
            pb.io_fl_attrib = match &info.entry {
                CatEntry::Folder(_) => {
                    pb.io_dir_id = info.id();
                    ATTRIB_DIRECTORY
                }
                CatEntry::File(file) if file.flags & FILE_LOCKED_FLAG != 0 => ATTRIB_LOCKED,
                CatEntry::File(_) => 0,
            };
            pb.io_name = info.name;
            pb.info = Some(info.entry);
        });
    complete(&mut pb.io_result, result)
}

/// Store the settable fields of `info` on the entry named by `io_name`.
pub fn pb_set_cat_info_sync(fm: &FileManager, pb: &mut CatInfoParam) -> OsErr {
    let result = match &pb.info {
        Some(entry) => fm.set_cat_info(pb.io_vref_num, pb.io_dir_id, &pb.io_name, entry),
        None => Err(FsError::Param),
    };
    complete(&mut pb.io_result, result)
}

pub fn pb_h_open_df_sync(fm: &FileManager, pb: &mut IoParam) -> OsErr {
    let result = Permission::from_raw(pb.io_permssn)
        .and_then(|perm| fm.open_df(pb.io_vref_num, pb.io_dir_id, &pb.io_name, perm))
        .map(|refnum| pb.io_ref_num = refnum);
    complete(&mut pb.io_result, result)
}

pub fn pb_h_open_rf_sync(fm: &FileManager, pb: &mut IoParam) -> OsErr {
    let result = Permission::from_raw(pb.io_permssn)
        .and_then(|perm| fm.open_rf(pb.io_vref_num, pb.io_dir_id, &pb.io_name, perm))
        .map(|refnum| pb.io_ref_num = refnum);
    complete(&mut pb.io_result, result)
}

pub fn pb_h_create_sync(fm: &FileManager, pb: &mut FileParam) -> OsErr {
    let info = pb.io_fl_fndr_info;
    let result = fm
        .create(
            pb.io_vref_num,
            pb.io_dir_id,
            &pb.io_name,
            info.creator,
            info.file_type,
        )
        .map(|id| pb.io_fl_num = id);
    complete(&mut pb.io_result, result)
}

pub fn pb_h_delete_sync(fm: &FileManager, pb: &mut FileParam) -> OsErr {
    let result = fm.delete(pb.io_vref_num, pb.io_dir_id, &pb.io_name);
    complete(&mut pb.io_result, result)
}

pub fn pb_h_rename_sync(fm: &FileManager, pb: &mut FileParam) -> OsErr {
    let result = fm.rename(pb.io_vref_num, pb.io_dir_id, &pb.io_name, &pb.io_new_name);
    complete(&mut pb.io_result, result)
}

pub fn pb_open_wd_sync(fm: &FileManager, pb: &mut WdParam) -> OsErr {
    let result = fm
        .open_wd(pb.io_vref_num, pb.io_wd_dir_id, pb.io_wd_proc_id, 0)
        .map(|wd| pb.io_vref_num = wd);
    complete(&mut pb.io_result, result)
}

pub fn pb_close_wd_sync(fm: &FileManager, pb: &mut WdParam) -> OsErr {
    let result = fm.close_wd(pb.io_vref_num);
    complete(&mut pb.io_result, result)
}

pub fn pb_get_wd_info_sync(fm: &FileManager, pb: &mut WdParam) -> OsErr {
    let found = if pb.io_wd_index > 0 {
        fm.get_wd_info_indexed(pb.io_wd_index as usize, pb.io_vref_num)
            .map(|(refnum, wd)| {
                pb.io_vref_num = refnum;
                wd
            })
    } else {
        fm.get_wd_info(pb.io_vref_num)
    };
    let result = found.map(|wd| {
        pb.io_wd_vref_num = wd.vref;
        pb.io_wd_dir_id = wd.dir_id;
        pb.io_wd_proc_id = wd.owner;
    });
    complete(&mut pb.io_result, result)
}

pub fn pb_get_fcb_info_sync(fm: &FileManager, pb: &mut FcbParam) -> OsErr {
    let found = if pb.io_fcb_indx > 0 {
        fm.get_fcb_info_indexed(pb.io_fcb_indx as usize, pb.io_vref_num)
    } else {
        fm.get_fcb_info(pb.io_ref_num)
    };
    let result = found.map(|info| {
        pb.io_ref_num = info.refnum;
        pb.io_name = info.name;
        pb.io_fcb_fl_nm = info.file_id;
        pb.io_fcb_flags = info.flags.bits();
        pb.io_fcb_eof = info.logical_eof;
        pb.io_fcb_p_len = info.physical_eof;
        pb.io_fcb_cr_ps = info.position;
        pb.io_fcb_vref_num = info.vref;
        pb.io_fcb_clp_siz = info.clump_size;
        pb.io_fcb_par_id = info.parent_id;
    });
    complete(&mut pb.io_result, result)
}

fn cat_move(fm: &FileManager, pb: &CatMoveParam) -> Result<()> {
    let dest = if pb.io_new_name.is_empty() {
        pb.io_new_dir_id
    } else {
        let target = fm.get_cat_info(
            pb.io_vref_num,
            pb.io_new_dir_id,
            CatSelector::Name(&pb.io_new_name),
        )?;
        if !target.is_folder() {
            return Err(FsError::DirNotFound);
        }
        target.id()
    };
    fm.cat_move(pb.io_vref_num, pb.io_dir_id, &pb.io_name, dest)
}

pub fn pb_cat_move_sync(fm: &FileManager, pb: &mut CatMoveParam) -> OsErr {
    let result = cat_move(fm, pb);
    complete(&mut pb.io_result, result)
}

macro_rules! async_calls {
    ($($name:ident => $sync:ident($param:ty);)*) => {
        $(
            #[doc = concat!("Asynchronous form of [`", stringify!($sync), "`].")]
            pub fn $name(fm: &FileManager, pb: &mut $param) -> OsErr {
                $sync(fm, pb)
            }
        )*
    };
}

async_calls! {
    pb_open_async => pb_open_sync(IoParam);
    pb_close_async => pb_close_sync(IoParam);
    pb_read_async => pb_read_sync(IoParam);
    pb_write_async => pb_write_sync(IoParam);
    pb_get_cat_info_async => pb_get_cat_info_sync(CatInfoParam);
    pb_set_cat_info_async => pb_set_cat_info_sync(CatInfoParam);
    pb_h_open_df_async => pb_h_open_df_sync(IoParam);
    pb_h_open_rf_async => pb_h_open_rf_sync(IoParam);
    pb_h_create_async => pb_h_create_sync(FileParam);
    pb_h_delete_async => pb_h_delete_sync(FileParam);
    pb_h_rename_async => pb_h_rename_sync(FileParam);
    pb_open_wd_async => pb_open_wd_sync(WdParam);
    pb_close_wd_async => pb_close_wd_sync(WdParam);
    pb_get_wd_info_async => pb_get_wd_info_sync(WdParam);
    pb_get_fcb_info_async => pb_get_fcb_info_sync(FcbParam);
    pb_cat_move_async => pb_cat_move_sync(CatMoveParam);
}
