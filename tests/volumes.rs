use hfsfm::hfs_types::ROOT_FOLDER_ID;
use hfsfm::pb::{self, IoParam};
use hfsfm::*;
use sha2::{Digest, Sha256};
use std::sync::Arc;

const IMAGE_BYTES: usize = 1 << 20;

fn formatted(drive: u16, name: &str) -> (Arc<DiskImages>, FileManager) {
    let images = Arc::new(DiskImages::new());
    images.insert_blank(drive, IMAGE_BYTES);
    let fm = FileManager::new(images.clone(), FsConfig::default());
    fm.format(drive, &FormatOptions::new(name)).unwrap();
    (images, fm)
}

fn write_file(fm: &FileManager, vref: VolumeId, dir: u32, name: &[u8], data: &[u8]) {
    fm.create(vref, dir, name, 0, 0).unwrap();
    let refnum = fm.open_df(vref, dir, name, Permission::ReadWrite).unwrap();
    assert_eq!(fm.write(refnum, data), Ok(data.len()));
    fm.close(refnum).unwrap();
}

fn read_file(fm: &FileManager, vref: VolumeId, dir: u32, name: &[u8]) -> Vec<u8> {
    let refnum = fm.open_df(vref, dir, name, Permission::Read).unwrap();
    let len = fm.get_eof(refnum).unwrap() as usize;
    let mut buf = vec![0u8; len];
    assert_eq!(fm.read(refnum, &mut buf), Ok(len));
    fm.close(refnum).unwrap();
    buf
}

#[test]
fn data_survives_remount() {
    let (_images, fm) = formatted(1, "Keep");
    let vref = fm.mount(1).unwrap();
    let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    write_file(&fm, vref, 0, b"kept", &data);
    let docs = fm.create_dir(vref, 0, b"Docs").unwrap();
    let free = fm.get_vinfo(vref).unwrap().free_blocks;
    fm.unmount(vref).unwrap();
    assert_eq!(fm.get_vinfo(vref), Err(FsError::NoSuchVolume));

    let vref = fm.mount(1).unwrap();
    let info = fm.get_vinfo(vref).unwrap();
    assert_eq!(info.name, b"Keep");
    assert_eq!(info.free_blocks, free);
    assert_eq!((info.file_count, info.folder_count), (1, 1));
    assert_eq!(read_file(&fm, vref, 0, b"kept"), data);
    assert_eq!(
        fm.get_cat_info(vref, 0, CatSelector::Name(b"Docs")).unwrap().id(),
        docs
    );
    fm.check_volume(vref).unwrap();
}

#[test]
fn unmount_closes_open_forks_and_keeps_their_data() {
    let (_images, fm) = formatted(1, "Open");
    let vref = fm.mount(1).unwrap();
    fm.create(vref, 0, b"left open", 0, 0).unwrap();
    let refnum = fm.open(vref, b"left open", Permission::ReadWrite).unwrap();
    fm.write(refnum, b"0123456789").unwrap();
    let docs = fm.create_dir(vref, 0, b"Docs").unwrap();
    let wd = fm.open_wd(vref, docs, 0, 0).unwrap();

    fm.unmount(vref).unwrap();
    assert_eq!(fm.close(refnum), Err(FsError::FileNotOpen));
    assert_eq!(fm.get_wd_info(wd), Err(FsError::NoSuchVolume));
    assert_eq!(fm.stats().open_forks, 0);

    let vref = fm.mount(1).unwrap();
    assert_eq!(read_file(&fm, vref, 0, b"left open"), b"0123456789");
}

#[test]
fn default_volume_follows_mounts() {
    let images = Arc::new(DiskImages::new());
    images.insert_blank(1, IMAGE_BYTES);
    images.insert_blank(2, IMAGE_BYTES);
    let fm = FileManager::new(images.clone(), FsConfig::default());
    fm.format(1, &FormatOptions::new("First")).unwrap();
    fm.format(2, &FormatOptions::new("Second")).unwrap();

    let first = fm.mount(1).unwrap();
    let second = fm.mount(2).unwrap();
    assert_ne!(first, second);
    assert_eq!(fm.get_vol(), Ok((first, ROOT_FOLDER_ID)));

    fm.set_vol_by_name(b"second:").unwrap();
    assert_eq!(fm.get_vol(), Ok((second, ROOT_FOLDER_ID)));
    fm.create(0, 0, b"on second", 0, 0).unwrap();
    assert!(fm.get_finfo(second, 0, b"on second").is_ok());
    // Positive volume numbers are drives.
    assert!(fm.get_finfo(2, 0, b"on second").is_ok());

    assert_eq!(fm.get_vinfo_indexed(1).unwrap().name, b"First");
    assert_eq!(fm.get_vinfo_indexed(2).unwrap().vref, second);
    assert_eq!(fm.get_vinfo_indexed(3), Err(FsError::NoSuchVolume));
    assert_eq!(fm.get_vinfo_indexed(0), Err(FsError::Param));

    fm.unmount(second).unwrap();
    assert_eq!(fm.get_vol(), Ok((first, ROOT_FOLDER_ID)));
    fm.unmount(first).unwrap();
    assert_eq!(fm.get_vol(), Err(FsError::NoSuchVolume));
    assert_eq!(fm.set_vol_by_name(b"First"), Err(FsError::NoSuchVolume));
}

#[test]
fn working_directories_resolve_to_their_folder() {
    let (_images, fm) = formatted(1, "Dirs");
    let vref = fm.mount(1).unwrap();
    let docs = fm.create_dir(vref, 0, b"Docs").unwrap();

    let wd = fm.open_wd(vref, docs, 7, 99).unwrap();
    assert!(is_wd_refnum(wd));
    assert!(wd < -WD_REFNUM_BASE);
    assert_eq!(fm.open_wd(vref, docs, 7, 99), Ok(wd));

    write_file(&fm, wd, 0, b"in docs", b"hello");
    assert_eq!(read_file(&fm, vref, docs, b"in docs"), b"hello");
    assert_eq!(fm.get_finfo(vref, 0, b"in docs"), Err(FsError::FileNotFound));

    let info = fm.get_wd_info(wd).unwrap();
    assert_eq!(
        info,
        WorkingDir {
            vref,
            dir_id: docs,
            owner: 7,
            user_data: 99
        }
    );
    assert_eq!(fm.get_wd_info_indexed(1, vref), Ok((wd, info)));
    assert_eq!(fm.get_wd_info(vref).unwrap().dir_id, ROOT_FOLDER_ID);

    fm.set_vol(vref, docs).unwrap();
    assert_eq!(fm.get_vol(), Ok((vref, docs)));
    fm.create(0, 0, b"default dir", 0, 0).unwrap();
    assert!(fm.get_finfo(vref, docs, b"default dir").is_ok());
    assert_eq!(fm.set_vol(vref, 12345), Err(FsError::DirNotFound));

    fm.close_wd(wd).unwrap();
    assert_eq!(fm.create(wd, 0, b"gone", 0, 0), Err(FsError::NoSuchVolume));
    assert_eq!(fm.close_wd(vref), Ok(()));
    assert_eq!(fm.open_wd(vref, 12345, 0, 0), Err(FsError::DirNotFound));
}

#[test]
fn working_directory_pool_exhaustion() {
    let images = Arc::new(DiskImages::new());
    images.insert_blank(1, IMAGE_BYTES);
    let config = FsConfig {
        max_working_dirs: 2,
        ..Default::default()
    };
    let fm = FileManager::new(images, config);
    fm.format(1, &FormatOptions::new("Few")).unwrap();
    let vref = fm.mount(1).unwrap();
    let a = fm.create_dir(vref, 0, b"a").unwrap();
    let b = fm.create_dir(vref, 0, b"b").unwrap();
    let c = fm.create_dir(vref, 0, b"c").unwrap();

    fm.open_wd(vref, a, 0, 0).unwrap();
    fm.open_wd(vref, b, 0, 0).unwrap();
    assert_eq!(fm.open_wd(vref, c, 0, 0), Err(FsError::TooManyWorkingDirs));
}

#[test]
fn process_release_closes_owned_blocks() {
    let (_images, fm) = formatted(1, "Procs");
    let vref = fm.mount(1).unwrap();
    fm.create(vref, 0, b"mine", 0, 0).unwrap();
    fm.create(vref, 0, b"theirs", 0, 0).unwrap();
    let docs = fm.create_dir(vref, 0, b"Docs").unwrap();

    let mine = fm.open(vref, b"mine", Permission::ReadWrite).unwrap();
    fm.open(vref, b"mine", Permission::Read).unwrap();
    fm.set_process_owner(mine, 42).unwrap();
    let theirs = fm.open(vref, b"theirs", Permission::Read).unwrap();
    let wd = fm.open_wd(vref, docs, 42, 0).unwrap();
    fm.write(mine, b"abc").unwrap();

    assert_eq!(fm.release_process_files(42), Ok(1));
    assert_eq!(fm.get_fcb_info(mine), Err(FsError::FileNotOpen));
    assert_eq!(fm.get_wd_info(wd), Err(FsError::NoSuchVolume));
    assert_eq!(fm.get_fcb_info(theirs).unwrap().open_count, 1);
    assert_eq!(fm.stats().open_forks, 1);

    // Released forks are written back and the file can go.
    assert_eq!(read_file(&fm, vref, 0, b"mine"), b"abc");
    fm.delete(vref, 0, b"mine").unwrap();
}

#[test]
fn fcb_info_by_index() {
    let (_images, fm) = formatted(1, "Index");
    let vref = fm.mount(1).unwrap();
    write_file(&fm, vref, 0, b"x", b"12345");
    let refnum = fm.open(vref, b"x", Permission::Read).unwrap();
    fm.set_fpos(refnum, PosMode::FromStart, 2).unwrap();

    let info = fm.get_fcb_info_indexed(1, 0).unwrap();
    assert_eq!(info.refnum, refnum);
    assert_eq!((info.logical_eof, info.position), (5, 2));
    assert_eq!(info.vref, vref);
    assert_eq!(info.parent_id, ROOT_FOLDER_ID);
    assert_eq!(fm.get_fcb_info_indexed(2, 0), Err(FsError::FileNotOpen));
    assert_eq!(fm.get_fcb_info_indexed(1, vref).unwrap().refnum, refnum);
}

#[test]
fn eject_takes_volume_offline() {
    let (images, fm) = formatted(1, "Floppy");
    let vref = fm.mount(1).unwrap();
    write_file(&fm, vref, 0, b"saved", b"before eject");
    let reader = fm.open(vref, b"saved", Permission::Read).unwrap();
    assert_eq!(fm.get_eof(reader), Ok(12));

    fm.eject(vref).unwrap();
    assert!(images.is_ejected(1));
    assert!(fm.get_vinfo(vref).unwrap().offline);
    assert_eq!(fm.get_fpos(reader), Err(FsError::VolumeOffline));
    assert_eq!(fm.get_eof(reader), Err(FsError::VolumeOffline));
    assert_eq!(
        fm.set_fpos(reader, PosMode::FromStart, 2),
        Err(FsError::VolumeOffline)
    );
    assert_eq!(
        fm.open(vref, b"saved", Permission::Read),
        Err(FsError::VolumeOffline)
    );
    assert_eq!(fm.create(vref, 0, b"new", 0, 0), Err(FsError::VolumeOffline));
    assert_eq!(fm.flush_vol(vref), Err(FsError::VolumeOffline));
    assert_eq!(fm.eject(vref), Ok(()));
    fm.flush_all().unwrap();
    fm.unmount(vref).unwrap();

    // The ejected image still holds what was flushed.
    let image = images.remove(1).unwrap();
    let fresh = Arc::new(DiskImages::new());
    fresh.insert_memory(1, image);
    let fm = FileManager::new(fresh, FsConfig::default());
    let vref = fm.mount(1).unwrap();
    assert_eq!(read_file(&fm, vref, 0, b"saved"), b"before eject");
}

#[test]
fn write_protected_volume_is_read_only() {
    let (images, fm) = formatted(1, "Locked");
    let vref = fm.mount(1).unwrap();
    write_file(&fm, vref, 0, b"ro", b"data");
    fm.unmount(vref).unwrap();

    images.set_write_protected(1, true);
    let vref = fm.mount(1).unwrap();
    assert!(fm.get_vinfo(vref).unwrap().locked);
    assert_eq!(fm.create(vref, 0, b"new", 0, 0), Err(FsError::WriteProtected));
    assert_eq!(
        fm.open(vref, b"ro", Permission::Write),
        Err(FsError::WriteProtected)
    );
    let refnum = fm.open(vref, b"ro", Permission::Current).unwrap();
    assert_eq!(fm.write(refnum, b"x"), Err(FsError::WritePermission));
    fm.close(refnum).unwrap();
    assert_eq!(read_file(&fm, vref, 0, b"ro"), b"data");
    fm.unmount(vref).unwrap();

    assert_eq!(
        fm.format(1, &FormatOptions::new("Again")),
        Err(FsError::WriteProtected)
    );
}

#[test]
fn mount_rejects_foreign_media() {
    let images = Arc::new(DiskImages::new());
    images.insert_blank(1, IMAGE_BYTES);
    let fm = FileManager::new(images, FsConfig::default());
    assert_eq!(fm.mount(1), Err(FsError::BadMdb));
    assert_eq!(fm.mount(9), Err(FsError::NoSuchVolume));
    assert_eq!(fm.stats().volumes, 0);
}

#[test]
fn parameter_blocks_report_results() {
    let (_images, fm) = formatted(1, "Blocks");
    let vref = fm.mount(1).unwrap();
    let mut io = IoParam {
        io_name: b"missing".to_vec(),
        io_vref_num: vref,
        ..Default::default()
    };
    assert_eq!(pb::pb_open_sync(&fm, &mut io), -43);
    assert_eq!(io.io_result, -43);
    assert_eq!(error_string(io.io_result), "File not found");

    io.io_ref_num = 77;
    assert_eq!(pb::pb_read_async(&fm, &mut io), -38);
    io.io_ref_num = -3;
    assert_eq!(pb::pb_close_sync(&fm, &mut io), -51);
}

#[test]
fn image_files_round_trip() {
    let image = tempfile::NamedTempFile::new().unwrap();
    image.as_file().set_len(IMAGE_BYTES as u64).unwrap();
    let data: Vec<u8> = (0..20_000u32).map(|i| (i * 31 % 256) as u8).collect();
    let expected = format!("{:x}", Sha256::digest(&data));

    let images = Arc::new(DiskImages::new());
    images.insert_file(3, image.path(), true).unwrap();
    let fm = FileManager::new(images, FsConfig::default());
    fm.format(3, &FormatOptions::new("OnDisk")).unwrap();
    let vref = fm.mount(3).unwrap();
    write_file(&fm, vref, 0, b"payload", &data);
    fm.unmount(vref).unwrap();

    let images = Arc::new(DiskImages::new());
    images.insert_file(3, image.path(), false).unwrap();
    let fm = FileManager::new(images, FsConfig::default());
    let vref = fm.mount(3).unwrap();
    assert!(fm.get_vinfo(vref).unwrap().locked);
    let read = read_file(&fm, vref, 0, b"payload");
    assert_eq!(format!("{:x}", Sha256::digest(&read)), expected);
}
