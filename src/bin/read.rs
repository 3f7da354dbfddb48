use hfsfm::hfs_types::{CatalogNodeId, ROOT_FOLDER_ID};
use hfsfm::*;
use sha2::{Digest, Sha256};
use std::env;
use std::io;
use std::result::Result;
use std::sync::Arc;

const DRIVE: u16 = 1;

fn os(err: FsError) -> io::Error {
    io::Error::other(err)
}

fn main() -> Result<(), io::Error> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: read /path/to/file.img");
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Missing file argument",
        ));
    }

    let volume_file_path = &args[1];
    println!("Operating on {volume_file_path}");

    let images = Arc::new(DiskImages::new());
    images.insert_file(DRIVE, volume_file_path, false).map_err(os)?;
    let fm = FileManager::new(images, FsConfig::default());
    let vref = fm.mount(DRIVE).map_err(os)?;

    let info = fm.get_vinfo(vref).map_err(os)?;
    println!("Volume: {}", String::from_utf8_lossy(&info.name));
    println!("Block Size: {}", info.block_size);
    println!(
        "Blocks: {} total, {} free ({} bytes free)",
        info.total_blocks,
        info.free_blocks,
        info.free_bytes()
    );
    println!("Files: {}, Folders: {}", info.file_count, info.folder_count);
    println!();

    let mut files = 0;
    walk(&fm, vref, ROOT_FOLDER_ID, "", &mut files).map_err(os)?;
    println!();
    println!("Hashed {files} data forks");

    fm.unmount(vref).map_err(os)
}

/// Print every entry below `dir`, depth first.
fn walk(
    fm: &FileManager,
    vref: VolumeId,
    dir: CatalogNodeId,
    path: &str,
    files: &mut usize,
) -> Result<(), FsError> {
    for index in 1.. {
        let entry = match fm.get_cat_info(vref, dir, CatSelector::Index(index)) {
            Ok(entry) => entry,
            Err(FsError::FileNotFound) => break,
            Err(err) => return Err(err),
        };
        let entry_path = format!("{path}/{}", String::from_utf8_lossy(&entry.name));
        match &entry.entry {
            CatEntry::Folder(folder) => {
                println!("{entry_path}/ ({} entries)", folder.valence);
                walk(fm, vref, folder.folder_id, &entry_path, files)?;
            }
            CatEntry::File(file) => {
                let hash = hash_data_fork(fm, vref, dir, &entry.name)?;
                println!(
                    "{entry_path} {} {} {hash}",
                    file.data_logical_size, file.rsrc_logical_size
                );
                *files += 1;
            }
        }
    }
    Ok(())
}

fn hash_data_fork(
    fm: &FileManager,
    vref: VolumeId,
    dir: CatalogNodeId,
    name: &[u8],
) -> Result<String, FsError> {
    let refnum = fm.open_df(vref, dir, name, Permission::Read)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let hashed = loop {
        match fm.read(refnum, &mut buf) {
            Ok(0) => break Ok(()),
            Ok(count) => hasher.update(&buf[..count]),
            Err(err) => break Err(err),
        }
    };
    fm.close(refnum)?;
    hashed?;
    Ok(format!("{:x}", hasher.finalize()))
}
