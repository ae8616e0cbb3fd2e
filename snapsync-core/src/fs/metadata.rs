//! Building manifest entries from files on disk, and applying entry
//! metadata back onto downloaded files.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::manifest::{hash_file, FileEntry};

/// Whole seconds since the Unix epoch; pre-epoch times come out negative.
pub fn mtime_secs(metadata: &fs::Metadata) -> io::Result<i64> {
    let modified = metadata.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    })
}

fn system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

#[cfg(unix)]
fn owner_of(metadata: &fs::Metadata) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.uid().to_string())
}

#[cfg(not(unix))]
fn owner_of(_metadata: &fs::Metadata) -> Option<String> {
    None
}

/// Describe the file at `full_path` as an entry for `relative_path`.
///
/// Symbolic links are never followed: they become link entries carrying the
/// raw target. Returns `Ok(None)` for anything that is neither a regular
/// file nor a link (directories, sockets, devices).
pub fn entry_from_path(
    full_path: &Path,
    relative_path: &str,
    hash_content: bool,
) -> io::Result<Option<FileEntry>> {
    let metadata = fs::symlink_metadata(full_path)?;
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        let target = fs::read_link(full_path)?;
        return Ok(Some(FileEntry::link(
            relative_path,
            target.to_string_lossy().replace('\\', "/"),
        )));
    }

    if !file_type.is_file() {
        return Ok(None);
    }

    let hash = if hash_content {
        Some(hash_file(full_path)?)
    } else {
        None
    };

    Ok(Some(FileEntry::File {
        path: relative_path.to_string(),
        filesize: metadata.len(),
        mtime: mtime_secs(&metadata)?,
        hash,
        owner: owner_of(&metadata),
    }))
}

/// Set a regular file's modification time to `mtime` seconds.
pub fn set_mtime(path: &Path, mtime: i64) -> io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(system_time(mtime))
}

/// Create a symbolic link at `path` pointing to `target`.
#[cfg(unix)]
pub fn create_symlink(target: &str, path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(windows)]
pub fn create_symlink(target: &str, path: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, path)
}
