//! Filesystem access on the machine that hosts the remote store.
//!
//! The ZFS backend works on absolute paths inside mountpoints; whether those
//! are local or reached over SFTP is hidden behind [`HostFs`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snapsync_core::fs::metadata::{create_symlink, set_mtime};
use snapsync_core::fs::ops::{remove_if_exists, resolve_relative, write_atomic, FileOperations};
use snapsync_core::transfer::ContentStream;
use snapsync_core::{Result, SyncError};

pub trait HostFs: Send + Sync {
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Fails with a not-found error when absent.
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Replace `path` atomically, creating parent directories.
    fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    fn open(&self, path: &Path, label: &str) -> Result<ContentStream>;

    /// Rename, creating the destination's parent directories.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Returns whether a file was removed.
    fn remove_file(&self, path: &Path) -> Result<bool>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// File names directly under `path`; empty when it does not exist.
    fn list_dir(&self, path: &Path) -> Result<Vec<String>>;

    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    fn symlink(&self, target: &str, path: &Path) -> Result<()>;

    fn set_mtime(&self, path: &Path, mtime: i64) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalHostFs;

impl HostFs for LocalHostFs {
    fn exists(&self, path: &Path) -> Result<bool> {
        match fs::symlink_metadata(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SyncError::io(path, e)),
        }
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| SyncError::io(path, e))
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        write_atomic(path, data)
    }

    fn open(&self, path: &Path, label: &str) -> Result<ContentStream> {
        ContentStream::from_file(path, label)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            self.create_dir_all(parent)?;
        }
        fs::rename(from, to).map_err(|e| SyncError::io(to, e))
    }

    fn remove_file(&self, path: &Path) -> Result<bool> {
        remove_if_exists(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| SyncError::io(path, e))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SyncError::io(path, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SyncError::io(path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::io(path, e)),
        }
    }

    fn symlink(&self, target: &str, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        remove_if_exists(path)?;
        create_symlink(target, path).map_err(|e| SyncError::io(path, e))
    }

    fn set_mtime(&self, path: &Path, mtime: i64) -> Result<()> {
        set_mtime(path, mtime).map_err(|e| SyncError::io(path, e))
    }
}

/// [`FileOperations`] rooted at a directory on the remote host.
pub struct HostFileOperations {
    fs: Arc<dyn HostFs>,
    root: PathBuf,
}

impl HostFileOperations {
    pub fn new(fs: Arc<dyn HostFs>, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
        }
    }
}

impl FileOperations for HostFileOperations {
    fn file_exists(&self, relative_path: &str) -> Result<bool> {
        self.fs.exists(&resolve_relative(&self.root, relative_path)?)
    }

    fn read_file(&self, relative_path: &str) -> Result<Vec<u8>> {
        self.fs.read(&resolve_relative(&self.root, relative_path)?)
    }

    fn write_file(&self, relative_path: &str, data: &[u8]) -> Result<()> {
        self.fs.write(&resolve_relative(&self.root, relative_path)?, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn host_operations_stay_under_root() {
        let dir = TempDir::new().unwrap();
        let ops = HostFileOperations::new(Arc::new(LocalHostFs), dir.path());

        ops.write_file(".snapsync/lock.json", b"{}").unwrap();
        assert!(ops.file_exists(".snapsync/lock.json").unwrap());
        assert_eq!(ops.read_file(".snapsync/lock.json").unwrap(), b"{}");
        assert!(ops.read_file("missing").unwrap_err().is_not_found());
        assert!(ops.write_file("../escape", b"x").is_err());
    }

    #[test]
    fn local_rename_creates_parents() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a");
        fs::write(&from, b"x").unwrap();
        let to = dir.path().join("deep/er/b");
        LocalHostFs.rename(&from, &to).unwrap();
        assert_eq!(fs::read(&to).unwrap(), b"x");
        assert!(!LocalHostFs.exists(&from).unwrap());
    }

    #[test]
    fn local_listing_of_a_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(LocalHostFs.list_dir(&dir.path().join("nope")).unwrap().is_empty());
        fs::write(dir.path().join("b"), b"").unwrap();
        fs::write(dir.path().join("a"), b"").unwrap();
        assert_eq!(LocalHostFs.list_dir(dir.path()).unwrap(), vec!["a", "b"]);
    }
}
