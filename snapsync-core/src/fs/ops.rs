//! The file access seam shared by the lock and the transaction code.
//!
//! Paths handed to [`FileOperations`] are relative to the backend's root and
//! always use forward slashes.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use crate::utils::errors::{Result, SyncError};

/// Minimal file access needed by the lock and the coordinator.
pub trait FileOperations: Send + Sync {
    fn file_exists(&self, relative_path: &str) -> Result<bool>;

    /// Read a whole file. Fails with a not-found error when absent.
    fn read_file(&self, relative_path: &str) -> Result<Vec<u8>>;

    /// Create parent directories and replace the file atomically.
    fn write_file(&self, relative_path: &str, data: &[u8]) -> Result<()>;
}

/// [`FileOperations`] over a local (or locally mounted) directory.
#[derive(Debug, Clone)]
pub struct LocalFileOperations {
    root: PathBuf,
}

impl LocalFileOperations {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, relative_path: &str) -> Result<PathBuf> {
        resolve_relative(&self.root, relative_path)
    }
}

impl FileOperations for LocalFileOperations {
    fn file_exists(&self, relative_path: &str) -> Result<bool> {
        let path = self.resolve(relative_path)?;
        match fs::symlink_metadata(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SyncError::io(path, e)),
        }
    }

    fn read_file(&self, relative_path: &str) -> Result<Vec<u8>> {
        let path = self.resolve(relative_path)?;
        fs::read(&path).map_err(|e| SyncError::io(path, e))
    }

    fn write_file(&self, relative_path: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(relative_path)?;
        write_atomic(&path, data)
    }
}

/// Map a relative path under `root`, refusing anything that could escape it.
pub fn resolve_relative(root: &Path, relative_path: &str) -> Result<PathBuf> {
    if relative_path.is_empty() {
        return Err(SyncError::Validation {
            paths: vec![relative_path.to_string()],
        });
    }

    let mut out = root.to_path_buf();
    for component in Path::new(relative_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(SyncError::Validation {
                    paths: vec![relative_path.to_string()],
                });
            }
        }
    }
    Ok(out)
}

/// Temp path next to `path`, tagged so it is recognisable if left behind.
pub fn sibling_temp_path(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{tag}.{}", uuid::Uuid::new_v4().simple()))
}

/// Write through a sibling temp file, fsync, then rename over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
    }

    let temp_path = sibling_temp_path(path, "tmp");
    let result = (|| -> io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(SyncError::io(path, e));
    }
    Ok(())
}

/// Remove a file if present. Returns whether something was removed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SyncError::io(path, e)),
    }
}

/// Remove now-empty directories from `path`'s parent up to, not including, `root`.
pub fn prune_empty_parents(root: &Path, path: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // Fails on non-empty directories, which ends the walk.
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

/// Remove files named `*<suffix>` anywhere under `root`, without following links.
pub fn remove_files_with_suffix(root: &Path, suffix: &str) -> Result<usize> {
    let mut removed = 0;
    if !root.exists() {
        return Ok(0);
    }
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            SyncError::io(path, e.into())
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().ends_with(suffix) && remove_if_exists(entry.path())? {
            tracing::debug!(path = %entry.path().display(), "Removed stray temp file");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Create the parent directory of `path`.
pub fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn maps_relative_path_under_root() {
        let mapped = resolve_relative(Path::new("/repo"), "docs/a.txt").unwrap();
        assert_eq!(mapped, PathBuf::from("/repo/docs/a.txt"));
    }

    #[test]
    fn rejects_escaping_paths() {
        for bad in ["../secret", "/etc/passwd", "a/../../b", ""] {
            assert!(resolve_relative(Path::new("/repo"), bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn local_ops_round_trip() {
        let dir = TempDir::new().unwrap();
        let ops = LocalFileOperations::new(dir.path());

        assert!(!ops.file_exists(".snapsync/lock.json").unwrap());
        ops.write_file(".snapsync/lock.json", b"{}").unwrap();
        assert!(ops.file_exists(".snapsync/lock.json").unwrap());
        assert_eq!(ops.read_file(".snapsync/lock.json").unwrap(), b"{}");

        ops.write_file(".snapsync/lock.json", b"{\"a\":1}").unwrap();
        assert_eq!(ops.read_file(".snapsync/lock.json").unwrap(), b"{\"a\":1}");

        let err = ops.read_file("missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.json");
        write_atomic(&target, b"one").unwrap();
        write_atomic(&target, b"two").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["out.json".to_string()]);
        assert_eq!(fs::read(&target).unwrap(), b"two");
    }
}
