//! Client side of a transaction: staging inside the working copy.
//!
//! Layout under `<root>/<metadata_dir>/`:
//!
//! - `cache.json`: the last synced manifest
//! - `cache.json.bak`: its backup while a transaction runs
//! - `transaction.json`: the in-progress marker
//! - `staging-<id>/files/...`: staged file content
//! - `staging-<id>/cache.json`: the staged replacement cache manifest
//! - `tmp/`: transport temp files (`<uuid>.pending-<id>`)
//!
//! Commit only renames. Every step tolerates having already run, so an
//! interrupted commit can simply be repeated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::TransactionId;
use crate::fs::metadata::{create_symlink, set_mtime};
use crate::fs::ops::{
    ensure_parent, prune_empty_parents, remove_files_with_suffix, remove_if_exists,
    resolve_relative, write_atomic,
};
use crate::manifest::{Digest, Manifest, Metadata};
use crate::transfer::TransferHandle;
use crate::utils::errors::{Result, SyncError};

pub const CACHE_FILE: &str = "cache.json";
pub const CACHE_BACKUP_FILE: &str = "cache.json.bak";
pub const MARKER_FILE: &str = "transaction.json";
pub const TMP_DIR: &str = "tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Files are being staged; the remote has not started committing.
    Staging,
    /// All staged; the remote commit may have started.
    Committing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StagedOp {
    /// Move `staging-<id>/files/<path>` to `<root>/<path>`.
    Place { path: String },
    Delete { path: String },
    /// Keep the current local copy under `backup_path` before it is replaced.
    Backup { path: String, backup_path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMarker {
    pub transaction_id: TransactionId,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub had_cache: bool,
    #[serde(default)]
    pub target_snapshot_id: Option<String>,
    #[serde(default)]
    pub target_snapshot_hash: Option<Digest>,
    #[serde(default)]
    pub ops: Vec<StagedOp>,
}

/// `dir/stem (conflict <stamp>).ext`
pub fn conflict_backup_path(path: &str, stamp: i64) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };

    if let Some((stem, ext)) = name.rsplit_once('.') {
        if !stem.is_empty() {
            return format!("{dir}{stem} (conflict {stamp}).{ext}");
        }
    }

    format!("{dir}{name} (conflict {stamp})")
}

pub struct ClientStaging {
    root: PathBuf,
    meta: PathBuf,
    marker: Option<TransactionMarker>,
}

impl ClientStaging {
    pub fn new(root: impl Into<PathBuf>, metadata_dir: &str) -> Self {
        let root = root.into();
        let meta = root.join(metadata_dir);
        Self {
            root,
            meta,
            marker: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_path(&self) -> PathBuf {
        self.meta.join(CACHE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.meta.join(CACHE_BACKUP_FILE)
    }

    fn marker_path(&self) -> PathBuf {
        self.meta.join(MARKER_FILE)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.meta.join(TMP_DIR)
    }

    fn staging_dir(&self, id: &TransactionId) -> PathBuf {
        self.meta.join(format!("staging-{id}"))
    }

    fn staged_file(&self, id: &TransactionId, path: &str) -> Result<PathBuf> {
        resolve_relative(&self.staging_dir(id).join("files"), path)
    }

    fn staged_cache(&self, id: &TransactionId) -> PathBuf {
        self.staging_dir(id).join(CACHE_FILE)
    }

    /// The cache manifest; empty when the working copy was never synced.
    pub fn load_cache(&self) -> Result<Manifest> {
        Manifest::load_or_empty(&self.cache_path())
    }

    pub fn read_marker(&self) -> Result<Option<TransactionMarker>> {
        let path = self.marker_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::io(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SyncError::Deserialization {
                context: path.display().to_string(),
                source,
            })
    }

    fn write_marker(&self, marker: &TransactionMarker) -> Result<()> {
        write_atomic(&self.marker_path(), &serde_json::to_vec_pretty(marker)?)
    }

    fn current(&mut self) -> Result<&mut TransactionMarker> {
        self.marker
            .as_mut()
            .ok_or_else(|| SyncError::NotFound("no client transaction in progress".into()))
    }

    /// Back up the cache and write the in-progress marker.
    pub fn begin(&mut self, id: &TransactionId, target: Option<&Metadata>) -> Result<()> {
        if let Some(existing) = self.read_marker()? {
            return Err(SyncError::PendingTransaction {
                transaction_id: existing.transaction_id.to_string(),
            });
        }

        fs::create_dir_all(&self.meta).map_err(|e| SyncError::io(&self.meta, e))?;

        let cache = self.cache_path();
        let had_cache = cache.exists();
        if had_cache {
            let bytes = fs::read(&cache).map_err(|e| SyncError::io(&cache, e))?;
            write_atomic(&self.backup_path(), &bytes)?;
        }

        let staging = self.staging_dir(id);
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| SyncError::io(&staging, e))?;
        }
        let files = staging.join("files");
        fs::create_dir_all(&files).map_err(|e| SyncError::io(&files, e))?;

        let marker = TransactionMarker {
            transaction_id: id.clone(),
            phase: Phase::Staging,
            started_at: Utc::now(),
            had_cache,
            target_snapshot_id: target.map(|m| m.snapshot_id.clone()),
            target_snapshot_hash: target.and_then(|m| m.snapshot_hash.clone()),
            ops: Vec::new(),
        };
        self.write_marker(&marker)?;
        self.marker = Some(marker);

        tracing::debug!(transaction_id = %id, had_cache, "Client transaction started");
        Ok(())
    }

    /// Move a downloaded temp file into staging.
    pub fn stage_file(&mut self, path: &str, handle: &TransferHandle, mtime: Option<i64>) -> Result<()> {
        let id = self.current()?.transaction_id.clone();
        let dest = self.staged_file(&id, path)?;
        ensure_parent(&dest)?;
        fs::rename(&handle.path, &dest).map_err(|e| SyncError::io(&dest, e))?;
        if let Some(mtime) = mtime {
            set_mtime(&dest, mtime).map_err(|e| SyncError::io(&dest, e))?;
        }
        self.current()?.ops.push(StagedOp::Place {
            path: path.to_string(),
        });
        Ok(())
    }

    pub fn stage_link(&mut self, path: &str, target: &str) -> Result<()> {
        let id = self.current()?.transaction_id.clone();
        let dest = self.staged_file(&id, path)?;
        ensure_parent(&dest)?;
        remove_if_exists(&dest)?;
        create_symlink(target, &dest).map_err(|e| SyncError::io(&dest, e))?;
        self.current()?.ops.push(StagedOp::Place {
            path: path.to_string(),
        });
        Ok(())
    }

    pub fn stage_delete(&mut self, path: &str) -> Result<()> {
        resolve_relative(&self.root, path)?;
        self.current()?.ops.push(StagedOp::Delete {
            path: path.to_string(),
        });
        Ok(())
    }

    /// Keep the current local copy of `path` as a conflict backup.
    pub fn stage_backup(&mut self, path: &str, stamp: i64) -> Result<String> {
        let backup_path = conflict_backup_path(path, stamp);
        self.current()?.ops.push(StagedOp::Backup {
            path: path.to_string(),
            backup_path: backup_path.clone(),
        });
        Ok(backup_path)
    }

    pub fn stage_manifest(&mut self, manifest: &Manifest) -> Result<()> {
        let id = self.current()?.transaction_id.clone();
        manifest.save(&self.staged_cache(&id))
    }

    /// Persist the full operation list before the remote commit starts.
    pub fn prepare_commit(&mut self) -> Result<()> {
        let marker = self.current()?;
        marker.phase = Phase::Committing;
        let snapshot = marker.clone();
        self.write_marker(&snapshot)
    }

    /// Apply the staged operations of the current transaction.
    pub fn commit(&mut self) -> Result<()> {
        let marker = match self.marker.take() {
            Some(marker) => marker,
            None => self
                .read_marker()?
                .ok_or_else(|| SyncError::NotFound("no client transaction to commit".into()))?,
        };
        self.roll_forward(&marker)
    }

    /// Apply `marker`'s operations; safe to repeat.
    pub fn roll_forward(&self, marker: &TransactionMarker) -> Result<()> {
        let id = &marker.transaction_id;

        for op in &marker.ops {
            match op {
                StagedOp::Backup { path, backup_path } => {
                    let current = resolve_relative(&self.root, path)?;
                    let backup = resolve_relative(&self.root, backup_path)?;
                    if fs::symlink_metadata(&current).is_ok() && fs::symlink_metadata(&backup).is_err() {
                        fs::rename(&current, &backup).map_err(|e| SyncError::io(&backup, e))?;
                        tracing::info!(path = %path, backup = %backup_path, "Kept local copy as conflict backup");
                    }
                }
                StagedOp::Place { path } => {
                    let staged = self.staged_file(id, path)?;
                    let dest = resolve_relative(&self.root, path)?;
                    if fs::symlink_metadata(&staged).is_err() {
                        // Already moved by an earlier attempt.
                        continue;
                    }
                    ensure_parent(&dest)?;
                    fs::rename(&staged, &dest).map_err(|e| SyncError::io(&dest, e))?;
                }
                StagedOp::Delete { path } => {
                    let dest = resolve_relative(&self.root, path)?;
                    if remove_if_exists(&dest)? {
                        prune_empty_parents(&self.root, &dest);
                    }
                }
            }
        }

        let staged_cache = self.staged_cache(id);
        if staged_cache.exists() {
            let cache = self.cache_path();
            fs::rename(&staged_cache, &cache).map_err(|e| SyncError::io(&cache, e))?;
        }

        self.cleanup(id)?;
        tracing::info!(transaction_id = %id, ops = marker.ops.len(), "Client transaction committed");
        Ok(())
    }

    /// Discard the current transaction.
    pub fn rollback(&mut self, id: &TransactionId) -> Result<()> {
        let marker = self.marker.take();
        let had_cache = marker.as_ref().map_or(true, |m| m.had_cache);
        self.rollback_with(id, had_cache)
    }

    /// Discard the transaction recorded in `marker`; safe to repeat.
    pub fn rollback_marker(&self, marker: &TransactionMarker) -> Result<()> {
        self.rollback_with(&marker.transaction_id, marker.had_cache)
    }

    fn rollback_with(&self, id: &TransactionId, had_cache: bool) -> Result<()> {
        let staging = self.staging_dir(id);
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| SyncError::io(&staging, e))?;
        }

        let backup = self.backup_path();
        let cache = self.cache_path();
        if backup.exists() {
            fs::rename(&backup, &cache).map_err(|e| SyncError::io(&cache, e))?;
        } else if !had_cache {
            remove_if_exists(&cache)?;
        }

        let removed = remove_files_with_suffix(&self.root, &id.pending_suffix())?;
        remove_if_exists(&self.marker_path())?;

        tracing::info!(transaction_id = %id, stray_files = removed, "Client transaction rolled back");
        Ok(())
    }

    fn cleanup(&self, id: &TransactionId) -> Result<()> {
        let staging = self.staging_dir(id);
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| SyncError::io(&staging, e))?;
        }
        remove_if_exists(&self.backup_path())?;
        remove_files_with_suffix(&self.tmp_dir(), &id.pending_suffix())?;
        remove_if_exists(&self.marker_path())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileEntry;
    use tempfile::TempDir;

    fn handle_for(dir: &Path, name: &str, content: &[u8]) -> TransferHandle {
        let path = dir.join(name);
        fs::create_dir_all(dir).unwrap();
        fs::write(&path, content).unwrap();
        TransferHandle {
            path,
            size: content.len() as u64,
            digest: Digest::of_bytes(content),
        }
    }

    fn cache_with(path: &str) -> Manifest {
        let mut m = Manifest::new();
        m.insert(FileEntry::file(path, 1, 1, None)).unwrap();
        m
    }

    #[test]
    fn backup_paths_keep_extension() {
        assert_eq!(conflict_backup_path("docs/a.txt", 17), "docs/a (conflict 17).txt");
        assert_eq!(conflict_backup_path("Makefile", 17), "Makefile (conflict 17)");
        assert_eq!(conflict_backup_path(".env", 17), ".env (conflict 17)");
    }

    #[test]
    fn commit_places_files_and_replaces_cache() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("old.txt"), b"old").unwrap();
        let mut client = ClientStaging::new(root, ".snapsync");
        cache_with("old.txt").save(&client.cache_path()).unwrap();

        let id = TransactionId::from("t1");
        client.begin(&id, None).unwrap();
        assert!(client.read_marker().unwrap().is_some());

        let handle = handle_for(&client.tmp_dir(), "x.pending-t1", b"new content");
        client.stage_file("dir/new.txt", &handle, Some(1_600_000_000)).unwrap();
        client.stage_delete("old.txt").unwrap();
        client.stage_manifest(&cache_with("dir/new.txt")).unwrap();
        assert!(!root.join("dir/new.txt").exists(), "nothing visible before commit");

        client.prepare_commit().unwrap();
        client.commit().unwrap();

        assert_eq!(fs::read(root.join("dir/new.txt")).unwrap(), b"new content");
        assert!(!root.join("old.txt").exists());
        assert!(client.load_cache().unwrap().contains("dir/new.txt"));
        assert!(client.read_marker().unwrap().is_none());
        assert!(!root.join(".snapsync/staging-t1").exists());
        assert!(!root.join(".snapsync/cache.json.bak").exists());
    }

    #[test]
    fn roll_forward_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let mut client = ClientStaging::new(dir.path(), ".snapsync");
        let id = TransactionId::from("t2");
        client.begin(&id, None).unwrap();
        let handle = handle_for(&client.tmp_dir(), "y.pending-t2", b"abc");
        client.stage_file("a.txt", &handle, None).unwrap();
        client.stage_manifest(&cache_with("a.txt")).unwrap();
        client.prepare_commit().unwrap();

        let marker = client.read_marker().unwrap().unwrap();
        assert_eq!(marker.phase, Phase::Committing);
        client.roll_forward(&marker).unwrap();
        client.roll_forward(&marker).unwrap();
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"abc");
    }

    #[test]
    fn rollback_restores_cache_and_removes_strays() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let mut client = ClientStaging::new(root, ".snapsync");
        let original = cache_with("keep.txt");
        original.save(&client.cache_path()).unwrap();
        let original_bytes = fs::read(client.cache_path()).unwrap();

        let id = TransactionId::from("t3");
        client.begin(&id, None).unwrap();
        let handle = handle_for(&client.tmp_dir(), "z.pending-t3", b"abc");
        client.stage_file("a.txt", &handle, None).unwrap();
        fs::write(root.join("stray.txt.pending-t3"), b"partial").unwrap();
        fs::write(root.join("other.txt.pending-zz"), b"someone else").unwrap();
        // Simulate a cache that got clobbered mid-transaction.
        fs::write(client.cache_path(), b"garbage").unwrap();

        client.rollback(&id).unwrap();

        assert_eq!(fs::read(client.cache_path()).unwrap(), original_bytes);
        assert!(!root.join("stray.txt.pending-t3").exists());
        assert!(root.join("other.txt.pending-zz").exists());
        assert!(!root.join(".snapsync/staging-t3").exists());
        assert!(!root.join("a.txt").exists());
        assert!(client.read_marker().unwrap().is_none());
    }

    #[test]
    fn begin_refuses_while_a_marker_exists() {
        let dir = TempDir::new().unwrap();
        let mut client = ClientStaging::new(dir.path(), ".snapsync");
        client.begin(&TransactionId::from("t4"), None).unwrap();

        let mut second = ClientStaging::new(dir.path(), ".snapsync");
        let err = second.begin(&TransactionId::from("t5"), None).unwrap_err();
        assert!(matches!(err, SyncError::PendingTransaction { ref transaction_id } if transaction_id == "t4"));
    }

    #[test]
    fn conflict_backup_keeps_previous_local_copy() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("doc.txt"), b"mine").unwrap();

        let mut client = ClientStaging::new(root, ".snapsync");
        let id = TransactionId::from("t6");
        client.begin(&id, None).unwrap();
        let backup = client.stage_backup("doc.txt", 42).unwrap();
        let handle = handle_for(&client.tmp_dir(), "d.pending-t6", b"theirs");
        client.stage_file("doc.txt", &handle, None).unwrap();
        client.prepare_commit().unwrap();
        client.commit().unwrap();

        assert_eq!(backup, "doc (conflict 42).txt");
        assert_eq!(fs::read(root.join("doc.txt")).unwrap(), b"theirs");
        assert_eq!(fs::read(root.join("doc (conflict 42).txt")).unwrap(), b"mine");
    }
}
