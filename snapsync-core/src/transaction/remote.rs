//! Remote side of a transaction.
//!
//! [`RemoteStore`] is the narrow protocol the coordinator drives. The
//! directory implementation here stages into a per-transaction tree and
//! keeps snapshot history as a hard-link farm; copy-on-write backends live
//! in the binary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::TransactionId;
use crate::fs::metadata::{create_symlink, set_mtime};
use crate::fs::ops::{
    ensure_parent, prune_empty_parents, remove_if_exists, resolve_relative, write_atomic,
    FileOperations, LocalFileOperations,
};
use crate::manifest::{FileEntry, Manifest};
use crate::transfer::{ContentStream, TransferHandle};
use crate::utils::errors::{Result, SyncError};

pub const HEAD_MANIFEST: &str = "manifest.json";
pub const SNAPSHOTS_DIR: &str = "snapshots";
const COMMIT_RECORD: &str = "commit.json";

/// What crash recovery found on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteRecovery {
    /// The commit had passed its commit point and has now been finished.
    Completed,
    /// Staged state was found and thrown away.
    Discarded,
    /// No trace of the transaction.
    NothingPending,
}

pub trait RemoteStore: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// File access used by the distributed lock.
    fn lock_ops(&self) -> Arc<dyn FileOperations>;

    /// The head manifest; empty when the remote was never initialised.
    fn load_manifest(&self) -> Result<Manifest>;

    fn load_snapshot_manifest(&self, snapshot_id: &str) -> Result<Option<Manifest>>;

    /// Content of `path` at the head, or in a named snapshot.
    fn open_file(&self, path: &str, snapshot_id: Option<&str>) -> Result<ContentStream>;

    /// Start isolating changes. Returns the directory transport temp files go to.
    fn begin_transaction(&self, id: &TransactionId) -> Result<PathBuf>;

    fn stage_upload(
        &self,
        id: &TransactionId,
        path: &str,
        handle: &TransferHandle,
        mtime: Option<i64>,
    ) -> Result<()>;

    fn stage_link(&self, id: &TransactionId, path: &str, target: &str) -> Result<()>;

    fn stage_delete(&self, id: &TransactionId, path: &str) -> Result<()>;

    /// The manifest that becomes the head on commit. Its `snapshot_id`
    /// names the snapshot recorded by the commit.
    fn stage_manifest(&self, id: &TransactionId, manifest: &Manifest) -> Result<()>;

    /// Make the staged state live. Once this starts there is no rollback.
    fn commit_transaction(&self, id: &TransactionId) -> Result<()>;

    fn rollback_transaction(&self, id: &TransactionId) -> Result<()>;

    /// Finish or discard whatever `id` left behind after a crash. A commit
    /// planned against a head that has since moved on is discarded.
    fn recover_transaction(&self, id: &TransactionId) -> Result<RemoteRecovery>;

    /// Transactions that passed their commit point but were never finished.
    fn pending_commits(&self) -> Result<Vec<TransactionId>>;

    /// Finish every commit left behind on the remote, whichever client
    /// started it. Returns the ones completed.
    fn recover_committed(&self) -> Result<Vec<TransactionId>> {
        let mut completed = Vec::new();
        for id in self.pending_commits()? {
            if self.recover_transaction(&id)? == RemoteRecovery::Completed {
                completed.push(id);
            }
        }
        Ok(completed)
    }
}

/// Whether `staged` was planned against `head`, or already is it.
pub fn extends_head(head: &Manifest, staged: &Manifest) -> bool {
    let previous = staged
        .metadata
        .as_ref()
        .and_then(|m| m.snapshot_previous.as_deref());
    head.snapshot_id() == previous
        || (staged.snapshot_id().is_some() && head.snapshot_id() == staged.snapshot_id())
}

/// Refusal to replace a head the transaction was not planned against.
pub fn superseded_error(id: &TransactionId, head: &Manifest) -> SyncError {
    SyncError::Backend {
        operation: "commit".into(),
        message: format!(
            "transaction {id} was planned against an older head; the remote is now at {}",
            head.snapshot_id().unwrap_or("an unnamed snapshot")
        ),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Journal {
    uploads: Vec<String>,
    deletes: Vec<String>,
}

/// A remote store that is a plain directory (local disk or a mount).
///
/// Layout under `<root>/<metadata_dir>/`:
///
/// - `manifest.json`: the head manifest
/// - `snapshots/<id>/manifest.json` and `snapshots/<id>/files/...`
/// - `txn-<id>/files/...`, `txn-<id>/tmp/`, `txn-<id>/manifest.json`
/// - `txn-<id>/commit.json`: written at the commit point
pub struct DirectoryRemote {
    root: PathBuf,
    meta: PathBuf,
    journals: Mutex<HashMap<String, Journal>>,
}

impl DirectoryRemote {
    pub fn new(root: impl Into<PathBuf>, metadata_dir: &str) -> Self {
        let root = root.into();
        let meta = root.join(metadata_dir);
        Self {
            root,
            meta,
            journals: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn head_path(&self) -> PathBuf {
        self.meta.join(HEAD_MANIFEST)
    }

    fn txn_dir(&self, id: &TransactionId) -> PathBuf {
        self.meta.join(format!("txn-{id}"))
    }

    fn snapshot_dir(&self, snapshot_id: &str) -> Result<PathBuf> {
        resolve_relative(&self.meta.join(SNAPSHOTS_DIR), snapshot_id)
    }

    fn with_journal<T>(&self, id: &TransactionId, f: impl FnOnce(&mut Journal) -> T) -> Result<T> {
        let mut journals = self.journals.lock().map_err(|_| SyncError::Backend {
            operation: "journal".into(),
            message: "journal lock poisoned".into(),
        })?;
        let journal = journals
            .get_mut(id.as_str())
            .ok_or_else(|| SyncError::NotFound(format!("remote transaction {id}")))?;
        Ok(f(journal))
    }

    fn take_journal(&self, id: &TransactionId) -> Option<Journal> {
        self.journals.lock().ok().and_then(|mut j| j.remove(id.as_str()))
    }

    fn read_commit_record(&self, id: &TransactionId) -> Result<Option<Journal>> {
        let path = self.txn_dir(id).join(COMMIT_RECORD);
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

    /// The live head, when it moved on since `id` was planned. Once the
    /// staged manifest has been renamed into place there is nothing left to
    /// compare.
    fn superseding_head(&self, id: &TransactionId) -> Result<Option<Manifest>> {
        let staged = self.txn_dir(id).join(HEAD_MANIFEST);
        if !staged.exists() {
            return Ok(None);
        }
        let head = self.load_manifest()?;
        if extends_head(&head, &Manifest::load(&staged)?) {
            Ok(None)
        } else {
            Ok(Some(head))
        }
    }

    /// Everything after the commit point. Each step tolerates having run before.
    fn apply_commit(&self, id: &TransactionId, journal: &Journal) -> Result<()> {
        if let Some(head) = self.superseding_head(id)? {
            return Err(superseded_error(id, &head));
        }

        let txn = self.txn_dir(id);
        let staged_files = txn.join("files");

        for path in &journal.uploads {
            let staged = resolve_relative(&staged_files, path)?;
            if fs::symlink_metadata(&staged).is_err() {
                continue;
            }
            let dest = resolve_relative(&self.root, path)?;
            ensure_parent(&dest)?;
            fs::rename(&staged, &dest).map_err(|e| SyncError::io(&dest, e))?;
        }

        for path in &journal.deletes {
            let dest = resolve_relative(&self.root, path)?;
            if remove_if_exists(&dest)? {
                prune_empty_parents(&self.root, &dest);
            }
        }

        let staged_manifest = txn.join(HEAD_MANIFEST);
        let manifest = if staged_manifest.exists() {
            Manifest::load(&staged_manifest)?
        } else {
            self.load_manifest()?
        };
        if let Some(snapshot_id) = manifest.snapshot_id() {
            self.record_snapshot(snapshot_id, &manifest)?;
        }

        if staged_manifest.exists() {
            let head = self.head_path();
            fs::rename(&staged_manifest, &head).map_err(|e| SyncError::io(&head, e))?;
        }

        if txn.exists() {
            fs::remove_dir_all(&txn).map_err(|e| SyncError::io(&txn, e))?;
        }
        Ok(())
    }

    /// Hard-link every head file into `snapshots/<id>/files`, copying where
    /// links are not supported.
    fn record_snapshot(&self, snapshot_id: &str, manifest: &Manifest) -> Result<()> {
        let dir = self.snapshot_dir(snapshot_id)?;
        let files = dir.join("files");
        fs::create_dir_all(&files).map_err(|e| SyncError::io(&files, e))?;

        for entry in manifest.entries() {
            let dest = resolve_relative(&files, entry.path())?;
            if fs::symlink_metadata(&dest).is_ok() {
                continue;
            }
            ensure_parent(&dest)?;
            match entry {
                FileEntry::Link { reference, .. } => {
                    create_symlink(reference, &dest).map_err(|e| SyncError::io(&dest, e))?;
                }
                FileEntry::File { .. } => {
                    let source = resolve_relative(&self.root, entry.path())?;
                    if fs::hard_link(&source, &dest).is_err() {
                        fs::copy(&source, &dest).map_err(|e| SyncError::io(&dest, e))?;
                    }
                }
            }
        }

        manifest.save(&dir.join(HEAD_MANIFEST))?;
        tracing::debug!(snapshot_id, entries = manifest.len(), "Recorded remote snapshot");
        Ok(())
    }
}

impl RemoteStore for DirectoryRemote {
    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    fn lock_ops(&self) -> Arc<dyn FileOperations> {
        Arc::new(LocalFileOperations::new(&self.root))
    }

    fn load_manifest(&self) -> Result<Manifest> {
        Manifest::load_or_empty(&self.head_path())
    }

    fn load_snapshot_manifest(&self, snapshot_id: &str) -> Result<Option<Manifest>> {
        let path = self.snapshot_dir(snapshot_id)?.join(HEAD_MANIFEST);
        match Manifest::load(&path) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn open_file(&self, path: &str, snapshot_id: Option<&str>) -> Result<ContentStream> {
        let base = match snapshot_id {
            Some(snapshot) => self.snapshot_dir(snapshot)?.join("files"),
            None => self.root.clone(),
        };
        let full = resolve_relative(&base, path)?;
        ContentStream::from_file(&full, path)
    }

    fn begin_transaction(&self, id: &TransactionId) -> Result<PathBuf> {
        let txn = self.txn_dir(id);
        if txn.exists() {
            fs::remove_dir_all(&txn).map_err(|e| SyncError::io(&txn, e))?;
        }
        let tmp = txn.join("tmp");
        for dir in [txn.join("files"), tmp.clone()] {
            fs::create_dir_all(&dir).map_err(|e| SyncError::io(&dir, e))?;
        }

        self.journals
            .lock()
            .map_err(|_| SyncError::Backend {
                operation: "begin".into(),
                message: "journal lock poisoned".into(),
            })?
            .insert(id.to_string(), Journal::default());

        tracing::debug!(transaction_id = %id, remote = %self.root.display(), "Remote transaction started");
        Ok(tmp)
    }

    fn stage_upload(
        &self,
        id: &TransactionId,
        path: &str,
        handle: &TransferHandle,
        mtime: Option<i64>,
    ) -> Result<()> {
        let dest = resolve_relative(&self.txn_dir(id).join("files"), path)?;
        ensure_parent(&dest)?;
        fs::rename(&handle.path, &dest).map_err(|e| SyncError::io(&dest, e))?;
        if let Some(mtime) = mtime {
            set_mtime(&dest, mtime).map_err(|e| SyncError::io(&dest, e))?;
        }
        self.with_journal(id, |j| j.uploads.push(path.to_string()))
    }

    fn stage_link(&self, id: &TransactionId, path: &str, target: &str) -> Result<()> {
        let dest = resolve_relative(&self.txn_dir(id).join("files"), path)?;
        ensure_parent(&dest)?;
        remove_if_exists(&dest)?;
        create_symlink(target, &dest).map_err(|e| SyncError::io(&dest, e))?;
        self.with_journal(id, |j| j.uploads.push(path.to_string()))
    }

    fn stage_delete(&self, id: &TransactionId, path: &str) -> Result<()> {
        resolve_relative(&self.root, path)?;
        self.with_journal(id, |j| j.deletes.push(path.to_string()))
    }

    fn stage_manifest(&self, id: &TransactionId, manifest: &Manifest) -> Result<()> {
        manifest.save(&self.txn_dir(id).join(HEAD_MANIFEST))
    }

    fn commit_transaction(&self, id: &TransactionId) -> Result<()> {
        let journal = self
            .take_journal(id)
            .ok_or_else(|| SyncError::NotFound(format!("remote transaction {id}")))?;

        if let Some(head) = self.superseding_head(id)? {
            return Err(superseded_error(id, &head));
        }

        let record = self.txn_dir(id).join(COMMIT_RECORD);
        write_atomic(&record, &serde_json::to_vec_pretty(&journal)?)?;

        self.apply_commit(id, &journal)?;
        tracing::info!(
            transaction_id = %id,
            uploads = journal.uploads.len(),
            deletes = journal.deletes.len(),
            "Remote transaction committed"
        );
        Ok(())
    }

    fn rollback_transaction(&self, id: &TransactionId) -> Result<()> {
        self.take_journal(id);
        let txn = self.txn_dir(id);
        if txn.exists() {
            fs::remove_dir_all(&txn).map_err(|e| SyncError::io(&txn, e))?;
        }
        tracing::debug!(transaction_id = %id, "Remote transaction discarded");
        Ok(())
    }

    fn recover_transaction(&self, id: &TransactionId) -> Result<RemoteRecovery> {
        if let Some(journal) = self.read_commit_record(id)? {
            if let Some(head) = self.superseding_head(id)? {
                tracing::warn!(
                    transaction_id = %id,
                    head = ?head.snapshot_id(),
                    "Discarding interrupted commit planned against an older head"
                );
                self.rollback_transaction(id)?;
                return Ok(RemoteRecovery::Discarded);
            }
            self.apply_commit(id, &journal)?;
            tracing::info!(transaction_id = %id, "Finished interrupted remote commit");
            return Ok(RemoteRecovery::Completed);
        }
        if self.txn_dir(id).exists() {
            self.rollback_transaction(id)?;
            return Ok(RemoteRecovery::Discarded);
        }
        Ok(RemoteRecovery::NothingPending)
    }

    fn pending_commits(&self) -> Result<Vec<TransactionId>> {
        let entries = match fs::read_dir(&self.meta) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SyncError::io(&self.meta, e)),
        };

        let mut pending = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SyncError::io(&self.meta, e))?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_prefix("txn-")) else {
                continue;
            };
            if entry.path().join(COMMIT_RECORD).exists() {
                pending.push(TransactionId::from(id));
            }
        }
        pending.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Digest;
    use std::io::Read;
    use tempfile::TempDir;

    fn upload(remote: &DirectoryRemote, id: &TransactionId, tmp: &Path, path: &str, body: &[u8]) {
        let temp = tmp.join(format!("{}.pending-{id}", path.replace('/', "_")));
        fs::write(&temp, body).unwrap();
        let handle = TransferHandle {
            path: temp,
            size: body.len() as u64,
            digest: Digest::of_bytes(body),
        };
        remote.stage_upload(id, path, &handle, Some(1_700_000_000)).unwrap();
    }

    fn manifest(snapshot: &str, previous: Option<&Manifest>, paths: &[&str]) -> Manifest {
        let mut m = Manifest::new();
        for p in paths {
            m.insert(FileEntry::file(*p, 1, 1_700_000_000, None)).unwrap();
        }
        m.link_snapshot(snapshot, "alice", "test", previous);
        m
    }

    fn read_stream(stream: ContentStream) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in stream {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[test]
    fn commit_publishes_files_manifest_and_snapshot() {
        let dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(dir.path(), ".snapsync");
        let id = TransactionId::from("t1");

        let tmp = remote.begin_transaction(&id).unwrap();
        upload(&remote, &id, &tmp, "a/b.txt", b"hello");
        remote.stage_manifest(&id, &manifest("s1", None, &["a/b.txt"])).unwrap();
        assert!(!dir.path().join("a/b.txt").exists());
        assert!(remote.load_manifest().unwrap().is_empty());

        remote.commit_transaction(&id).unwrap();

        assert_eq!(fs::read(dir.path().join("a/b.txt")).unwrap(), b"hello");
        assert_eq!(remote.load_manifest().unwrap().snapshot_id(), Some("s1"));
        assert!(remote.load_snapshot_manifest("s1").unwrap().is_some());
        assert!(remote.load_snapshot_manifest("nope").unwrap().is_none());
        assert!(!dir.path().join(".snapsync/txn-t1").exists());
    }

    #[test]
    fn snapshots_keep_old_content() {
        let dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(dir.path(), ".snapsync");

        let first = TransactionId::from("t1");
        let tmp = remote.begin_transaction(&first).unwrap();
        upload(&remote, &first, &tmp, "doc.txt", b"v1");
        remote.stage_manifest(&first, &manifest("s1", None, &["doc.txt"])).unwrap();
        remote.commit_transaction(&first).unwrap();

        let second = TransactionId::from("t2");
        let tmp = remote.begin_transaction(&second).unwrap();
        upload(&remote, &second, &tmp, "doc.txt", b"v2");
        let head = remote.load_manifest().unwrap();
        remote
            .stage_manifest(&second, &manifest("s2", Some(&head), &["doc.txt"]))
            .unwrap();
        remote.commit_transaction(&second).unwrap();

        assert_eq!(read_stream(remote.open_file("doc.txt", None).unwrap()), b"v2");
        assert_eq!(read_stream(remote.open_file("doc.txt", Some("s1")).unwrap()), b"v1");

        let mut raw = String::new();
        fs::File::open(dir.path().join(".snapsync/snapshots/s2/files/doc.txt"))
            .unwrap()
            .read_to_string(&mut raw)
            .unwrap();
        assert_eq!(raw, "v2");
    }

    #[test]
    fn deletes_prune_empty_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("old/deep")).unwrap();
        fs::write(dir.path().join("old/deep/x.txt"), b"x").unwrap();
        let remote = DirectoryRemote::new(dir.path(), ".snapsync");

        let id = TransactionId::from("t1");
        remote.begin_transaction(&id).unwrap();
        remote.stage_delete(&id, "old/deep/x.txt").unwrap();
        remote.stage_manifest(&id, &manifest("s1", None, &[])).unwrap();
        remote.commit_transaction(&id).unwrap();

        assert!(!dir.path().join("old").exists());
    }

    #[test]
    fn rollback_leaves_head_untouched() {
        let dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(dir.path(), ".snapsync");
        let id = TransactionId::from("t1");
        let tmp = remote.begin_transaction(&id).unwrap();
        upload(&remote, &id, &tmp, "a.txt", b"a");
        remote.stage_manifest(&id, &manifest("s1", None, &["a.txt"])).unwrap();

        remote.rollback_transaction(&id).unwrap();
        assert!(!dir.path().join("a.txt").exists());
        assert!(remote.load_manifest().unwrap().is_empty());
        assert_eq!(remote.recover_transaction(&id).unwrap(), RemoteRecovery::NothingPending);
    }

    #[test]
    fn recovery_finishes_a_commit_past_its_commit_point() {
        let dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(dir.path(), ".snapsync");
        let id = TransactionId::from("t1");
        let tmp = remote.begin_transaction(&id).unwrap();
        upload(&remote, &id, &tmp, "a.txt", b"a");
        remote.stage_manifest(&id, &manifest("s1", None, &["a.txt"])).unwrap();

        // Crash right after the commit record hit the disk.
        let journal = Journal {
            uploads: vec!["a.txt".into()],
            deletes: vec![],
        };
        fs::write(
            dir.path().join(".snapsync/txn-t1/commit.json"),
            serde_json::to_vec(&journal).unwrap(),
        )
        .unwrap();

        let fresh = DirectoryRemote::new(dir.path(), ".snapsync");
        assert_eq!(fresh.recover_transaction(&id).unwrap(), RemoteRecovery::Completed);
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"a");
        assert_eq!(fresh.load_manifest().unwrap().snapshot_id(), Some("s1"));
        assert_eq!(fresh.recover_transaction(&id).unwrap(), RemoteRecovery::NothingPending);
    }

    #[test]
    fn recovery_discards_uncommitted_staging() {
        let dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(dir.path(), ".snapsync");
        let id = TransactionId::from("t1");
        let tmp = remote.begin_transaction(&id).unwrap();
        upload(&remote, &id, &tmp, "a.txt", b"a");

        let fresh = DirectoryRemote::new(dir.path(), ".snapsync");
        assert_eq!(fresh.recover_transaction(&id).unwrap(), RemoteRecovery::Discarded);
        assert!(!dir.path().join("a.txt").exists());
        assert!(!dir.path().join(".snapsync/txn-t1").exists());
    }

    fn record_commit(remote: &DirectoryRemote, id: &TransactionId, uploads: &[&str]) {
        let journal = Journal {
            uploads: uploads.iter().map(|p| p.to_string()).collect(),
            deletes: vec![],
        };
        fs::write(
            remote.txn_dir(id).join(COMMIT_RECORD),
            serde_json::to_vec(&journal).unwrap(),
        )
        .unwrap();
    }

    fn commit(remote: &DirectoryRemote, id: &str, snapshot: &str, path: &str, body: &[u8]) {
        let id = TransactionId::from(id);
        let head = remote.load_manifest().unwrap();
        let tmp = remote.begin_transaction(&id).unwrap();
        upload(remote, &id, &tmp, path, body);
        let mut paths: Vec<&str> = head.paths().collect();
        paths.push(path);
        remote
            .stage_manifest(&id, &manifest(snapshot, Some(&head), &paths))
            .unwrap();
        remote.commit_transaction(&id).unwrap();
    }

    #[test]
    fn pending_commits_are_finished_by_any_client() {
        let dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(dir.path(), ".snapsync");
        commit(&remote, "t1", "s1", "a.txt", b"a");
        assert!(remote.pending_commits().unwrap().is_empty());

        // Another client passed its commit point and died.
        let id = TransactionId::from("crashed");
        let head = remote.load_manifest().unwrap();
        let tmp = remote.begin_transaction(&id).unwrap();
        upload(&remote, &id, &tmp, "b.txt", b"b");
        remote
            .stage_manifest(&id, &manifest("s2", Some(&head), &["a.txt", "b.txt"]))
            .unwrap();
        record_commit(&remote, &id, &["b.txt"]);

        // Uncommitted staging from a third client is not touched.
        remote.begin_transaction(&TransactionId::from("staging")).unwrap();

        let fresh = DirectoryRemote::new(dir.path(), ".snapsync");
        assert_eq!(fresh.pending_commits().unwrap(), vec![id.clone()]);
        assert_eq!(fresh.recover_committed().unwrap(), vec![id]);
        assert_eq!(fresh.load_manifest().unwrap().snapshot_id(), Some("s2"));
        assert_eq!(fs::read(dir.path().join("b.txt")).unwrap(), b"b");
        assert!(dir.path().join(".snapsync/txn-staging").exists());
        assert!(fresh.recover_committed().unwrap().is_empty());
    }

    #[test]
    fn commit_planned_against_an_older_head_never_replaces_it() {
        let dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(dir.path(), ".snapsync");
        commit(&remote, "t1", "s1", "a.txt", b"a");

        // Planned before s2 landed.
        let stale_head = remote.load_manifest().unwrap();
        let late = TransactionId::from("late");
        let tmp = remote.begin_transaction(&late).unwrap();
        upload(&remote, &late, &tmp, "late.txt", b"late");
        remote
            .stage_manifest(&late, &manifest("s-late", Some(&stale_head), &["a.txt", "late.txt"]))
            .unwrap();
        commit(&remote, "t2", "s2", "c.txt", b"c");

        let err = remote.commit_transaction(&late).unwrap_err();
        assert!(matches!(err, SyncError::Backend { ref operation, .. } if operation == "commit"));
        assert_eq!(remote.load_manifest().unwrap().snapshot_id(), Some("s2"));
        assert!(!dir.path().join("late.txt").exists());

        // Same story when the stale commit is found after a crash.
        record_commit(&remote, &late, &["late.txt"]);
        let fresh = DirectoryRemote::new(dir.path(), ".snapsync");
        assert_eq!(fresh.recover_transaction(&late).unwrap(), RemoteRecovery::Discarded);
        let head = fresh.load_manifest().unwrap();
        assert_eq!(head.snapshot_id(), Some("s2"));
        assert!(head.get("c.txt").is_some());
        assert!(!dir.path().join("late.txt").exists());
        assert!(fresh.pending_commits().unwrap().is_empty());
    }
}
