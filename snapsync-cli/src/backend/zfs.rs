//! ZFS-backed remote store.
//!
//! Each transaction works in a clone of the live dataset:
//!
//! - begin: `zfs snapshot <ds>@snapsync-base-<txn>`, then `zfs clone` it to
//!   `<ds>-txn-<txn>` mounted beside the live mountpoint
//! - stage: plain file operations inside the clone's mountpoint
//! - commit: `zfs promote` the clone, retire the old dataset, rename the
//!   clone into place, restore the mountpoint, `zfs snapshot <ds>@<snapshot>`
//! - rollback: `zfs destroy -r` the clone and the base snapshot
//!
//! A commit record is written beside the lock before `promote` so an
//! interrupted commit can be finished on the next run. The lock itself lives
//! outside the dataset because the dataset is swapped during commit.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use snapsync_core::fs::ops::{resolve_relative, FileOperations};
use snapsync_core::manifest::Manifest;
use snapsync_core::transaction::remote::{extends_head, superseded_error, HEAD_MANIFEST};
use snapsync_core::transaction::{RemoteRecovery, RemoteStore, TransactionId};
use snapsync_core::transfer::{ContentStream, TransferHandle};
use snapsync_core::{Result, SyncError};

use super::host::{HostFileOperations, HostFs};

pub const LOCKS_DIR: &str = ".snapsync-locks";
const BASE_SNAPSHOT_PREFIX: &str = "snapsync-base-";
const COMMIT_RECORD_PREFIX: &str = "commit-";

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `zfs` on the host that owns the pool.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRunner;

impl CommandRunner for LocalRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| SyncError::io(program, e))?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitRecord {
    transaction_id: TransactionId,
    snapshot_id: Option<String>,
}

pub struct ZfsRemote {
    runner: Box<dyn CommandRunner>,
    fs: Arc<dyn HostFs>,
    dataset: String,
    mountpoint: PathBuf,
    metadata_dir: String,
    lock_root: PathBuf,
}

impl ZfsRemote {
    pub fn new(
        runner: Box<dyn CommandRunner>,
        fs: Arc<dyn HostFs>,
        dataset: impl Into<String>,
        mountpoint: impl Into<PathBuf>,
        metadata_dir: impl Into<String>,
    ) -> Self {
        let mountpoint = mountpoint.into();
        let lock_root = lock_root_for(&mountpoint);
        Self {
            runner,
            fs,
            dataset: dataset.into(),
            mountpoint,
            metadata_dir: metadata_dir.into(),
            lock_root,
        }
    }

    fn clone_name(&self, id: &TransactionId) -> String {
        format!("{}-txn-{id}", self.dataset)
    }

    fn retired_name(&self, id: &TransactionId) -> String {
        format!("{}-old-{id}", self.dataset)
    }

    fn base_snapshot(&self, id: &TransactionId) -> String {
        format!("{}@{BASE_SNAPSHOT_PREFIX}{id}", self.dataset)
    }

    fn clone_mountpoint(&self, id: &TransactionId) -> PathBuf {
        let mut name = self.mountpoint.as_os_str().to_os_string();
        name.push(format!("-txn-{id}"));
        PathBuf::from(name)
    }

    fn meta(&self, mount: &Path) -> PathBuf {
        mount.join(&self.metadata_dir)
    }

    fn records_dir(&self) -> PathBuf {
        self.lock_root.join(&self.metadata_dir)
    }

    fn commit_record_path(&self, id: &TransactionId) -> PathBuf {
        self.records_dir().join(format!("{COMMIT_RECORD_PREFIX}{id}.json"))
    }

    fn zfs(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        tracing::debug!(command = %format!("zfs {}", args.join(" ")), "Running zfs");
        let output = self.runner.run("zfs", &args)?;
        if !output.success {
            return Err(SyncError::Backend {
                operation: format!("zfs {}", args.first().map(String::as_str).unwrap_or("")),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Whether a dataset or snapshot exists.
    fn exists(&self, name: &str) -> Result<bool> {
        let args: Vec<String> = ["list", "-H", "-o", "name", "-t", "all", name]
            .iter()
            .map(|a| a.to_string())
            .collect();
        Ok(self.runner.run("zfs", &args)?.success)
    }

    fn destroy_if_exists(&self, name: &str) -> Result<()> {
        if self.exists(name)? {
            self.zfs(&["destroy", "-r", name])?;
        }
        Ok(())
    }

    fn is_promoted(&self, clone: &str) -> Result<bool> {
        let origin = self.zfs(&["get", "-H", "-o", "value", "origin", clone])?;
        Ok(origin.trim() == "-")
    }

    /// The live head, when it moved on since `id`'s clone was taken. After
    /// `promote` the swap is under way and there is nothing left to compare.
    fn superseding_head(&self, id: &TransactionId) -> Result<Option<Manifest>> {
        let clone = self.clone_name(id);
        if !self.exists(&clone)? || self.is_promoted(&clone)? {
            return Ok(None);
        }
        let Some(staged) = self.load_manifest_at(&self.clone_mountpoint(id))? else {
            return Ok(None);
        };
        let head = self.load_manifest()?;
        if extends_head(&head, &staged) {
            Ok(None)
        } else {
            Ok(Some(head))
        }
    }

    /// Everything from `promote` on. Each step checks whether it already ran.
    fn finish_commit(&self, id: &TransactionId, snapshot_id: Option<&str>) -> Result<()> {
        let clone = self.clone_name(id);
        let retired = self.retired_name(id);
        let mountpoint = self.mountpoint.to_string_lossy().into_owned();

        if self.exists(&clone)? {
            if !self.is_promoted(&clone)? {
                self.zfs(&["promote", &clone])?;
            }
            if self.exists(&self.dataset)? {
                self.zfs(&["rename", &self.dataset, &retired])?;
            }
        }
        self.destroy_if_exists(&retired)?;
        if self.exists(&clone)? {
            self.zfs(&["rename", &clone, &self.dataset])?;
        }
        self.zfs(&["set", &format!("mountpoint={mountpoint}"), &self.dataset])?;

        if let Some(snapshot_id) = snapshot_id {
            let named = format!("{}@{snapshot_id}", self.dataset);
            if !self.exists(&named)? {
                self.zfs(&["snapshot", &named])?;
            }
        }
        self.destroy_if_exists(&self.base_snapshot(id))?;
        Ok(())
    }

    fn read_commit_record(&self, id: &TransactionId) -> Result<Option<CommitRecord>> {
        let path = self.commit_record_path(id);
        if !self.fs.exists(&path)? {
            return Ok(None);
        }
        let bytes = self.fs.read(&path)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SyncError::Deserialization {
                context: path.display().to_string(),
                source,
            })
    }

    fn load_manifest_at(&self, mount: &Path) -> Result<Option<Manifest>> {
        let path = self.meta(mount).join(HEAD_MANIFEST);
        if !self.fs.exists(&path)? {
            return Ok(None);
        }
        let bytes = self.fs.read(&path)?;
        Manifest::from_slice(&bytes, &path.display().to_string()).map(Some)
    }
}

/// `<parent>/.snapsync-locks/<name>` for a mountpoint `<parent>/<name>`.
pub fn lock_root_for(mountpoint: &Path) -> PathBuf {
    let name = mountpoint
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    mountpoint
        .parent()
        .unwrap_or(Path::new("/"))
        .join(LOCKS_DIR)
        .join(name)
}

impl RemoteStore for ZfsRemote {
    fn describe(&self) -> String {
        format!("zfs {} at {}", self.dataset, self.mountpoint.display())
    }

    fn lock_ops(&self) -> Arc<dyn FileOperations> {
        Arc::new(HostFileOperations::new(Arc::clone(&self.fs), &self.lock_root))
    }

    fn load_manifest(&self) -> Result<Manifest> {
        Ok(self.load_manifest_at(&self.mountpoint)?.unwrap_or_default())
    }

    fn load_snapshot_manifest(&self, snapshot_id: &str) -> Result<Option<Manifest>> {
        let snapshot_root = resolve_relative(&self.mountpoint.join(".zfs/snapshot"), snapshot_id)?;
        self.load_manifest_at(&snapshot_root)
    }

    fn open_file(&self, path: &str, snapshot_id: Option<&str>) -> Result<ContentStream> {
        let base = match snapshot_id {
            Some(snapshot) => resolve_relative(&self.mountpoint.join(".zfs/snapshot"), snapshot)?,
            None => self.mountpoint.clone(),
        };
        self.fs.open(&resolve_relative(&base, path)?, path)
    }

    fn begin_transaction(&self, id: &TransactionId) -> Result<PathBuf> {
        let clone = self.clone_name(id);
        let base = self.base_snapshot(id);
        self.destroy_if_exists(&clone)?;
        self.destroy_if_exists(&base)?;

        self.zfs(&["snapshot", &base])?;
        let mount = self.clone_mountpoint(id);
        self.zfs(&[
            "clone",
            "-o",
            &format!("mountpoint={}", mount.display()),
            &base,
            &clone,
        ])?;

        let tmp = self.meta(&mount).join("tmp");
        self.fs.create_dir_all(&tmp)?;
        tracing::info!(transaction_id = %id, clone = %clone, "Created transaction clone");
        Ok(tmp)
    }

    fn stage_upload(
        &self,
        id: &TransactionId,
        path: &str,
        handle: &TransferHandle,
        mtime: Option<i64>,
    ) -> Result<()> {
        let dest = resolve_relative(&self.clone_mountpoint(id), path)?;
        self.fs.rename(&handle.path, &dest)?;
        if let Some(mtime) = mtime {
            self.fs.set_mtime(&dest, mtime)?;
        }
        Ok(())
    }

    fn stage_link(&self, id: &TransactionId, path: &str, target: &str) -> Result<()> {
        let dest = resolve_relative(&self.clone_mountpoint(id), path)?;
        self.fs.symlink(target, &dest)
    }

    fn stage_delete(&self, id: &TransactionId, path: &str) -> Result<()> {
        // The clone is private to this transaction, so deleting is staging.
        let dest = resolve_relative(&self.clone_mountpoint(id), path)?;
        self.fs.remove_file(&dest)?;
        Ok(())
    }

    fn stage_manifest(&self, id: &TransactionId, manifest: &Manifest) -> Result<()> {
        let path = self.meta(&self.clone_mountpoint(id)).join(HEAD_MANIFEST);
        self.fs.write(&path, manifest.to_json()?.as_bytes())
    }

    fn commit_transaction(&self, id: &TransactionId) -> Result<()> {
        if let Some(head) = self.superseding_head(id)? {
            return Err(superseded_error(id, &head));
        }

        let mount = self.clone_mountpoint(id);
        self.fs.remove_dir_all(&self.meta(&mount).join("tmp"))?;
        let snapshot_id = self
            .load_manifest_at(&mount)?
            .and_then(|m| m.snapshot_id().map(str::to_string));

        let record = CommitRecord {
            transaction_id: id.clone(),
            snapshot_id: snapshot_id.clone(),
        };
        let record_path = self.commit_record_path(id);
        self.fs.write(&record_path, &serde_json::to_vec_pretty(&record)?)?;

        self.finish_commit(id, snapshot_id.as_deref())?;
        self.fs.remove_file(&record_path)?;
        tracing::info!(transaction_id = %id, dataset = %self.dataset, snapshot = ?snapshot_id, "ZFS commit complete");
        Ok(())
    }

    fn rollback_transaction(&self, id: &TransactionId) -> Result<()> {
        self.destroy_if_exists(&self.clone_name(id))?;
        self.destroy_if_exists(&self.base_snapshot(id))?;
        tracing::debug!(transaction_id = %id, "Destroyed transaction clone");
        Ok(())
    }

    fn recover_transaction(&self, id: &TransactionId) -> Result<RemoteRecovery> {
        if let Some(record) = self.read_commit_record(id)? {
            if let Some(head) = self.superseding_head(id)? {
                tracing::warn!(
                    transaction_id = %id,
                    head = ?head.snapshot_id(),
                    "Discarding interrupted commit planned against an older head"
                );
                self.rollback_transaction(id)?;
                self.fs.remove_file(&self.commit_record_path(id))?;
                return Ok(RemoteRecovery::Discarded);
            }
            self.finish_commit(id, record.snapshot_id.as_deref())?;
            self.fs.remove_file(&self.commit_record_path(id))?;
            return Ok(RemoteRecovery::Completed);
        }
        if self.exists(&self.clone_name(id))? || self.exists(&self.base_snapshot(id))? {
            self.rollback_transaction(id)?;
            return Ok(RemoteRecovery::Discarded);
        }
        Ok(RemoteRecovery::NothingPending)
    }

    fn pending_commits(&self) -> Result<Vec<TransactionId>> {
        Ok(self
            .fs
            .list_dir(&self.records_dir())?
            .iter()
            .filter_map(|name| {
                name.strip_prefix(COMMIT_RECORD_PREFIX)?
                    .strip_suffix(".json")
                    .map(TransactionId::from)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::LocalHostFs;
    use snapsync_core::manifest::{Digest, FileEntry};
    use std::collections::{HashMap, HashSet};
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Just enough of `zfs` to drive the protocol: datasets are directories.
    #[derive(Default)]
    struct FakeZfs {
        calls: Mutex<Vec<String>>,
        names: Mutex<HashSet<String>>,
        mounts: Mutex<HashMap<String, PathBuf>>,
        promoted: Mutex<HashSet<String>>,
    }

    fn copy_tree(from: &Path, to: &Path) {
        fs::create_dir_all(to).unwrap();
        for entry in fs::read_dir(from).unwrap() {
            let entry = entry.unwrap();
            let dest = to.join(entry.file_name());
            if entry.file_type().unwrap().is_dir() {
                copy_tree(&entry.path(), &dest);
            } else {
                fs::copy(entry.path(), dest).unwrap();
            }
        }
    }

    impl FakeZfs {
        fn with_dataset(name: &str, mount: &Path) -> Arc<Self> {
            let fake = Self::default();
            fake.names.lock().unwrap().insert(name.to_string());
            fake.mounts.lock().unwrap().insert(name.to_string(), mount.to_path_buf());
            fs::create_dir_all(mount).unwrap();
            Arc::new(fake)
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn has(&self, name: &str) -> bool {
            self.names.lock().unwrap().contains(name)
        }
    }

    impl CommandRunner for Arc<FakeZfs> {
        fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutput> {
            let a: Vec<&str> = args.iter().map(String::as_str).collect();
            let mut names = self.names.lock().unwrap();
            let mut mounts = self.mounts.lock().unwrap();
            let ok = |stdout: &str| Ok(CommandOutput {
                success: true,
                stdout: stdout.to_string(),
                stderr: String::new(),
            });

            if a[0] != "list" {
                self.calls.lock().unwrap().push(a.join(" "));
            }
            match a.as_slice() {
                ["list", .., name] => Ok(CommandOutput {
                    success: names.contains(*name),
                    ..CommandOutput::default()
                }),
                ["snapshot", name] => {
                    names.insert(name.to_string());
                    ok("")
                }
                ["clone", "-o", mount, snapshot, clone] => {
                    let mount = PathBuf::from(mount.trim_start_matches("mountpoint="));
                    let source = snapshot.split('@').next().unwrap();
                    copy_tree(&mounts[source], &mount);
                    names.insert(clone.to_string());
                    mounts.insert(clone.to_string(), mount);
                    ok("")
                }
                ["get", "-H", "-o", "value", "origin", name] => {
                    if self.promoted.lock().unwrap().contains(*name) {
                        ok("-\n")
                    } else {
                        ok("pool/data@base\n")
                    }
                }
                ["promote", name] => {
                    self.promoted.lock().unwrap().insert(name.to_string());
                    ok("")
                }
                ["rename", from, to] => {
                    let moved: Vec<String> = names
                        .iter()
                        .filter(|n| n.as_str() == *from || n.starts_with(&format!("{from}@")))
                        .cloned()
                        .collect();
                    for n in moved {
                        names.remove(&n);
                        names.insert(n.replacen(*from, to, 1));
                    }
                    if let Some(mount) = mounts.remove(*from) {
                        mounts.insert(to.to_string(), mount);
                    }
                    ok("")
                }
                ["destroy", "-r", name] => {
                    names.retain(|n| n.as_str() != *name && !n.starts_with(&format!("{name}@")));
                    if let Some(mount) = mounts.remove(*name) {
                        let _ = fs::remove_dir_all(mount);
                    }
                    ok("")
                }
                ["set", prop, name] => {
                    let target = PathBuf::from(prop.trim_start_matches("mountpoint="));
                    let current = mounts[*name].clone();
                    if current != target {
                        let _ = fs::remove_dir_all(&target);
                        fs::rename(&current, &target).unwrap();
                        mounts.insert(name.to_string(), target);
                    }
                    ok("")
                }
                other => panic!("unexpected zfs call {other:?}"),
            }
        }
    }

    fn setup() -> (TempDir, Arc<FakeZfs>, ZfsRemote) {
        let dir = TempDir::new().unwrap();
        let mount = dir.path().join("data");
        let fake = FakeZfs::with_dataset("pool/data", &mount);
        let remote = ZfsRemote::new(
            Box::new(Arc::clone(&fake)),
            Arc::new(LocalHostFs),
            "pool/data",
            &mount,
            ".snapsync",
        );
        (dir, fake, remote)
    }

    fn stage_file(remote: &ZfsRemote, id: &TransactionId, tmp: &Path, path: &str, body: &[u8]) {
        let temp = tmp.join(format!("x.pending-{id}"));
        fs::write(&temp, body).unwrap();
        let handle = TransferHandle {
            path: temp,
            size: body.len() as u64,
            digest: Digest::of_bytes(body),
        };
        remote.stage_upload(id, path, &handle, None).unwrap();
    }

    fn target(snapshot: &str, previous: Option<&Manifest>, paths: &[&str]) -> Manifest {
        let mut m = Manifest::new();
        for p in paths {
            m.insert(FileEntry::file(*p, 1, 1, None)).unwrap();
        }
        m.link_snapshot(snapshot, "alice", "test", previous);
        m
    }

    fn write_record(remote: &ZfsRemote, id: &TransactionId, snapshot: &str) {
        let record = CommitRecord {
            transaction_id: id.clone(),
            snapshot_id: Some(snapshot.into()),
        };
        LocalHostFs
            .write(&remote.commit_record_path(id), &serde_json::to_vec(&record).unwrap())
            .unwrap();
    }

    #[test]
    fn lock_lives_beside_the_mountpoint() {
        assert_eq!(
            lock_root_for(Path::new("/tank/projects/alpha")),
            PathBuf::from("/tank/projects/.snapsync-locks/alpha")
        );
    }

    #[test]
    fn commit_swaps_the_clone_into_place() {
        let (dir, fake, remote) = setup();
        fs::write(dir.path().join("data/old.txt"), b"old").unwrap();
        let id = TransactionId::from("t1");

        let tmp = remote.begin_transaction(&id).unwrap();
        assert!(tmp.starts_with(dir.path().join("data-txn-t1")));
        stage_file(&remote, &id, &tmp, "new.txt", b"new");
        remote.stage_delete(&id, "old.txt").unwrap();
        remote.stage_manifest(&id, &target("s1", None, &["new.txt"])).unwrap();

        // The live dataset is untouched until commit.
        assert!(dir.path().join("data/old.txt").exists());
        assert!(!dir.path().join("data/new.txt").exists());

        remote.commit_transaction(&id).unwrap();

        assert_eq!(fs::read(dir.path().join("data/new.txt")).unwrap(), b"new");
        assert!(!dir.path().join("data/old.txt").exists());
        assert!(!dir.path().join("data/.snapsync/tmp").exists());
        assert_eq!(remote.load_manifest().unwrap().snapshot_id(), Some("s1"));
        assert!(fake.has("pool/data@s1"));
        assert!(!fake.has("pool/data@snapsync-base-t1"));
        assert!(!fake.has("pool/data-txn-t1"));

        let calls = fake.calls();
        let promote = calls.iter().position(|c| c == "promote pool/data-txn-t1").unwrap();
        let snapshot = calls.iter().position(|c| c == "snapshot pool/data@s1").unwrap();
        assert!(promote < snapshot);
    }

    #[test]
    fn rollback_destroys_clone_and_base() {
        let (dir, fake, remote) = setup();
        let id = TransactionId::from("t2");
        let tmp = remote.begin_transaction(&id).unwrap();
        stage_file(&remote, &id, &tmp, "a.txt", b"a");

        remote.rollback_transaction(&id).unwrap();
        assert!(!fake.has("pool/data-txn-t2"));
        assert!(!fake.has("pool/data@snapsync-base-t2"));
        assert!(!dir.path().join("data-txn-t2").exists());
        assert!(!dir.path().join("data/a.txt").exists());
        assert_eq!(remote.recover_transaction(&id).unwrap(), RemoteRecovery::NothingPending);
    }

    #[test]
    fn recovery_finishes_a_recorded_commit() {
        let (dir, fake, remote) = setup();
        let id = TransactionId::from("t3");
        let tmp = remote.begin_transaction(&id).unwrap();
        stage_file(&remote, &id, &tmp, "a.txt", b"a");
        remote.stage_manifest(&id, &target("s3", None, &["a.txt"])).unwrap();
        fs::remove_dir_all(&tmp).unwrap();

        // Crash just after the commit record was written.
        write_record(&remote, &id, "s3");

        assert_eq!(remote.recover_transaction(&id).unwrap(), RemoteRecovery::Completed);
        assert_eq!(fs::read(dir.path().join("data/a.txt")).unwrap(), b"a");
        assert!(fake.has("pool/data@s3"));
        assert_eq!(remote.recover_transaction(&id).unwrap(), RemoteRecovery::NothingPending);
    }

    /// A full commit adding `path` on top of the current head.
    fn commit(remote: &ZfsRemote, id: &str, snapshot: &str, path: &str) {
        let id = TransactionId::from(id);
        let head = remote.load_manifest().unwrap();
        let tmp = remote.begin_transaction(&id).unwrap();
        stage_file(remote, &id, &tmp, path, path.as_bytes());
        let mut paths: Vec<&str> = head.paths().collect();
        paths.push(path);
        remote
            .stage_manifest(&id, &target(snapshot, Some(&head), &paths))
            .unwrap();
        remote.commit_transaction(&id).unwrap();
    }

    #[test]
    fn recorded_commits_are_finished_by_any_client() {
        let (dir, fake, remote) = setup();
        commit(&remote, "t1", "s1", "a.txt");
        assert!(remote.pending_commits().unwrap().is_empty());

        let id = TransactionId::from("t2");
        let head = remote.load_manifest().unwrap();
        let tmp = remote.begin_transaction(&id).unwrap();
        stage_file(&remote, &id, &tmp, "b.txt", b"b");
        remote
            .stage_manifest(&id, &target("s2", Some(&head), &["a.txt", "b.txt"]))
            .unwrap();
        fs::remove_dir_all(&tmp).unwrap();
        write_record(&remote, &id, "s2");

        assert_eq!(remote.pending_commits().unwrap(), vec![id.clone()]);
        assert_eq!(remote.recover_committed().unwrap(), vec![id]);
        assert_eq!(fs::read(dir.path().join("data/b.txt")).unwrap(), b"b");
        assert_eq!(remote.load_manifest().unwrap().snapshot_id(), Some("s2"));
        assert!(fake.has("pool/data@s2"));
        assert!(remote.pending_commits().unwrap().is_empty());
    }

    #[test]
    fn stale_clone_never_replaces_a_newer_head() {
        let (dir, fake, remote) = setup();
        commit(&remote, "t1", "s1", "a.txt");

        // Cloned from s1, then s2 lands first.
        let late = TransactionId::from("late");
        let head = remote.load_manifest().unwrap();
        let tmp = remote.begin_transaction(&late).unwrap();
        stage_file(&remote, &late, &tmp, "late.txt", b"late");
        remote
            .stage_manifest(&late, &target("s-late", Some(&head), &["a.txt", "late.txt"]))
            .unwrap();
        commit(&remote, "t2", "s2", "c.txt");

        let err = remote.commit_transaction(&late).unwrap_err();
        assert!(matches!(err, SyncError::Backend { ref operation, .. } if operation == "commit"));
        assert_eq!(remote.load_manifest().unwrap().snapshot_id(), Some("s2"));

        // A record left by a crash is discarded, not finished.
        write_record(&remote, &late, "s-late");
        assert_eq!(remote.recover_transaction(&late).unwrap(), RemoteRecovery::Discarded);
        assert!(!fake.has("pool/data-txn-late"));
        assert!(!fake.has("pool/data@s-late"));
        assert!(dir.path().join("data/c.txt").exists());
        assert!(!dir.path().join("data/late.txt").exists());
        assert_eq!(remote.load_manifest().unwrap().snapshot_id(), Some("s2"));
        assert!(remote.pending_commits().unwrap().is_empty());
    }

    #[test]
    fn recovery_discards_an_unrecorded_clone() {
        let (_dir, fake, remote) = setup();
        let id = TransactionId::from("t4");
        remote.begin_transaction(&id).unwrap();
        assert_eq!(remote.recover_transaction(&id).unwrap(), RemoteRecovery::Discarded);
        assert!(!fake.has("pool/data-txn-t4"));
    }

    #[test]
    fn failing_zfs_commands_are_backend_errors() {
        struct Broken;
        impl CommandRunner for Broken {
            fn run(&self, _program: &str, _args: &[String]) -> Result<CommandOutput> {
                Ok(CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: "cannot open 'pool/data': dataset does not exist\n".into(),
                })
            }
        }
        let dir = TempDir::new().unwrap();
        let remote = ZfsRemote::new(
            Box::new(Broken),
            Arc::new(LocalHostFs),
            "pool/data",
            dir.path().join("data"),
            ".snapsync",
        );
        let err = remote.begin_transaction(&TransactionId::from("t5")).unwrap_err();
        assert!(matches!(err, SyncError::Backend { ref message, .. } if message.contains("does not exist")));
    }
}
