//! Two-phase transaction coordinator.
//!
//! Staging touches neither the working copy nor the live remote. The remote
//! commit is the point of no return: a failure before it rolls both sides
//! back, a failure after it leaves a marker for forward recovery.

pub mod client;
pub mod recovery;
pub mod remote;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::context::SyncContext;
use crate::fs::ops::resolve_relative;
use crate::fs::walker::PENDING_MARKER;
use crate::manifest::{Digest, FileEntry, Manifest};
use crate::retry::RetryPolicy;
use crate::sync::conflict::ConflictError;
use crate::sync::{PlanItem, PlanSummary, Resolution, SyncAction, SyncPlan};
use crate::transfer::progress::format_speed;
use crate::transfer::{format_bytes, ContentStream, SyncProgress, TransferSession, Transport};
use crate::utils::errors::{Result, SyncError};

pub use client::ClientStaging;
pub use recovery::{recover, RecoveryOutcome};
pub use remote::{DirectoryRemote, RemoteRecovery, RemoteStore};

/// Identifies one transaction on both sides and in temp file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Derived from the target snapshot hash when there is one, else from the clock.
    pub fn for_snapshot(hash: Option<&Digest>) -> Self {
        match hash {
            Some(hash) => Self(hash.short(16).to_string()),
            None => Self(Utc::now().format("t%Y%m%d%H%M%S%3f").to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Suffix carried by every temp file this transaction creates.
    pub fn pending_suffix(&self) -> String {
        format!("{PENDING_MARKER}{}", self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a test can make the coordinator stop dead, as if the process died.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailPoint {
    BeforeRemoteCommit,
    AfterRemoteCommit,
}

#[derive(Debug, Clone)]
pub struct TransactionReport {
    pub transaction_id: TransactionId,
    pub files_transferred: usize,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    pub summary: PlanSummary,
}

/// The three manifests a plan was built from, plus the agreed result.
pub struct PlanInputs<'m> {
    pub local: &'m Manifest,
    pub cache: &'m Manifest,
    pub remote: &'m Manifest,
    pub target: &'m Manifest,
}

pub struct TransactionCoordinator<'a> {
    ctx: &'a SyncContext,
    client: ClientStaging,
    remote: &'a dyn RemoteStore,
    transport: &'a dyn Transport,
    network: RetryPolicy,
    filesystem: RetryPolicy,
    #[cfg(test)]
    fail_point: Option<FailPoint>,
}

impl<'a> TransactionCoordinator<'a> {
    pub fn new(ctx: &'a SyncContext, remote: &'a dyn RemoteStore, transport: &'a dyn Transport) -> Self {
        let config = &ctx.config;
        Self {
            ctx,
            client: ClientStaging::new(&config.repository.root, &config.repository.metadata_dir),
            remote,
            transport,
            network: RetryPolicy::network(&config.retry),
            filesystem: RetryPolicy::filesystem(&config.retry),
            #[cfg(test)]
            fail_point: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_fail_point(mut self, fail_point: FailPoint) -> Self {
        self.fail_point = Some(fail_point);
        self
    }

    #[cfg(test)]
    fn trip(&self, at: FailPoint) -> Result<()> {
        if self.fail_point == Some(at) {
            return Err(SyncError::Backend {
                operation: "fail point".into(),
                message: format!("{at:?}"),
            });
        }
        Ok(())
    }

    /// Run `plan` to completion or not at all.
    pub fn execute(&mut self, plan: &SyncPlan, inputs: PlanInputs<'_>) -> Result<TransactionReport> {
        let unresolved: Vec<String> = plan.conflicts().map(|item| item.path.clone()).collect();
        if !unresolved.is_empty() {
            return Err(ConflictError::MissingResolution { paths: unresolved }.into());
        }

        let id = TransactionId::for_snapshot(inputs.target.snapshot_hash());
        let start = Instant::now();
        tracing::info!(
            transaction_id = %id,
            remote = %self.remote.describe(),
            plan = %plan.summary(),
            "Starting transaction"
        );

        self.client.begin(&id, inputs.target.metadata.as_ref())?;

        let staged = self.stage_all(&id, plan, &inputs);
        let (files, bytes) = match staged {
            Ok(counts) => counts,
            Err(err) => return Err(self.abort(&id, err)),
        };

        let prepared = self
            .client
            .stage_manifest(inputs.target)
            .and_then(|_| self.remote.stage_manifest(&id, inputs.target))
            .and_then(|_| self.client.prepare_commit());
        if let Err(err) = prepared {
            let err = SyncError::TransactionCommit {
                transaction_id: id.to_string(),
                source: Box::new(err),
            };
            return Err(self.abort(&id, err));
        }

        let committed = self.commit(&id);
        self.end_session(&id);
        committed?;

        let elapsed = start.elapsed();
        tracing::info!(
            transaction_id = %id,
            files,
            transferred = %format_bytes(bytes),
            elapsed_ms = elapsed.as_millis() as u64,
            "Transaction committed"
        );

        Ok(TransactionReport {
            transaction_id: id,
            files_transferred: files,
            bytes_transferred: bytes,
            elapsed,
            summary: plan.summary(),
        })
    }

    /// Remote commit, then client commit. Cancellation is no longer honoured.
    fn commit(&mut self, id: &TransactionId) -> Result<()> {
        #[cfg(test)]
        self.trip(FailPoint::BeforeRemoteCommit)?;

        // Point of no return.
        self.remote
            .commit_transaction(id)
            .map_err(|err| SyncError::Unrecoverable {
                transaction_id: id.to_string(),
                stage: "remote commit".into(),
                source: Box::new(err),
            })?;

        #[cfg(test)]
        self.trip(FailPoint::AfterRemoteCommit)?;

        self.client.commit().map_err(|err| SyncError::Unrecoverable {
            transaction_id: id.to_string(),
            stage: "client commit".into(),
            source: Box::new(err),
        })
    }

    fn end_session(&self, id: &TransactionId) {
        if let Err(e) = self.transport.end_session() {
            tracing::warn!(transaction_id = %id, error = %e, "Failed to end transfer session");
        }
    }

    fn stage_all(&mut self, id: &TransactionId, plan: &SyncPlan, inputs: &PlanInputs<'_>) -> Result<(usize, u64)> {
        let remote_tmp = self.remote.begin_transaction(id)?;
        self.transport.begin_session(TransferSession {
            transaction_id: id.to_string(),
            local_tmp: self.client.tmp_dir(),
            remote_tmp,
        })?;

        let moving: Vec<&PlanItem> = plan
            .items
            .iter()
            .filter(|item| {
                matches!(
                    item.action,
                    SyncAction::Upload | SyncAction::Download | SyncAction::Restore
                )
            })
            .collect();
        let total_bytes = moving
            .iter()
            .filter_map(|item| source_entry(item, inputs))
            .map(FileEntry::size)
            .sum();
        let mut progress = SyncProgress::new(total_bytes, moving.len());

        for item in &plan.items {
            self.ctx.check_cancelled()?;
            let bytes = self.stage_item(id, item, inputs)?;
            if matches!(
                item.action,
                SyncAction::Upload | SyncAction::Download | SyncAction::Restore
            ) {
                progress.file_done(&item.path, bytes);
            }
        }

        let done = progress.progress();
        tracing::debug!(
            transaction_id = %id,
            files = done.files_done,
            average_speed = %format_speed(progress.average_speed()),
            "Staging finished"
        );
        Ok((done.files_done, done.transferred_bytes))
    }

    /// Stage one plan item; returns the bytes moved.
    fn stage_item(&mut self, id: &TransactionId, item: &PlanItem, inputs: &PlanInputs<'_>) -> Result<u64> {
        let path = item.path.as_str();
        let filesystem = self.filesystem;

        match item.action {
            SyncAction::NoOp | SyncAction::Conflict => Ok(0),
            SyncAction::DeleteLocal => {
                self.client.stage_delete(path)?;
                tracing::debug!(path, "Staged local delete");
                Ok(0)
            }
            SyncAction::DeleteRemote => {
                filesystem.run("stage remote delete", |_| self.remote.stage_delete(id, path))?;
                tracing::debug!(path, "Staged remote delete");
                Ok(0)
            }
            SyncAction::Upload => {
                let entry = required(inputs.local, path)?;
                self.push_to_remote(id, entry, None)
            }
            SyncAction::Download => {
                let entry = required(inputs.remote, path)?;
                self.backup_if_overwritten(item, inputs)?;
                self.pull_to_local(entry, None)
            }
            SyncAction::Restore => {
                let entry = required(inputs.cache, path)?;
                let snapshot = inputs.cache.snapshot_id().ok_or_else(|| {
                    SyncError::NotFound(format!("cached snapshot holding {path}"))
                })?;
                self.backup_if_overwritten(item, inputs)?;
                let bytes = self.push_to_remote(id, entry, Some(snapshot))?;
                self.pull_to_local(entry, Some(snapshot))?;
                Ok(bytes)
            }
        }
    }

    /// Upload `entry` from the working copy, or from a remote snapshot when
    /// `snapshot` is set.
    fn push_to_remote(&self, id: &TransactionId, entry: &FileEntry, snapshot: Option<&str>) -> Result<u64> {
        let path = entry.path();
        if let FileEntry::Link { reference, .. } = entry {
            self.filesystem
                .run("stage remote link", |_| self.remote.stage_link(id, path, reference))?;
            return Ok(0);
        }

        let handle = self.network.run("upload", |_| {
            let stream = match snapshot {
                Some(snapshot) => self.remote.open_file(path, Some(snapshot))?,
                None => {
                    let full = resolve_relative(self.client.root(), path)?;
                    ContentStream::from_file(&full, path)?
                }
            };
            self.transport
                .transfer_to_remote(stream.expect_digest(entry.hash().cloned()))
        })?;

        self.filesystem.run("stage upload", |_| {
            self.remote.stage_upload(id, path, &handle, entry.mtime())
        })?;
        tracing::debug!(path, size = handle.size, "Staged upload");
        Ok(handle.size)
    }

    fn pull_to_local(&mut self, entry: &FileEntry, snapshot: Option<&str>) -> Result<u64> {
        let path = entry.path();
        if let FileEntry::Link { reference, .. } = entry {
            self.client.stage_link(path, reference)?;
            return Ok(0);
        }

        let remote = self.remote;
        let transport = self.transport;
        let handle = self.network.run("download", |_| {
            let stream = remote.open_file(path, snapshot)?;
            transport.transfer_to_local(stream.expect_digest(entry.hash().cloned()))
        })?;

        self.client.stage_file(path, &handle, entry.mtime())?;
        tracing::debug!(path, size = handle.size, "Staged download");
        Ok(handle.size)
    }

    /// Keep the local copy of a resolved conflict that is about to be replaced.
    fn backup_if_overwritten(&mut self, item: &PlanItem, inputs: &PlanInputs<'_>) -> Result<()> {
        let resolved_away = matches!(item.resolution, Some(Resolution::Remote | Resolution::Cache));
        if !resolved_away || !self.ctx.config.conflicts.backup_on_conflict {
            return Ok(());
        }
        if inputs.local.get(&item.path).is_none() {
            return Ok(());
        }
        let backup = self.client.stage_backup(&item.path, Utc::now().timestamp())?;
        tracing::info!(path = %item.path, backup = %backup, "Local copy will be kept as a conflict backup");
        Ok(())
    }

    /// Undo everything staged so far. Returns the error to report.
    fn abort(&mut self, id: &TransactionId, cause: SyncError) -> SyncError {
        tracing::warn!(transaction_id = %id, error = %cause, "Rolling back transaction");
        self.end_session(id);

        let remote = self.remote.rollback_transaction(id);
        let client = self.client.rollback(id);

        let failures: Vec<String> = [remote.err(), client.err()]
            .into_iter()
            .flatten()
            .map(|e| e.to_string())
            .collect();
        if failures.is_empty() {
            return cause;
        }

        let err = SyncError::TransactionRollback {
            transaction_id: id.to_string(),
            reason: format!("{cause}; rollback failed: {}", failures.join("; ")),
            hint: "run `snapsync recover`, then remove leftover *.pending-* files if it cannot".into(),
        };
        tracing::error!(transaction_id = %id, error = %err, "Rollback incomplete");
        err
    }
}

fn required<'m>(manifest: &'m Manifest, path: &str) -> Result<&'m FileEntry> {
    manifest
        .get(path)
        .ok_or_else(|| SyncError::NotFound(format!("manifest entry for {path}")))
}

fn source_entry<'m>(item: &PlanItem, inputs: &PlanInputs<'m>) -> Option<&'m FileEntry> {
    match item.action {
        SyncAction::Upload => inputs.local.get(&item.path),
        SyncAction::Download => inputs.remote.get(&item.path),
        SyncAction::Restore => inputs.cache.get(&item.path),
        _ => None,
    }
}
