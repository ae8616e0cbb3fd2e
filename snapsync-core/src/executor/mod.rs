//! Sync executor - orchestrates status, sync, init, clone and recover.
//!
//! Every mutating operation takes the distributed lock first, then finishes
//! any interrupted transaction, then plans and runs a new one.

use std::fs;
use std::path::Path;

use crate::context::SyncContext;
use crate::fs::validate::ValidationWarning;
use crate::fs::walker::{scan_directory, ScanOptions, ScanResult};
use crate::lock::{DistributedLock, LockGuard, LockProbe};
use crate::manifest::Manifest;
use crate::sync::{conflict, PlanSummary, SyncPlan};
use crate::transaction::{
    recover, ClientStaging, PlanInputs, RecoveryOutcome, RemoteStore, TransactionCoordinator,
    TransactionId, TransactionReport,
};
use crate::transfer::Transport;
use crate::utils::errors::{Result, SyncError};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Rename files whose names are not NFC instead of refusing to sync.
    pub auto_normalize: bool,
    /// Snapshot message; a default naming the user and host is used when empty.
    pub message: Option<String>,
}

/// Read-only view of what a sync would do.
#[derive(Debug)]
pub struct StatusReport {
    pub plan: SyncPlan,
    pub warnings: Vec<ValidationWarning>,
    pub ignored: usize,
    pub remote_snapshot: Option<String>,
    pub cached_snapshot: Option<String>,
    /// An interrupted transaction waiting for recovery.
    pub pending_transaction: Option<TransactionId>,
    /// `None` when the lock could not be read.
    pub lock: Option<LockProbe>,
}

#[derive(Debug)]
pub struct SyncReport {
    pub summary: PlanSummary,
    /// `None` when there was nothing to commit.
    pub transaction: Option<TransactionReport>,
    pub snapshot_id: Option<String>,
    /// Files renamed to their NFC form, as `(from, to)`.
    pub renamed: Vec<(String, String)>,
    /// Interrupted transaction finished or undone before this run.
    pub recovered: Option<RecoveryOutcome>,
}

/// Main sync executor
pub struct SyncExecutor<'a> {
    ctx: &'a SyncContext,
    remote: &'a dyn RemoteStore,
    transport: &'a dyn Transport,
}

impl<'a> SyncExecutor<'a> {
    pub fn new(ctx: &'a SyncContext, remote: &'a dyn RemoteStore, transport: &'a dyn Transport) -> Self {
        Self {
            ctx,
            remote,
            transport,
        }
    }

    fn root(&self) -> &Path {
        &self.ctx.config.repository.root
    }

    fn client(&self) -> ClientStaging {
        ClientStaging::new(self.root(), &self.ctx.config.repository.metadata_dir)
    }

    fn lock(&self, operation: &str) -> Result<LockGuard> {
        let lock = DistributedLock::from_context(self.remote.lock_ops(), self.ctx);
        lock.acquire(operation, &self.ctx.cancel)
    }

    fn scan(&self) -> Result<ScanResult> {
        scan_directory(self.root(), &ScanOptions::from_config(&self.ctx.config))
    }

    /// Compare the three manifests without touching anything.
    pub fn status(&self) -> Result<StatusReport> {
        let scan = self.scan()?;
        let client = self.client();
        let cache = client.load_cache()?;
        let remote = self.remote.load_manifest()?;
        let plan = SyncPlan::build(&scan.manifest, &cache, &remote);

        let lock = match DistributedLock::from_context(self.remote.lock_ops(), self.ctx).probe() {
            Ok(probe) => Some(probe),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read lock state");
                None
            }
        };

        Ok(StatusReport {
            warnings: scan.warnings,
            ignored: scan.ignored.len(),
            remote_snapshot: remote.snapshot_id().map(str::to_string),
            cached_snapshot: cache.snapshot_id().map(str::to_string),
            pending_transaction: client.read_marker()?.map(|m| m.transaction_id),
            lock,
            plan,
        })
    }

    /// Finish or undo an interrupted transaction.
    pub fn recover(&self) -> Result<RecoveryOutcome> {
        let guard = self.lock("recover")?;
        let outcome = recover(&self.client(), self.remote)?;
        guard.release()?;
        Ok(outcome)
    }

    /// Three-way sync of the working copy with the remote.
    pub fn sync(&self, options: &SyncOptions) -> Result<SyncReport> {
        let guard = self.lock("sync")?;
        let report = self.sync_locked(options)?;
        guard.release()?;
        Ok(report)
    }

    /// Publish a working copy to an empty remote.
    pub fn init(&self, options: &SyncOptions) -> Result<SyncReport> {
        let guard = self.lock("init")?;
        let recovered = self.recover_locked()?;

        let remote = self.remote.load_manifest()?;
        if !remote.is_empty() || remote.metadata.is_some() {
            return Err(SyncError::NotEmpty {
                what: "remote".into(),
                location: self.remote.describe(),
            });
        }

        let mut report = self.sync_locked(options)?;
        report.recovered = report.recovered.or(recovered);
        guard.release()?;
        Ok(report)
    }

    /// Populate an empty working copy from the remote.
    pub fn clone_remote(&self, options: &SyncOptions) -> Result<SyncReport> {
        let guard = self.lock("clone")?;
        let recovered = self.recover_locked()?;

        let scan = self.scan()?;
        let cache = self.client().load_cache()?;
        if !scan.manifest.is_empty() || !cache.is_empty() {
            return Err(SyncError::NotEmpty {
                what: "working copy".into(),
                location: self.root().display().to_string(),
            });
        }

        let mut report = self.sync_locked(options)?;
        report.recovered = report.recovered.or(recovered);
        guard.release()?;
        Ok(report)
    }

    fn recover_locked(&self) -> Result<Option<RecoveryOutcome>> {
        match recover(&self.client(), self.remote)? {
            RecoveryOutcome::Clean => Ok(None),
            outcome => Ok(Some(outcome)),
        }
    }

    fn sync_locked(&self, options: &SyncOptions) -> Result<SyncReport> {
        let recovered = self.recover_locked()?;
        let ctx = self.ctx;

        let mut scan = self.scan()?;
        let mut renamed = Vec::new();
        if !scan.warnings.is_empty() {
            if options.auto_normalize {
                renamed = normalize_names(self.root(), &scan.warnings)?;
                if !renamed.is_empty() {
                    scan = self.scan()?;
                }
            }
            if !scan.warnings.is_empty() {
                for warning in &scan.warnings {
                    tracing::warn!(%warning, "Path blocks sync");
                }
                return Err(SyncError::Validation {
                    paths: scan.warnings.iter().map(|w| w.path.clone()).collect(),
                });
            }
        }

        let local = scan.manifest;
        let cache = self.client().load_cache()?;
        let remote = self.remote.load_manifest()?;
        let mut plan = SyncPlan::build(&local, &cache, &remote);

        let conflicts_path = ctx.config.conflicts_path();
        if plan.has_conflicts() {
            let cases = plan.conflict_cases(&local, &cache, &remote);
            match fs::read_to_string(&conflicts_path) {
                Ok(text) => {
                    let resolutions = conflict::parse(&text)?;
                    plan.apply_resolutions(&resolutions, &cases)?;
                    tracing::info!(resolved = resolutions.len(), "Applied conflict resolutions");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let text = conflict::generate(
                        &cases,
                        &ctx.user_id,
                        ctx.config.conflicts.backup_on_conflict,
                    );
                    crate::fs::ops::write_atomic(&conflicts_path, text.as_bytes())?;
                    tracing::warn!(
                        count = cases.len(),
                        path = %conflicts_path.display(),
                        "Conflicts need resolution"
                    );
                    return Err(SyncError::ConflictsPending {
                        count: cases.len(),
                        path: conflicts_path,
                    });
                }
                Err(e) => return Err(SyncError::io(&conflicts_path, e)),
            }
        } else if conflicts_path.exists() {
            tracing::warn!(path = %conflicts_path.display(), "Ignoring stale conflict file");
        }

        let summary = plan.summary();
        let up_to_date = plan.is_noop()
            && remote.metadata.is_some()
            && cache.snapshot_hash() == remote.snapshot_hash();
        if up_to_date {
            tracing::info!(snapshot = ?remote.snapshot_id(), "Already up to date");
            crate::fs::ops::remove_if_exists(&conflicts_path)?;
            return Ok(SyncReport {
                summary,
                transaction: None,
                snapshot_id: remote.snapshot_id().map(str::to_string),
                renamed,
                recovered,
            });
        }

        let snapshot_id = uuid::Uuid::new_v4().to_string();
        let message = options
            .message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("sync by {}@{}", ctx.user_id, ctx.hostname));
        let mut target = plan.result_manifest(&local, &cache, &remote)?;
        target.link_snapshot(&snapshot_id, &ctx.user_id, &message, previous(&remote));

        let transaction = TransactionCoordinator::new(ctx, self.remote, self.transport).execute(
            &plan,
            PlanInputs {
                local: &local,
                cache: &cache,
                remote: &remote,
                target: &target,
            },
        )?;

        crate::fs::ops::remove_if_exists(&conflicts_path)?;
        tracing::info!(
            snapshot_id = %snapshot_id,
            summary = %summary,
            "Sync complete"
        );

        Ok(SyncReport {
            summary,
            transaction: Some(transaction),
            snapshot_id: Some(snapshot_id),
            renamed,
            recovered,
        })
    }
}

/// The chain predecessor of a new snapshot: the remote head, when it has one.
fn previous(remote: &Manifest) -> Option<&Manifest> {
    remote.metadata.as_ref().map(|_| remote)
}

/// Rename non-NFC files to their NFC names. Refuses to overwrite.
fn normalize_names(root: &Path, warnings: &[ValidationWarning]) -> Result<Vec<(String, String)>> {
    let mut renamed = Vec::new();
    for warning in warnings.iter().filter(|w| w.is_normalization_only()) {
        let Some(target) = warning.normalized_path() else {
            continue;
        };
        let from = crate::fs::ops::resolve_relative(root, &warning.path)?;
        let to = crate::fs::ops::resolve_relative(root, target)?;
        if fs::symlink_metadata(&to).is_ok() {
            return Err(SyncError::Validation {
                paths: vec![warning.path.clone(), target.to_string()],
            });
        }
        crate::fs::ops::ensure_parent(&to)?;
        fs::rename(&from, &to).map_err(|e| SyncError::io(&from, e))?;
        tracing::info!(from = %warning.path, to = %target, "Normalized file name");
        renamed.push((warning.path.clone(), target.to_string()));
    }
    Ok(renamed)
}
