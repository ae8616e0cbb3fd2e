//! Repository lock shared through the remote store.
//!
//! The lock is a JSON record at `<metadata_dir>/lock.json`. Release writes a
//! tombstone beside it (`lock.json.released`) naming the released lock id;
//! nothing is ever deleted. A record older than the staleness threshold may
//! be overridden by anyone, after writing a tombstone for it.
//!
//! Any error while probing counts as a failed attempt, never as "unlocked".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::LockConfig;
use crate::context::SyncContext;
use crate::fs::ops::FileOperations;
use crate::utils::errors::{Result, SyncError};

pub const LOCK_FILE: &str = "lock.json";
pub const TOMBSTONE_SUFFIX: &str = ".released";

/// Longest single sleep between cancellation checks.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub user_id: String,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub hostname: String,
    pub lock_id: String,
}

impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} (pid {}, {} since {})",
            self.user_id,
            self.hostname,
            self.pid,
            self.operation,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tombstone {
    lock_id: String,
    released_at: DateTime<Utc>,
}

/// What a read of the lock files shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockProbe {
    Free,
    Held(LockRecord),
    Stale(LockRecord),
}

#[derive(Debug)]
enum Attempt {
    Acquired(LockRecord),
    Busy(LockRecord),
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    /// Wait between writing the record and reading it back.
    pub settle: Duration,
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
            stale_after: config.stale_after(),
            settle: config.settle(),
        }
    }
}

pub struct DistributedLock {
    ops: Arc<dyn FileOperations>,
    lock_path: String,
    tombstone_path: String,
    options: LockOptions,
    user_id: String,
    hostname: String,
}

impl DistributedLock {
    pub fn new(
        ops: Arc<dyn FileOperations>,
        metadata_dir: &str,
        options: LockOptions,
        user_id: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        let lock_path = format!("{metadata_dir}/{LOCK_FILE}");
        Self {
            ops,
            tombstone_path: format!("{lock_path}{TOMBSTONE_SUFFIX}"),
            lock_path,
            options,
            user_id: user_id.into(),
            hostname: hostname.into(),
        }
    }

    pub fn from_context(ops: Arc<dyn FileOperations>, ctx: &SyncContext) -> Self {
        Self::new(
            ops,
            &ctx.config.repository.metadata_dir,
            LockOptions::from(&ctx.config.lock),
            ctx.user_id.clone(),
            ctx.hostname.clone(),
        )
    }

    fn read_record(&self) -> Result<Option<LockRecord>> {
        if !self.ops.file_exists(&self.lock_path)? {
            return Ok(None);
        }
        let bytes = self.ops.read_file(&self.lock_path)?;
        let record = serde_json::from_slice(&bytes).map_err(|source| {
            SyncError::Deserialization {
                context: self.lock_path.clone(),
                source,
            }
        })?;
        Ok(Some(record))
    }

    fn read_tombstone(&self) -> Result<Option<Tombstone>> {
        if !self.ops.file_exists(&self.tombstone_path)? {
            return Ok(None);
        }
        let bytes = self.ops.read_file(&self.tombstone_path)?;
        let tombstone = serde_json::from_slice(&bytes).map_err(|source| {
            SyncError::Deserialization {
                context: self.tombstone_path.clone(),
                source,
            }
        })?;
        Ok(Some(tombstone))
    }

    fn is_stale(&self, record: &LockRecord) -> bool {
        Utc::now()
            .signed_duration_since(record.timestamp)
            .to_std()
            .map(|age| age > self.options.stale_after)
            .unwrap_or(false)
    }

    /// Current lock state. Read-only.
    pub fn probe(&self) -> Result<LockProbe> {
        let Some(record) = self.read_record()? else {
            return Ok(LockProbe::Free);
        };

        if let Some(tombstone) = self.read_tombstone()? {
            if tombstone.lock_id == record.lock_id {
                return Ok(LockProbe::Free);
            }
        }

        if self.is_stale(&record) {
            Ok(LockProbe::Stale(record))
        } else {
            Ok(LockProbe::Held(record))
        }
    }

    fn write_tombstone(ops: &dyn FileOperations, path: &str, lock_id: &str) -> Result<()> {
        let tombstone = Tombstone {
            lock_id: lock_id.to_string(),
            released_at: Utc::now(),
        };
        ops.write_file(path, &serde_json::to_vec_pretty(&tombstone)?)
    }

    fn try_acquire(&self, operation: &str) -> Result<Attempt> {
        match self.probe()? {
            LockProbe::Held(holder) => return Ok(Attempt::Busy(holder)),
            LockProbe::Stale(old) => {
                tracing::warn!(holder = %old, "Overriding stale repository lock");
                Self::write_tombstone(self.ops.as_ref(), &self.tombstone_path, &old.lock_id)?;
            }
            LockProbe::Free => {}
        }

        let record = LockRecord {
            user_id: self.user_id.clone(),
            operation: operation.to_string(),
            timestamp: Utc::now(),
            pid: std::process::id(),
            hostname: self.hostname.clone(),
            lock_id: uuid::Uuid::new_v4().to_string(),
        };
        self.ops
            .write_file(&self.lock_path, &serde_json::to_vec_pretty(&record)?)?;

        std::thread::sleep(self.options.settle);

        match self.read_record()? {
            Some(current) if current.lock_id == record.lock_id => Ok(Attempt::Acquired(record)),
            Some(current) => {
                tracing::debug!(winner = %current, "Lost lock race");
                Ok(Attempt::Busy(current))
            }
            None => Err(SyncError::NotFound(format!(
                "{} vanished after writing it",
                self.lock_path
            ))),
        }
    }

    /// Acquire the lock for `operation`, polling until the timeout.
    ///
    /// On timeout the error names the current holder when a live lock is
    /// visible, otherwise it is a plain [`SyncError::LockTimeout`].
    pub fn acquire(&self, operation: &str, cancel: &CancellationToken) -> Result<LockGuard> {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            attempts += 1;

            match self.try_acquire(operation) {
                Ok(Attempt::Acquired(record)) => {
                    tracing::info!(
                        operation,
                        lock_id = %record.lock_id,
                        attempts,
                        "Repository lock acquired"
                    );
                    return Ok(LockGuard {
                        ops: Arc::clone(&self.ops),
                        tombstone_path: self.tombstone_path.clone(),
                        record,
                        released: false,
                    });
                }
                Ok(Attempt::Busy(holder)) => {
                    if attempts == 1 {
                        tracing::info!(%holder, "Repository is locked, waiting");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Lock status unknown, retrying");
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= self.options.timeout {
                return Err(match self.probe() {
                    Ok(LockProbe::Held(holder)) => SyncError::LockConflict {
                        holder: Box::new(holder),
                    },
                    _ => SyncError::LockTimeout { waited: elapsed },
                });
            }

            let remaining = self.options.timeout - elapsed;
            sleep_cancellable(self.options.poll_interval.min(remaining), cancel)?;
        }
    }
}

fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep((deadline - now).min(CANCEL_CHECK_INTERVAL));
    }
}

/// Held lock. Released explicitly or on drop.
pub struct LockGuard {
    ops: Arc<dyn FileOperations>,
    tombstone_path: String,
    record: LockRecord,
    released: bool,
}

impl LockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        DistributedLock::write_tombstone(
            self.ops.as_ref(),
            &self.tombstone_path,
            &self.record.lock_id,
        )?;
        tracing::info!(lock_id = %self.record.lock_id, "Repository lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::error!(
                lock_id = %self.record.lock_id,
                error = %e,
                "Failed to release repository lock; it will expire once stale"
            );
        }
    }
}
