//! Startup crash recovery.
//!
//! Commits any client left half-applied on the remote are finished first,
//! so nothing is planned against a head that is about to change. A leftover
//! client marker then means this working copy died mid-transaction; whether
//! to go forward or back depends on whether the remote got past its commit
//! point.

use super::client::{ClientStaging, Phase};
use super::remote::{RemoteRecovery, RemoteStore};
use super::TransactionId;
use crate::utils::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No interrupted transaction.
    Clean,
    RolledForward(TransactionId),
    RolledBack(TransactionId),
}

/// Finish or undo an interrupted transaction. Running it again is a no-op.
pub fn recover(client: &ClientStaging, remote: &dyn RemoteStore) -> Result<RecoveryOutcome> {
    for id in remote.recover_committed()? {
        tracing::info!(transaction_id = %id, "Finished a commit left behind on the remote");
    }

    let Some(marker) = client.read_marker()? else {
        return Ok(RecoveryOutcome::Clean);
    };
    let id = marker.transaction_id.clone();
    tracing::warn!(transaction_id = %id, phase = ?marker.phase, "Found interrupted transaction");

    let forward = match marker.phase {
        // The remote commit never started.
        Phase::Staging => {
            remote.rollback_transaction(&id)?;
            false
        }
        Phase::Committing => match remote.recover_transaction(&id)? {
            RemoteRecovery::Completed => true,
            RemoteRecovery::Discarded => false,
            RemoteRecovery::NothingPending => {
                let head = remote.load_manifest()?;
                let committed = marker.target_snapshot_hash.is_some()
                    && head.snapshot_hash() == marker.target_snapshot_hash.as_ref();
                tracing::debug!(
                    transaction_id = %id,
                    committed,
                    "Compared remote head with the interrupted target"
                );
                committed
            }
        },
    };

    if forward {
        client.roll_forward(&marker)?;
        tracing::info!(transaction_id = %id, "Recovered transaction forward");
        Ok(RecoveryOutcome::RolledForward(id))
    } else {
        client.rollback_marker(&marker)?;
        tracing::info!(transaction_id = %id, "Rolled back interrupted transaction");
        Ok(RecoveryOutcome::RolledBack(id))
    }
}
