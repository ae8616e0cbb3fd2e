use snapsync_core::{ErrorKind, SyncError};

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    /// Process exit status, stable across releases so scripts can branch on it.
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Usage(_) => 2,
            CliError::Internal(e) => {
                tracing::debug!("Internal error: {e:#}");
                1
            }
            CliError::Sync(e) => match e.kind() {
                ErrorKind::Configuration => 2,
                ErrorKind::Validation | ErrorKind::Schema | ErrorKind::Deserialization => 3,
                ErrorKind::Conflict => 4,
                ErrorKind::LockConflict | ErrorKind::LockTimeout => 5,
                ErrorKind::Network
                | ErrorKind::ConnectionTimeout
                | ErrorKind::Authentication
                | ErrorKind::Transfer => 6,
                ErrorKind::Unrecoverable
                | ErrorKind::TransactionRollback
                | ErrorKind::TransactionCommit => 7,
                ErrorKind::Cancelled => 130,
                ErrorKind::Permission
                | ErrorKind::Integrity
                | ErrorKind::NotFound
                | ErrorKind::Io
                | ErrorKind::Backend => 1,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn exit_codes_follow_error_kind() {
        let pending = CliError::from(SyncError::ConflictsPending {
            count: 2,
            path: PathBuf::from("conflicts.txt"),
        });
        assert_eq!(pending.exit_code(), 4);
        assert_eq!(CliError::from(SyncError::Cancelled).exit_code(), 130);
        assert_eq!(CliError::from(SyncError::Config("x".into())).exit_code(), 2);
        assert_eq!(
            CliError::from(SyncError::Authentication("denied".into())).exit_code(),
            6
        );
        assert_eq!(CliError::from(anyhow::anyhow!("boom")).exit_code(), 1);
    }
}
