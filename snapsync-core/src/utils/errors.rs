//! Error types for the synchronization engine.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::lock::LockRecord;
use crate::sync::conflict::ConflictError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation failed for {} path(s): {}", .paths.len(), .paths.join(", "))]
    Validation { paths: Vec<String> },

    #[error("{what} at {location} is not empty")]
    NotEmpty { what: String, location: String },

    #[error("Repository is locked by {holder}")]
    LockConflict { holder: Box<LockRecord> },

    #[error("Timed out after {waited:?} acquiring the repository lock (no live holder visible)")]
    LockTimeout { waited: Duration },

    #[error("Rollback of transaction {transaction_id} failed: {reason}. Recovery hint: {hint}")]
    TransactionRollback {
        transaction_id: String,
        reason: String,
        hint: String,
    },

    #[error("Commit of transaction {transaction_id} failed before the point of no return: {source}")]
    TransactionCommit {
        transaction_id: String,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Transaction {transaction_id} failed after the point of no return during {stage}: {source}. Run `snapsync recover` to complete it")]
    Unrecoverable {
        transaction_id: String,
        stage: String,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Transaction {transaction_id} from an earlier run is unfinished; run `snapsync recover`")]
    PendingTransaction { transaction_id: String },

    #[error("Network error during {operation}: {message}")]
    Network { operation: String, message: String },

    #[error("Connection timed out during {operation}")]
    ConnectionTimeout { operation: String },

    #[error("Transfer of {path} failed: {message}")]
    Transfer { path: String, message: String },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Malformed JSON in {context}: {source}")]
    Deserialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Manifest schema error: {0}")]
    Schema(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("{count} conflict(s) need resolution; edit {} and run sync again", .path.display())]
    ConflictsPending { count: usize, path: PathBuf },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote backend error during {operation}: {message}")]
    Backend { operation: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Closed classification of [`SyncError`], used by retry allow-lists and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Validation,
    LockConflict,
    LockTimeout,
    TransactionRollback,
    TransactionCommit,
    Unrecoverable,
    Network,
    ConnectionTimeout,
    Transfer,
    Authentication,
    Permission,
    Integrity,
    Deserialization,
    Schema,
    Conflict,
    NotFound,
    Io,
    Backend,
    Cancelled,
}

impl SyncError {
    /// Wrap an I/O error with the path it happened on, keeping permission
    /// and connectivity failures distinguishable.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Config(_) => ErrorKind::Configuration,
            SyncError::Validation { .. } | SyncError::NotEmpty { .. } => ErrorKind::Validation,
            SyncError::LockConflict { .. } => ErrorKind::LockConflict,
            SyncError::LockTimeout { .. } => ErrorKind::LockTimeout,
            SyncError::TransactionRollback { .. } => ErrorKind::TransactionRollback,
            SyncError::TransactionCommit { .. } => ErrorKind::TransactionCommit,
            SyncError::Unrecoverable { .. } | SyncError::PendingTransaction { .. } => {
                ErrorKind::Unrecoverable
            }
            SyncError::Network { .. } => ErrorKind::Network,
            SyncError::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            SyncError::Transfer { .. } => ErrorKind::Transfer,
            SyncError::Authentication(_) => ErrorKind::Authentication,
            SyncError::PermissionDenied(_) => ErrorKind::Permission,
            SyncError::Integrity { .. } => ErrorKind::Integrity,
            SyncError::Deserialization { .. } | SyncError::Serialization(_) => {
                ErrorKind::Deserialization
            }
            SyncError::Schema(_) => ErrorKind::Schema,
            SyncError::Conflict(_) | SyncError::ConflictsPending { .. } => ErrorKind::Conflict,
            SyncError::Io { source, .. } => classify_io(source),
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Backend { .. } => ErrorKind::Backend,
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

fn classify_io(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        io::ErrorKind::TimedOut => ErrorKind::ConnectionTimeout,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ErrorKind::Network,
        _ => ErrorKind::Io,
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
