//! snapsync core library
//!
//! Three-way synchronization between a working copy, its cache manifest and
//! a snapshot-backed remote store, with a file-based distributed lock and
//! crash-safe two-phase commits.

pub mod config;
pub mod context;
pub mod executor;
pub mod fs;
pub mod lock;
pub mod manifest;
pub mod retry;
pub mod sync;
pub mod transaction;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use context::SyncContext;
pub use executor::{StatusReport, SyncExecutor, SyncOptions, SyncReport};
pub use utils::errors::{ErrorKind, Result, SyncError};
