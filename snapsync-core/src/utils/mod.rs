//! Cross-cutting helpers: error taxonomy and logging setup.

pub mod errors;
pub mod logger;

pub use errors::{ErrorKind, Result, SyncError};
