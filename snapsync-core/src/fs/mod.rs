//! Local filesystem access: scanning, validation, metadata and atomic writes.

pub mod metadata;
pub mod ops;
pub mod validate;
pub mod walker;

pub use ops::{FileOperations, LocalFileOperations};
pub use walker::{scan_directory, ScanOptions, ScanResult};
