//! Directory scanning into a [`Manifest`].
//!
//! The scanner walks the working copy without following links, applies the
//! ignore rules, hashes file content and validates every path. Validation
//! problems are collected as warnings; they never abort the scan.

use std::path::{Component, Path};
use walkdir::WalkDir;

use super::metadata::entry_from_path;
use super::validate::{self, ValidationWarning};
use crate::config::{Config, DEFAULT_CONFLICTS_FILE, DEFAULT_METADATA_DIR};
use crate::manifest::Manifest;
use crate::utils::errors::{Result, SyncError};

/// Marker embedded in transaction-scoped temp file names.
pub const PENDING_MARKER: &str = ".pending-";

/// Options for scanning a working copy
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Exclude patterns: `name`, `*suffix`, `prefix*` or `dir/sub`
    pub exclude_patterns: Vec<String>,

    /// Hash file contents
    pub hash_files: bool,

    /// Metadata directory at the root, always ignored
    pub metadata_dir: String,

    /// Conflict resolution file at the root, always ignored
    pub conflicts_file: String,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            exclude_patterns: Vec::new(),
            hash_files: true,
            metadata_dir: DEFAULT_METADATA_DIR.to_string(),
            conflicts_file: DEFAULT_CONFLICTS_FILE.to_string(),
        }
    }
}

impl ScanOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            exclude_patterns: config.scan.exclude_patterns.clone(),
            hash_files: config.scan.hash_files,
            metadata_dir: config.repository.metadata_dir.clone(),
            conflicts_file: config.conflicts.file_name.clone(),
        }
    }

    fn is_ignored(&self, relative_path: &str, file_name: &str) -> bool {
        if relative_path == self.metadata_dir
            || relative_path.starts_with(&format!("{}/", self.metadata_dir))
            || relative_path == self.conflicts_file
            || file_name.contains(PENDING_MARKER)
        {
            return true;
        }

        self.exclude_patterns
            .iter()
            .any(|pattern| matches_pattern(pattern, relative_path, file_name))
    }
}

fn matches_pattern(pattern: &str, relative_path: &str, file_name: &str) -> bool {
    if pattern.contains('/') {
        let prefix = pattern.trim_end_matches('/');
        return relative_path == prefix || relative_path.starts_with(&format!("{prefix}/"));
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return file_name.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return file_name.starts_with(prefix);
    }
    file_name == pattern
}

/// Outcome of a scan
#[derive(Debug, Default)]
pub struct ScanResult {
    pub manifest: Manifest,

    /// Paths skipped by ignore rules (directories are listed once)
    pub ignored: Vec<String>,

    /// Paths that are not portable
    pub warnings: Vec<ValidationWarning>,
}

/// Forward-slash form of `path` relative to `root`.
pub fn relative_string(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Scan `root` into a manifest.
///
/// A missing root scans as empty; the working copy may not exist yet before
/// a clone.
pub fn scan_directory(root: &Path, options: &ScanOptions) -> Result<ScanResult> {
    let mut result = ScanResult::default();
    if !root.exists() {
        return Ok(result);
    }

    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            SyncError::io(path, e.into())
        })?;

        if entry.depth() == 0 {
            continue;
        }

        let Some(relative) = relative_string(root, entry.path()) else {
            tracing::warn!(path = %entry.path().display(), "Skipping path that is not valid UTF-8");
            result
                .ignored
                .push(entry.path().to_string_lossy().into_owned());
            continue;
        };
        let file_name = entry.file_name().to_string_lossy();

        if options.is_ignored(&relative, &file_name) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            result.ignored.push(relative);
            continue;
        }

        if entry.file_type().is_dir() {
            continue;
        }

        let Some(file_entry) = entry_from_path(entry.path(), &relative, options.hash_files)
            .map_err(|e| SyncError::io(entry.path(), e))?
        else {
            tracing::debug!(path = %relative, "Skipping special file");
            result.ignored.push(relative);
            continue;
        };

        let warning = validate::validate(&relative);
        if let Some(warning) = &warning {
            tracing::debug!(%warning, "Path is not portable");
            result.warnings.push(warning.clone());
        }

        // Names the manifest cannot hold (a backslash on Unix) stay out of
        // it; the warning blocks sync instead of the scan.
        if let Err(e) = result.manifest.insert(file_entry) {
            tracing::debug!(path = %relative, error = %e, "Path kept out of manifest");
            if warning.is_none() {
                result.warnings.push(ValidationWarning {
                    path: relative,
                    issues: vec![validate::PathIssue::IllegalCharacter('\\')],
                });
            }
        }
    }

    tracing::debug!(
        root = %root.display(),
        files = result.manifest.len(),
        ignored = result.ignored.len(),
        warnings = result.warnings.len(),
        "Scan complete"
    );

    Ok(result)
}
