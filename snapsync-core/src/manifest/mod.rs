//! Manifest model: which files exist, with what content.
//!
//! A manifest maps relative paths to [`FileEntry`] values and optionally
//! carries snapshot [`Metadata`]. The persisted form is a JSON object with an
//! `entries` mapping and a nested `metadata` object:
//!
//! ```json
//! {
//!   "entries": {
//!     "docs/a.txt": {"type": "file", "path": "docs/a.txt", "filesize": 5, "mtime": 1700000000, "hash": "2cf2..."},
//!     "latest": {"type": "link", "path": "latest", "reference": "docs/a.txt"}
//!   },
//!   "metadata": {"snapshot_id": "...", "snapshot_previous": "...", "snapshot_hash": "..."}
//! }
//! ```

pub mod chain;
pub mod digest;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use unicode_normalization::{is_nfc, UnicodeNormalization};

pub use digest::{hash_file, Digest, DigestWriter};

use crate::fs::ops::write_atomic;
use crate::utils::errors::{Result, SyncError};

/// One tracked path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileEntry {
    File {
        path: String,
        filesize: u64,
        /// Whole seconds since the Unix epoch
        mtime: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<Digest>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
    },
    Link {
        path: String,
        reference: String,
    },
}

impl FileEntry {
    pub fn file(path: impl Into<String>, filesize: u64, mtime: i64, hash: Option<Digest>) -> Self {
        FileEntry::File {
            path: path.into(),
            filesize,
            mtime,
            hash,
            owner: None,
        }
    }

    pub fn link(path: impl Into<String>, reference: impl Into<String>) -> Self {
        FileEntry::Link {
            path: path.into(),
            reference: reference.into(),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            FileEntry::File { path, .. } | FileEntry::Link { path, .. } => path,
        }
    }

    fn set_path(&mut self, new_path: String) {
        match self {
            FileEntry::File { path, .. } | FileEntry::Link { path, .. } => *path = new_path,
        }
    }

    pub fn is_link(&self) -> bool {
        matches!(self, FileEntry::Link { .. })
    }

    /// Modification time, for regular files only.
    pub fn mtime(&self) -> Option<i64> {
        match self {
            FileEntry::File { mtime, .. } => Some(*mtime),
            FileEntry::Link { .. } => None,
        }
    }

    pub fn hash(&self) -> Option<&Digest> {
        match self {
            FileEntry::File { hash, .. } => hash.as_ref(),
            FileEntry::Link { .. } => None,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            FileEntry::File { filesize, .. } => *filesize,
            FileEntry::Link { reference, .. } => reference.len() as u64,
        }
    }

    /// Content equality.
    ///
    /// Files compare by hash when both carry one, otherwise by
    /// `(filesize, mtime)`. Links compare by target. A file never equals a link.
    pub fn is_same_as(&self, other: &FileEntry) -> bool {
        match (self, other) {
            (
                FileEntry::File {
                    filesize: size_a,
                    mtime: mtime_a,
                    hash: hash_a,
                    ..
                },
                FileEntry::File {
                    filesize: size_b,
                    mtime: mtime_b,
                    hash: hash_b,
                    ..
                },
            ) => match (hash_a, hash_b) {
                (Some(a), Some(b)) => a == b,
                _ => size_a == size_b && mtime_a == mtime_b,
            },
            (FileEntry::Link { reference: a, .. }, FileEntry::Link { reference: b, .. }) => a == b,
            _ => false,
        }
    }

    /// Stable identity string folded into manifest hashes.
    fn identity(&self) -> String {
        match self {
            FileEntry::File {
                hash: Some(hash), ..
            } => hash.to_string(),
            FileEntry::File {
                filesize, mtime, ..
            } => format!("size:{filesize}:mtime:{mtime}"),
            FileEntry::Link { reference, .. } => format!("link:{reference}"),
        }
    }
}

/// Snapshot metadata, always nested under the document's `metadata` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default)]
    pub snapshot_message: Option<String>,
    #[serde(default)]
    pub snapshot_previous: Option<String>,
    #[serde(default)]
    pub snapshot_hash: Option<Digest>,
    pub entry_count: usize,
    pub entries_hash: Digest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    entries: BTreeMap<String, FileEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry under its NFC-normalized path.
    ///
    /// Returns the original path when normalization changed it, so callers
    /// can surface a warning. Paths that are not clean relative paths are
    /// rejected.
    pub fn insert(&mut self, mut entry: FileEntry) -> Result<Option<String>> {
        let original = entry.path().to_string();
        if !is_clean_relative(&original) {
            return Err(SyncError::Validation {
                paths: vec![original],
            });
        }

        let renamed = if is_nfc(&original) {
            None
        } else {
            entry.set_path(original.nfc().collect());
            Some(original)
        };

        self.entries.insert(entry.path().to_string(), entry);
        Ok(renamed)
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<FileEntry> {
        self.entries.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order.
    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(FileEntry::size).sum()
    }

    pub fn snapshot_id(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.snapshot_id.as_str())
    }

    pub fn snapshot_hash(&self) -> Option<&Digest> {
        self.metadata.as_ref().and_then(|m| m.snapshot_hash.as_ref())
    }

    fn hash_entries(&self, hasher: &mut Sha256) {
        for (path, entry) in &self.entries {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(entry.identity().as_bytes());
            hasher.update(b"\n");
        }
    }

    /// Digest over the entry identities alone.
    pub fn entries_hash(&self) -> Digest {
        let mut hasher = Sha256::new();
        self.hash_entries(&mut hasher);
        Digest::from_hasher(hasher)
    }

    /// Chain hash over the entries, the snapshot message and the previous
    /// snapshot's hash. Entry order does not matter: entries are folded in
    /// path order.
    pub fn compute_snapshot_hash(&self, message: &str, previous_hash: Option<&Digest>) -> Digest {
        let mut hasher = Sha256::new();
        self.hash_entries(&mut hasher);
        hasher.update(b"message\0");
        hasher.update(message.as_bytes());
        hasher.update(b"\nprevious\0");
        if let Some(previous) = previous_hash {
            hasher.update(previous.as_str().as_bytes());
        }
        Digest::from_hasher(hasher)
    }

    /// Metadata with count and entries hash filled in. The chain fields
    /// (`snapshot_message`, `snapshot_previous`, `snapshot_hash`) are left
    /// empty for the caller to link.
    pub fn generate_metadata(&self, snapshot_id: &str, user_id: &str) -> Metadata {
        Metadata {
            snapshot_id: snapshot_id.to_string(),
            created_at: Utc::now(),
            created_by: user_id.to_string(),
            snapshot_message: None,
            snapshot_previous: None,
            snapshot_hash: None,
            entry_count: self.entries.len(),
            entries_hash: self.entries_hash(),
        }
    }

    /// Generate metadata and link it after `previous`.
    pub fn link_snapshot(
        &mut self,
        snapshot_id: &str,
        user_id: &str,
        message: &str,
        previous: Option<&Manifest>,
    ) {
        let mut metadata = self.generate_metadata(snapshot_id, user_id);
        let previous_hash = previous.and_then(Manifest::snapshot_hash);
        metadata.snapshot_hash = Some(self.compute_snapshot_hash(message, previous_hash));
        metadata.snapshot_previous = previous.and_then(|m| m.snapshot_id().map(str::to_string));
        metadata.snapshot_message = Some(message.to_string());
        self.metadata = Some(metadata);
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_slice(text.as_bytes(), "manifest")
    }

    /// Parse a manifest document. `context` names the source in errors.
    pub fn from_slice(bytes: &[u8], context: &str) -> Result<Self> {
        let document: Value =
            serde_json::from_slice(bytes).map_err(|source| SyncError::Deserialization {
                context: context.to_string(),
                source,
            })?;

        let Value::Object(mut root) = document else {
            return Err(SyncError::Schema(format!("{context}: document is not an object")));
        };

        let entries = match root.remove("entries") {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(SyncError::Schema(format!(
                    "{context}: `entries` is not a mapping"
                )))
            }
            None => return Err(SyncError::Schema(format!("{context}: missing `entries`"))),
        };

        let mut manifest = Manifest::new();
        for (key, value) in entries {
            let entry: FileEntry = serde_json::from_value(value).map_err(|e| {
                SyncError::Schema(format!("{context}: entry {key:?}: {e}"))
            })?;
            if entry.path() != key {
                return Err(SyncError::Schema(format!(
                    "{context}: entry key {key:?} does not match its path {:?}",
                    entry.path()
                )));
            }
            manifest.insert(entry)?;
        }

        manifest.metadata = match root.remove("metadata") {
            None | Some(Value::Null) => None,
            Some(value) => Some(serde_json::from_value(value).map_err(|e| {
                SyncError::Schema(format!("{context}: metadata: {e}"))
            })?),
        };

        Ok(manifest)
    }

    /// Read a manifest file; a missing file is reported as `NotFound`.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| SyncError::io(path, e))?;
        Self::from_slice(&bytes, &path.display().to_string())
    }

    /// Like [`Manifest::load`], but a missing file is an empty manifest.
    pub fn load_or_empty(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(e) if e.is_not_found() => Ok(Manifest::new()),
            other => other,
        }
    }

    /// Write atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.to_json()?.as_bytes())
    }
}

/// Relative, forward-slash, no empty, `.` or `..` components.
pub fn is_clean_relative(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && path
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}
