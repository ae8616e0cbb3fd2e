//! The `conflicts.txt` resolution file.
//!
//! Generation lists every conflicted path with the available copies and a
//! ranked set of suggestion lines. The user keeps exactly one suggestion per
//! file; parsing turns the edited file back into a [`ResolutionMap`].

use chrono::DateTime;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use super::state::SyncState;
use crate::manifest::{FileEntry, Manifest};

const FILE_PREFIX: &str = "# File:";

/// Which copy wins a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Remote,
    Local,
    Cache,
}

impl Resolution {
    pub fn letter(self) -> char {
        match self {
            Resolution::Remote => 'R',
            Resolution::Local => 'L',
            Resolution::Cache => 'C',
        }
    }

    pub fn from_letter(letter: &str) -> Option<Self> {
        match letter {
            "R" | "r" => Some(Resolution::Remote),
            "L" | "l" => Some(Resolution::Local),
            "C" | "c" => Some(Resolution::Cache),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Resolution::Remote => "Use Remote version (download)",
            Resolution::Local => "Use Local version (upload)",
            Resolution::Cache => "Use Cached version (restore)",
        }
    }

    fn copy_name(self) -> &'static str {
        match self {
            Resolution::Remote => "Remote",
            Resolution::Local => "Local",
            Resolution::Cache => "Cached",
        }
    }

    /// Tie-break rank: lower wins.
    fn tie_rank(self) -> u8 {
        match self {
            Resolution::Remote => 0,
            Resolution::Local => 1,
            Resolution::Cache => 2,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

pub type ResolutionMap = BTreeMap<String, Resolution>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("No resolution chosen for {} file(s): {}", .paths.len(), .paths.join(", "))]
    MissingResolution { paths: Vec<String> },

    #[error("Resolution given for {path}, which is not in conflict")]
    UnexpectedResolution { path: String },

    #[error("More than one resolution chosen for {path}")]
    AmbiguousResolution { path: String },

    #[error("Resolution {choice} for {path} names a copy that does not exist")]
    UnavailableChoice { path: String, choice: Resolution },

    #[error("Unrecognized line {line_number} in conflicts file: {line:?}")]
    Parse { line_number: usize, line: String },
}

/// One conflicted path with the copies that exist.
#[derive(Debug, Clone)]
pub struct ConflictCase {
    pub path: String,
    pub state: SyncState,
    pub local: Option<FileEntry>,
    pub cache: Option<FileEntry>,
    pub remote: Option<FileEntry>,
}

impl ConflictCase {
    pub fn from_manifests(
        path: &str,
        state: SyncState,
        local: &Manifest,
        cache: &Manifest,
        remote: &Manifest,
    ) -> Self {
        Self {
            path: path.to_string(),
            state,
            local: local.get(path).cloned(),
            cache: cache.get(path).cloned(),
            remote: remote.get(path).cloned(),
        }
    }

    fn copy(&self, which: Resolution) -> Option<&FileEntry> {
        match which {
            Resolution::Remote => self.remote.as_ref(),
            Resolution::Local => self.local.as_ref(),
            Resolution::Cache => self.cache.as_ref(),
        }
    }

    pub fn offers(&self, which: Resolution) -> bool {
        self.copy(which).is_some()
    }

    /// Available choices, newest first; ties prefer Remote, then Local, then Cache.
    pub fn ranked_choices(&self) -> Vec<Resolution> {
        let mut choices: Vec<Resolution> = [Resolution::Remote, Resolution::Local, Resolution::Cache]
            .into_iter()
            .filter(|r| self.offers(*r))
            .collect();
        choices.sort_by_key(|r| {
            let mtime = self.copy(*r).and_then(FileEntry::mtime).unwrap_or(i64::MIN);
            (std::cmp::Reverse(mtime), r.tie_rank())
        });
        choices
    }
}

fn describe_copy(entry: &FileEntry) -> String {
    match entry {
        FileEntry::Link { reference, .. } => format!("symbolic link to {reference}"),
        FileEntry::File {
            mtime, filesize, ..
        } => {
            let when = DateTime::from_timestamp(*mtime, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| mtime.to_string());
            format!("{when}, {filesize} bytes")
        }
    }
}

/// Render the resolution file.
pub fn generate(cases: &[ConflictCase], user_id: &str, backups_enabled: bool) -> String {
    let mut out = String::new();
    out.push_str("# snapsync conflict resolution\n");
    out.push_str(&format!("# User: {user_id}\n"));
    out.push_str(&format!(
        "# Backups on conflict: {}\n",
        if backups_enabled { "enabled" } else { "disabled" }
    ));
    out.push_str("#\n");
    out.push_str("# For every file keep exactly one line (_R, _L or _C) and delete the others,\n");
    out.push_str("# then run sync again. Suggestions are listed newest first.\n");

    for case in cases {
        out.push('\n');
        out.push_str(&format!("{FILE_PREFIX} {}\n", case.path));
        out.push_str(&format!("# Conflict: {}\n", case.state.describe()));
        for which in [Resolution::Local, Resolution::Remote, Resolution::Cache] {
            if let Some(entry) = case.copy(which) {
                out.push_str(&format!(
                    "#   {:<7} {}\n",
                    format!("{}:", which.copy_name()),
                    describe_copy(entry)
                ));
            }
        }
        for choice in case.ranked_choices() {
            out.push_str(&format!("_{}  # {}\n", choice.letter(), choice.label()));
        }
    }

    out
}

/// Parse an edited resolution file.
///
/// Every `# File:` block must hold exactly one choice. Lines starting with
/// `#` are comments; anything after a `#` on a choice line is ignored.
pub fn parse(text: &str) -> Result<ResolutionMap, ConflictError> {
    let mut blocks: Vec<(String, Vec<Resolution>)> = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(path) = line.strip_prefix(FILE_PREFIX) {
            blocks.push((path.trim().to_string(), Vec::new()));
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let token = line.split('#').next().unwrap_or("").trim();
        let letter = token.strip_prefix('_').unwrap_or(token);
        let parse_error = || ConflictError::Parse {
            line_number: index + 1,
            line: raw.to_string(),
        };

        let choice = Resolution::from_letter(letter).ok_or_else(parse_error)?;
        match blocks.last_mut() {
            Some((_, choices)) => choices.push(choice),
            None => return Err(parse_error()),
        }
    }

    let mut resolutions = ResolutionMap::new();
    let mut missing = Vec::new();
    for (path, mut choices) in blocks {
        if resolutions.contains_key(&path) {
            return Err(ConflictError::AmbiguousResolution { path });
        }
        choices.dedup();
        match choices.as_slice() {
            [] => missing.push(path),
            [choice] => {
                resolutions.insert(path, *choice);
            }
            _ => return Err(ConflictError::AmbiguousResolution { path }),
        }
    }

    if !missing.is_empty() {
        return Err(ConflictError::MissingResolution { paths: missing });
    }
    Ok(resolutions)
}

/// Check parsed resolutions against the conflicts actually present.
pub fn validate(resolutions: &ResolutionMap, cases: &[ConflictCase]) -> Result<(), ConflictError> {
    let by_path: BTreeMap<&str, &ConflictCase> =
        cases.iter().map(|c| (c.path.as_str(), c)).collect();

    for (path, choice) in resolutions {
        let Some(case) = by_path.get(path.as_str()) else {
            return Err(ConflictError::UnexpectedResolution { path: path.clone() });
        };
        if !case.offers(*choice) {
            return Err(ConflictError::UnavailableChoice {
                path: path.clone(),
                choice: *choice,
            });
        }
    }

    let missing: Vec<String> = cases
        .iter()
        .filter(|c| !resolutions.contains_key(&c.path))
        .map(|c| c.path.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ConflictError::MissingResolution { paths: missing });
    }

    Ok(())
}
