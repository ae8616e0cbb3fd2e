//! Portable filename checks.
//!
//! A path is portable when every component can be created unchanged on
//! Linux, macOS and Windows filesystems and is already in Unicode NFC form.

use std::fmt;
use unicode_normalization::{is_nfc, UnicodeNormalization};

const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '\\', '|', '?', '*'];

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const MAX_COMPONENT_BYTES: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathIssue {
    /// Not in NFC form; carries the normalized path.
    NotNormalized(String),
    IllegalCharacter(char),
    ControlCharacter,
    ReservedName(String),
    TrailingDotOrSpace,
    ComponentTooLong(usize),
}

impl PathIssue {
    /// Can the scanner fix this by renaming?
    pub fn is_normalization_only(&self) -> bool {
        matches!(self, PathIssue::NotNormalized(_))
    }
}

impl fmt::Display for PathIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathIssue::NotNormalized(nfc) => write!(f, "not NFC normalized (expected {nfc:?})"),
            PathIssue::IllegalCharacter(c) => write!(f, "contains illegal character {c:?}"),
            PathIssue::ControlCharacter => write!(f, "contains a control character"),
            PathIssue::ReservedName(name) => write!(f, "uses reserved device name {name}"),
            PathIssue::TrailingDotOrSpace => write!(f, "component ends with a dot or space"),
            PathIssue::ComponentTooLong(len) => {
                write!(f, "component is {len} bytes (max {MAX_COMPONENT_BYTES})")
            }
        }
    }
}

/// A validation finding for one scanned path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub path: String,
    pub issues: Vec<PathIssue>,
}

impl ValidationWarning {
    pub fn is_normalization_only(&self) -> bool {
        self.issues.iter().all(PathIssue::is_normalization_only)
    }

    pub fn normalized_path(&self) -> Option<&str> {
        self.issues.iter().find_map(|issue| match issue {
            PathIssue::NotNormalized(nfc) => Some(nfc.as_str()),
            _ => None,
        })
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.path)?;
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

/// Check a forward-slash relative path. Empty result means portable.
pub fn check_path(path: &str) -> Vec<PathIssue> {
    let mut issues = Vec::new();

    if !is_nfc(path) {
        issues.push(PathIssue::NotNormalized(path.nfc().collect()));
    }

    for component in path.split('/') {
        check_component(component, &mut issues);
    }

    issues.dedup();
    issues
}

fn check_component(component: &str, issues: &mut Vec<PathIssue>) {
    if let Some(c) = component.chars().find(|c| ILLEGAL_CHARS.contains(c)) {
        issues.push(PathIssue::IllegalCharacter(c));
    }
    if component.chars().any(char::is_control) {
        issues.push(PathIssue::ControlCharacter);
    }

    let stem = component.split('.').next().unwrap_or(component);
    if RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
    {
        issues.push(PathIssue::ReservedName(stem.to_ascii_uppercase()));
    }

    if component.ends_with('.') || component.ends_with(' ') {
        issues.push(PathIssue::TrailingDotOrSpace);
    }

    if component.len() > MAX_COMPONENT_BYTES {
        issues.push(PathIssue::ComponentTooLong(component.len()));
    }
}

pub fn validate(path: &str) -> Option<ValidationWarning> {
    let issues = check_path(path);
    if issues.is_empty() {
        None
    } else {
        Some(ValidationWarning {
            path: path.to_string(),
            issues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_paths_are_portable() {
        for path in ["docs/report.pdf", ".gitignore", "a b/c-d_e.txt", "caf\u{e9}.txt"] {
            assert!(check_path(path).is_empty(), "{path}");
        }
    }

    #[test]
    fn flags_each_issue() {
        assert_eq!(check_path("a?b"), vec![PathIssue::IllegalCharacter('?')]);
        assert_eq!(check_path("dir/CON.txt"), vec![PathIssue::ReservedName("CON".into())]);
        assert_eq!(check_path("lpt1"), vec![PathIssue::ReservedName("LPT1".into())]);
        assert_eq!(check_path("trailing."), vec![PathIssue::TrailingDotOrSpace]);
        assert_eq!(check_path("tab\there"), vec![PathIssue::ControlCharacter]);
        assert_eq!(
            check_path(&"x".repeat(256)),
            vec![PathIssue::ComponentTooLong(256)]
        );
    }

    #[test]
    fn non_nfc_is_normalization_only() {
        let warning = validate("cafe\u{301}.txt").unwrap();
        assert!(warning.is_normalization_only());
        assert_eq!(warning.normalized_path(), Some("caf\u{e9}.txt"));

        let mixed = validate("cafe\u{301}?.txt").unwrap();
        assert!(!mixed.is_normalization_only());
    }
}
