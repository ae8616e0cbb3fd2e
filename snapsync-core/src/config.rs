//! Configuration management for snapsync.
//!
//! Loads configuration from a TOML file. Every section except the repository
//! root and the remote location has defaults, so a minimal file is two lines.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::errors::{Result, SyncError};

/// Name of the metadata directory inside both the working copy and the remote dataset.
pub const DEFAULT_METADATA_DIR: &str = ".snapsync";

/// Name of the conflict resolution file at the project root.
pub const DEFAULT_CONFLICTS_FILE: &str = "conflicts.txt";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub repository: RepositoryConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub conflicts: ConflictConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Local working copy root
    pub root: PathBuf,

    /// Acting user recorded in locks and snapshots (defaults to $USER)
    #[serde(default)]
    pub user_id: Option<String>,

    /// Metadata directory name, relative to the root
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Plain directory, staged through a per-transaction tree
    Directory,
    /// ZFS dataset, staged through a clone
    Zfs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Root directory for the directory backend
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Dataset name for the ZFS backend (e.g. `tank/projects/foo`)
    #[serde(default)]
    pub dataset: Option<String>,

    /// Mountpoint of the dataset, as seen by the host running `zfs`
    #[serde(default)]
    pub mountpoint: Option<PathBuf>,

    /// Run ZFS commands and file access over SSH instead of locally
    #[serde(default)]
    pub ssh: Option<SshConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub user: String,

    /// Private key file; the SSH agent is used when absent
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Exclude patterns: `name`, `*suffix`, `prefix*` or `dir/sub` path prefixes
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// Hash file contents (disable for the size+mtime comparison mode)
    #[serde(default = "default_true")]
    pub hash_files: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Overall acquisition timeout in seconds
    #[serde(default = "default_lock_timeout_secs")]
    pub timeout_secs: u64,

    /// Poll interval between acquisition attempts in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Age after which a lock record is considered abandoned, in seconds
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Delay between writing the lock record and re-reading it, in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_network_attempts")]
    pub network_attempts: u32,

    #[serde(default = "default_filesystem_attempts")]
    pub filesystem_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Keep the previous local copy when a resolved conflict overwrites it
    #[serde(default = "default_true")]
    pub backup_on_conflict: bool,

    /// Resolution file name at the project root
    #[serde(default = "default_conflicts_file")]
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_metadata_dir() -> String {
    DEFAULT_METADATA_DIR.to_string()
}

fn default_backend() -> BackendKind {
    BackendKind::Directory
}

fn default_ssh_port() -> u16 {
    22
}

fn default_exclude_patterns() -> Vec<String> {
    vec![".DS_Store".to_string(), "*.swp".to_string(), "*~".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_lock_timeout_secs() -> u64 {
    10 * 60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_stale_after_secs() -> u64 {
    30 * 60
}

fn default_settle_ms() -> u64 {
    100
}

fn default_network_attempts() -> u32 {
    5
}

fn default_filesystem_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_conflicts_file() -> String {
    DEFAULT_CONFLICTS_FILE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
            hash_files: true,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_lock_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            stale_after_secs: default_stale_after_secs(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            network_attempts: default_network_attempts(),
            filesystem_attempts: default_filesystem_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            backup_on_conflict: true,
            file_name: default_conflicts_file(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Resolve the configuration for a working copy.
    ///
    /// A missing file yields [`Config::for_root`]; a file that exists but
    /// cannot be read or parsed is an error, never a silent fallback.
    pub fn load(path: Option<&Path>, root: &Path) -> Result<Self> {
        let candidate = match path {
            Some(p) => p.to_path_buf(),
            None => root.join(DEFAULT_METADATA_DIR).join("config.toml"),
        };

        let config = if candidate.exists() {
            Self::from_file(&candidate)?
        } else if path.is_some() {
            return Err(SyncError::Config(format!(
                "config file {} does not exist",
                candidate.display()
            )));
        } else {
            Self::for_root(root)
        };

        config.validate()?;
        Ok(config)
    }

    /// Minimal configuration for a working copy with no config file.
    /// The remote location still has to be supplied before syncing.
    pub fn for_root(root: &Path) -> Self {
        Config {
            repository: RepositoryConfig {
                root: root.to_path_buf(),
                user_id: None,
                metadata_dir: default_metadata_dir(),
            },
            remote: RemoteConfig {
                backend: BackendKind::Directory,
                path: None,
                dataset: None,
                mountpoint: None,
                ssh: None,
            },
            scan: ScanConfig::default(),
            lock: LockConfig::default(),
            retry: RetryConfig::default(),
            conflicts: ConflictConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Check backend requirements and value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.repository.metadata_dir.is_empty()
            || self.repository.metadata_dir.contains('/')
            || self.repository.metadata_dir == ".."
        {
            return Err(SyncError::Config(format!(
                "metadata_dir must be a single directory name, got {:?}",
                self.repository.metadata_dir
            )));
        }

        match self.remote.backend {
            BackendKind::Directory => {
                if self.remote.ssh.is_some() {
                    return Err(SyncError::Config(
                        "the directory backend does not support [remote.ssh]".into(),
                    ));
                }
            }
            BackendKind::Zfs => {
                if self.remote.dataset.as_deref().is_none_or(str::is_empty) {
                    return Err(SyncError::Config(
                        "the zfs backend requires remote.dataset".into(),
                    ));
                }
                if self.remote.mountpoint.is_none() {
                    return Err(SyncError::Config(
                        "the zfs backend requires remote.mountpoint".into(),
                    ));
                }
            }
        }

        if self.lock.poll_interval_ms == 0 {
            return Err(SyncError::Config("lock.poll_interval_ms must be positive".into()));
        }
        if self.retry.network_attempts == 0 || self.retry.filesystem_attempts == 0 {
            return Err(SyncError::Config("retry attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(SyncError::Config("retry.multiplier must be >= 1.0".into()));
        }

        Ok(())
    }

    /// Remote directory for the directory backend, or a configuration error.
    pub fn remote_path(&self) -> Result<&Path> {
        self.remote.path.as_deref().ok_or_else(|| {
            SyncError::Config("remote.path is not set for the directory backend".into())
        })
    }

    pub fn conflicts_path(&self) -> PathBuf {
        self.repository.root.join(&self.conflicts.file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn minimal_file_fills_defaults() {
        let config = Config::from_toml(
            r#"
[repository]
root = "/work/project"

[remote]
path = "/mnt/remote/project"
"#,
        )
        .unwrap();

        assert_eq!(config.repository.metadata_dir, ".snapsync");
        assert_eq!(config.remote.backend, BackendKind::Directory);
        assert_eq!(config.lock.timeout(), Duration::from_secs(600));
        assert_eq!(config.lock.stale_after(), Duration::from_secs(1800));
        assert_eq!(config.lock.poll_interval(), Duration::from_secs(1));
        assert!(config.scan.hash_files);
        assert!(config.conflicts.backup_on_conflict);
        assert_eq!(config.conflicts.file_name, "conflicts.txt");
        config.validate().unwrap();
    }

    #[test]
    fn zfs_backend_requires_dataset() {
        let config = Config::from_toml(
            r#"
[repository]
root = "/work/project"

[remote]
backend = "zfs"
mountpoint = "/tank/project"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("remote.dataset"));
    }

    #[test]
    fn missing_default_file_falls_back_to_root_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(None, dir.path()).unwrap();
        assert_eq!(config.repository.root, dir.path());
        assert!(config.remote_path().is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.toml")), dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[repository\nroot = ").unwrap();
        let err = Config::load(Some(&path), dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
