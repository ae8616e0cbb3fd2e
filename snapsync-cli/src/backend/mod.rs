//! Remote store selection.

pub mod host;
pub mod ssh;
pub mod zfs;

use std::sync::Arc;

use snapsync_core::config::BackendKind;
use snapsync_core::transaction::{DirectoryRemote, RemoteStore};
use snapsync_core::transfer::{LocalTransport, Transport};
use snapsync_core::{Config, Result, SyncError};

use self::host::LocalHostFs;
use self::ssh::{SftpHostFs, SftpTransport, SshConnection, SshRunner};
use self::zfs::{LocalRunner, ZfsRemote};

/// A remote store and the transport that moves bytes to and from it.
pub struct Backend {
    pub remote: Box<dyn RemoteStore>,
    pub transport: Box<dyn Transport>,
}

/// Connect to the backend named by `config`. Blocking for SSH remotes.
pub fn open(config: &Config) -> Result<Backend> {
    let metadata_dir = config.repository.metadata_dir.clone();
    let backend = match config.remote.backend {
        BackendKind::Directory => Backend {
            remote: Box::new(DirectoryRemote::new(config.remote_path()?, &metadata_dir)),
            transport: Box::new(LocalTransport::new()),
        },
        BackendKind::Zfs => {
            let dataset = config
                .remote
                .dataset
                .clone()
                .ok_or_else(|| SyncError::Config("remote.dataset is not set".into()))?;
            let mountpoint = config
                .remote
                .mountpoint
                .clone()
                .ok_or_else(|| SyncError::Config("remote.mountpoint is not set".into()))?;

            match &config.remote.ssh {
                None => Backend {
                    remote: Box::new(ZfsRemote::new(
                        Box::new(LocalRunner),
                        Arc::new(LocalHostFs),
                        dataset,
                        mountpoint,
                        metadata_dir,
                    )),
                    transport: Box::new(LocalTransport::new()),
                },
                Some(ssh) => {
                    let conn = SshConnection::connect(ssh)?;
                    Backend {
                        remote: Box::new(ZfsRemote::new(
                            Box::new(SshRunner::new(Arc::clone(&conn))),
                            Arc::new(SftpHostFs::new(Arc::clone(&conn))),
                            dataset,
                            mountpoint,
                            metadata_dir,
                        )),
                        transport: Box::new(SftpTransport::new(conn)),
                    }
                }
            }
        }
    };
    tracing::debug!(remote = %backend.remote.describe(), "Opened remote store");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn directory_backend_opens_without_io() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::for_root(&dir.path().join("work"));
        config.remote.path = Some(dir.path().join("remote"));

        let backend = open(&config).unwrap();
        assert!(backend.remote.describe().contains("remote"));
    }

    #[test]
    fn directory_backend_needs_a_path() {
        let config = Config::for_root(Path::new("/tmp/work"));
        assert!(matches!(open(&config), Err(SyncError::Config(_))));
    }

    #[test]
    fn local_zfs_backend_locks_outside_the_dataset() {
        let mut config = Config::for_root(Path::new("/tmp/work"));
        config.remote.backend = BackendKind::Zfs;
        config.remote.dataset = Some("tank/projects".into());
        config.remote.mountpoint = Some("/tank/projects".into());

        let backend = open(&config).unwrap();
        assert_eq!(backend.remote.describe(), "zfs tank/projects at /tank/projects");
    }
}
