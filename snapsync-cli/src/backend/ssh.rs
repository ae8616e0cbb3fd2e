//! ZFS host reached over SSH.
//!
//! One [`ssh2::Session`] carries both the `zfs` command channel and an SFTP
//! subsystem for file access. Everything here is blocking and runs inside
//! `spawn_blocking`.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ssh2::{FileStat, RenameFlags, Session, Sftp};

use snapsync_core::config::SshConfig;
use snapsync_core::manifest::DigestWriter;
use snapsync_core::transfer::local::write_stream_to;
use snapsync_core::transfer::{
    verify_transfer, ContentStream, TransferHandle, TransferSession, Transport,
};
use snapsync_core::{Result, SyncError};

use super::host::HostFs;
use super::zfs::{CommandOutput, CommandRunner};

const SESSION_TIMEOUT_MS: u32 = 30_000;

fn network_error(operation: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::Network {
        operation: operation.to_string(),
        message: e.to_string(),
    }
}

fn sftp_error(path: &Path, e: ssh2::Error) -> SyncError {
    SyncError::io(path, io::Error::from(e))
}

/// Single-quote `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./@=:+,".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| shell_quote(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct SshConnection {
    session: Session,
    sftp: Sftp,
    target: String,
}

impl SshConnection {
    pub fn connect(config: &SshConfig) -> Result<Arc<Self>> {
        let target = format!("{}@{}:{}", config.user, config.host, config.port);
        tracing::info!(target = %target, "Connecting over SSH");

        let tcp = TcpStream::connect((config.host.as_str(), config.port)).map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut {
                SyncError::ConnectionTimeout {
                    operation: format!("connect to {target}"),
                }
            } else {
                network_error(&format!("connect to {target}"), e)
            }
        })?;
        let mut session = Session::new().map_err(|e| network_error("ssh session", e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(SESSION_TIMEOUT_MS);
        session
            .handshake()
            .map_err(|e| network_error("ssh handshake", e))?;

        let auth = match &config.identity_file {
            Some(key) => session.userauth_pubkey_file(&config.user, None, key, None),
            None => session.userauth_agent(&config.user),
        };
        auth.map_err(|e| SyncError::Authentication(format!("{target}: {e}")))?;
        if !session.authenticated() {
            return Err(SyncError::Authentication(format!(
                "{target}: server rejected credentials"
            )));
        }

        let sftp = session
            .sftp()
            .map_err(|e| network_error("start sftp subsystem", e))?;
        tracing::debug!(target = %target, "SSH session established");
        Ok(Arc::new(Self {
            session,
            sftp,
            target,
        }))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Run a shell command line and collect its output.
    pub fn exec(&self, command: &str) -> Result<CommandOutput> {
        let op = "ssh exec";
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| network_error(op, e))?;
        channel.exec(command).map_err(|e| network_error(op, e))?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| network_error(op, e))?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| network_error(op, e))?;
        channel.wait_close().map_err(|e| network_error(op, e))?;
        let status = channel.exit_status().map_err(|e| network_error(op, e))?;

        tracing::debug!(command = %command, status, "Remote command finished");
        Ok(CommandOutput {
            success: status == 0,
            stdout,
            stderr,
        })
    }

    fn exec_checked(&self, command: &str) -> Result<()> {
        let output = self.exec(command)?;
        if output.success {
            Ok(())
        } else {
            Err(SyncError::Backend {
                operation: command.to_string(),
                message: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs `zfs` on the remote host.
pub struct SshRunner {
    conn: Arc<SshConnection>,
}

impl SshRunner {
    pub fn new(conn: Arc<SshConnection>) -> Self {
        Self { conn }
    }
}

impl CommandRunner for SshRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.conn.exec(&command_line(program, args))
    }
}

pub struct SftpHostFs {
    conn: Arc<SshConnection>,
}

impl SftpHostFs {
    pub fn new(conn: Arc<SshConnection>) -> Self {
        Self { conn }
    }

    fn sftp(&self) -> &Sftp {
        &self.conn.sftp
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => self.create_dir_all(parent),
            _ => Ok(()),
        }
    }
}

impl HostFs for SftpHostFs {
    fn exists(&self, path: &Path) -> Result<bool> {
        match self.sftp().lstat(path) {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = io::Error::from(e);
                if err.kind() == io::ErrorKind::NotFound {
                    Ok(false)
                } else {
                    Err(SyncError::io(path, err))
                }
            }
        }
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let mut file = self.sftp().open(path).map_err(|e| sftp_error(path, e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| SyncError::io(path, e))?;
        Ok(buf)
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.ensure_parent(path)?;
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = self.sftp().create(&tmp).map_err(|e| sftp_error(&tmp, e))?;
        file.write_all(data).map_err(|e| SyncError::io(&tmp, e))?;
        if let Err(e) = file.fsync() {
            tracing::debug!(path = %tmp.display(), error = %e, "sftp fsync unsupported");
        }
        drop(file);
        self.rename(&tmp, path)
    }

    fn open(&self, path: &Path, label: &str) -> Result<ContentStream> {
        let size = self
            .sftp()
            .stat(path)
            .map_err(|e| sftp_error(path, e))?
            .size
            .unwrap_or(0);
        let file = self.sftp().open(path).map_err(|e| sftp_error(path, e))?;
        Ok(ContentStream::from_reader(label, size, Box::new(file)))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.ensure_parent(to)?;
        self.sftp()
            .rename(
                from,
                to,
                Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE),
            )
            .map_err(|e| sftp_error(to, e))
    }

    fn remove_file(&self, path: &Path) -> Result<bool> {
        match self.sftp().unlink(path) {
            Ok(()) => Ok(true),
            Err(e) => {
                let err = io::Error::from(e);
                if err.kind() == io::ErrorKind::NotFound {
                    Ok(false)
                } else {
                    Err(SyncError::io(path, err))
                }
            }
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        if self.exists(path)? {
            return Ok(());
        }
        self.ensure_parent(path)?;
        match self.sftp().mkdir(path, 0o755) {
            Ok(()) => Ok(()),
            // Lost a race with another creator.
            Err(_) if self.exists(path)? => Ok(()),
            Err(e) => Err(sftp_error(path, e)),
        }
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        if !self.exists(path)? {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = self
            .sftp()
            .readdir(path)
            .map_err(|e| sftp_error(path, e))?
            .into_iter()
            .filter_map(|(entry, _)| {
                entry
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.conn
            .exec_checked(&format!("rm -rf -- {}", shell_quote(&path)))
    }

    fn symlink(&self, target: &str, path: &Path) -> Result<()> {
        self.ensure_parent(path)?;
        let path = path.to_string_lossy();
        self.conn.exec_checked(&format!(
            "ln -sfn -- {} {}",
            shell_quote(target),
            shell_quote(&path)
        ))
    }

    fn set_mtime(&self, path: &Path, mtime: i64) -> Result<()> {
        let secs = mtime.max(0) as u64;
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: None,
            atime: Some(secs),
            mtime: Some(secs),
        };
        self.sftp()
            .setstat(path, stat)
            .map_err(|e| sftp_error(path, e))
    }
}

/// Uploads go through SFTP into the remote staging directory; downloads
/// land in the local staging directory.
pub struct SftpTransport {
    conn: Arc<SshConnection>,
    session: Mutex<Option<TransferSession>>,
}

impl SftpTransport {
    pub fn new(conn: Arc<SshConnection>) -> Self {
        Self {
            conn,
            session: Mutex::new(None),
        }
    }

    fn session(&self) -> Result<TransferSession> {
        self.session
            .lock()
            .map_err(|_| SyncError::Transfer {
                path: String::new(),
                message: "transport session lock poisoned".into(),
            })?
            .clone()
            .ok_or_else(|| SyncError::Transfer {
                path: String::new(),
                message: "no transfer session in progress".into(),
            })
    }

    fn upload(&self, path: &Path, stream: ContentStream) -> Result<TransferHandle> {
        let label = stream.label().to_string();
        let expected_size = stream.total_size();
        let expected_digest = stream.expected_digest().cloned();

        let file = self
            .conn
            .sftp
            .create(path)
            .map_err(|e| sftp_error(path, e))?;
        let mut writer = DigestWriter::new(file);
        for chunk in stream {
            let chunk = chunk.map_err(|e| SyncError::Transfer {
                path: label.clone(),
                message: e.to_string(),
            })?;
            writer
                .write_all(&chunk)
                .map_err(|e| network_error(&format!("upload {label}"), e))?;
        }
        let (mut file, digest, size) = writer.finish();
        if let Err(e) = file.fsync() {
            tracing::debug!(path = %label, error = %e, "sftp fsync unsupported");
        }
        drop(file);

        let handle = TransferHandle {
            path: path.to_path_buf(),
            size,
            digest,
        };
        verify_transfer(&label, expected_size, expected_digest.as_ref(), &handle)?;
        Ok(handle)
    }
}

impl Transport for SftpTransport {
    fn begin_session(&self, session: TransferSession) -> Result<()> {
        tracing::debug!(
            transaction_id = %session.transaction_id,
            target = %self.conn.target(),
            "SFTP transfer session started"
        );
        let mut guard = self.session.lock().map_err(|_| SyncError::Transfer {
            path: String::new(),
            message: "transport session lock poisoned".into(),
        })?;
        *guard = Some(session);
        Ok(())
    }

    fn end_session(&self) -> Result<()> {
        if let Ok(mut guard) = self.session.lock() {
            guard.take();
        }
        Ok(())
    }

    fn transfer_to_remote(&self, stream: ContentStream) -> Result<TransferHandle> {
        let session = self.session()?;
        let path = session.remote_tmp.join(session.temp_name());
        let result = self.upload(&path, stream);
        if result.is_err() {
            let _ = self.conn.sftp.unlink(&path);
        }
        result
    }

    fn transfer_to_local(&self, stream: ContentStream) -> Result<TransferHandle> {
        let session = self.session()?;
        write_stream_to(&session.local_tmp, &session.temp_name(), stream)
    }
}
