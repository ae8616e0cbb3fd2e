//! Transport for remotes reachable through the local filesystem
//! (plain directories, locally mounted ZFS datasets).

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use super::{verify_transfer, ContentStream, TransferHandle, TransferSession, Transport};
use crate::manifest::DigestWriter;
use crate::utils::errors::{Result, SyncError};

#[derive(Debug, Default)]
pub struct LocalTransport {
    session: Mutex<Option<TransferSession>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
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
}

/// Write `stream` into a new file `dir/name`, hashing as it goes.
///
/// The file is fsynced and verified against the stream's size and digest;
/// on any failure it is removed again.
pub fn write_stream_to(dir: &Path, name: &str, stream: ContentStream) -> Result<TransferHandle> {
    fs::create_dir_all(dir).map_err(|e| SyncError::io(dir, e))?;
    let path = dir.join(name);
    let label = stream.label().to_string();
    let expected_size = stream.total_size();
    let expected_digest = stream.expected_digest().cloned();

    let result = (|| -> Result<TransferHandle> {
        let file = File::create(&path).map_err(|e| SyncError::io(&path, e))?;
        let mut writer = DigestWriter::new(file);
        for chunk in stream {
            let chunk = chunk.map_err(|e| SyncError::Transfer {
                path: label.clone(),
                message: e.to_string(),
            })?;
            writer.write_all(&chunk).map_err(|e| SyncError::io(&path, e))?;
        }
        let (file, digest, size) = writer.finish();
        file.sync_all().map_err(|e| SyncError::io(&path, e))?;

        let handle = TransferHandle {
            path: path.clone(),
            size,
            digest,
        };
        verify_transfer(&label, expected_size, expected_digest.as_ref(), &handle)?;
        Ok(handle)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&path);
    }
    result
}

impl Transport for LocalTransport {
    fn begin_session(&self, session: TransferSession) -> Result<()> {
        tracing::debug!(transaction_id = %session.transaction_id, "Transfer session started");
        let mut guard = self.session.lock().map_err(|_| SyncError::Transfer {
            path: String::new(),
            message: "transport session lock poisoned".into(),
        })?;
        *guard = Some(session);
        Ok(())
    }

    fn end_session(&self) -> Result<()> {
        if let Ok(mut guard) = self.session.lock() {
            if let Some(session) = guard.take() {
                tracing::debug!(transaction_id = %session.transaction_id, "Transfer session ended");
            }
        }
        Ok(())
    }

    fn transfer_to_remote(&self, stream: ContentStream) -> Result<TransferHandle> {
        let session = self.session()?;
        write_stream_to(&session.remote_tmp, &session.temp_name(), stream)
    }

    fn transfer_to_local(&self, stream: ContentStream) -> Result<TransferHandle> {
        let session = self.session()?;
        write_stream_to(&session.local_tmp, &session.temp_name(), stream)
    }
}
