//! Moving bytes between the working copy and the remote store.
//!
//! A [`Transport`] turns a [`ContentStream`] into a temp file on the
//! destination side. Temp files carry the transaction's pending suffix so
//! crash recovery can find them.

pub mod local;
pub mod progress;

use bytes::Bytes;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::manifest::Digest;
use crate::utils::errors::{Result, SyncError};

pub use local::LocalTransport;
pub use progress::{format_bytes, SyncProgress};

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Lazy, finite sequence of byte chunks with a size known up front.
pub struct ContentStream {
    label: String,
    total_size: u64,
    reader: Box<dyn Read + Send>,
    chunk_size: usize,
    expected_digest: Option<Digest>,
}

impl ContentStream {
    pub fn from_reader(
        label: impl Into<String>,
        total_size: u64,
        reader: Box<dyn Read + Send>,
    ) -> Self {
        Self {
            label: label.into(),
            total_size,
            reader,
            chunk_size: DEFAULT_CHUNK_SIZE,
            expected_digest: None,
        }
    }

    /// Stream a local file; the size is taken from its metadata.
    pub fn from_file(path: &Path, label: impl Into<String>) -> Result<Self> {
        let file = File::open(path).map_err(|e| SyncError::io(path, e))?;
        let size = file.metadata().map_err(|e| SyncError::io(path, e))?.len();
        Ok(Self::from_reader(label, size, Box::new(file)))
    }

    pub fn from_bytes(label: impl Into<String>, data: Bytes) -> Self {
        let size = data.len() as u64;
        Self::from_reader(label, size, Box::new(io::Cursor::new(data)))
    }

    /// Fail the transfer with an integrity error unless the content hashes to `digest`.
    pub fn expect_digest(mut self, digest: Option<Digest>) -> Self {
        self.expected_digest = digest;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn expected_digest(&self) -> Option<&Digest> {
        self.expected_digest.as_ref()
    }
}

impl Iterator for ContentStream {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buffer = vec![0u8; self.chunk_size];
        loop {
            return match self.reader.read(&mut buffer) {
                Ok(0) => None,
                Ok(n) => {
                    buffer.truncate(n);
                    Some(Ok(Bytes::from(buffer)))
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Some(Err(e)),
            };
        }
    }
}

/// A completed transfer: a temp file on the destination side.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    pub path: PathBuf,
    pub size: u64,
    pub digest: Digest,
}

/// Where a transaction's temp files go on each side.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub transaction_id: String,
    pub local_tmp: PathBuf,
    pub remote_tmp: PathBuf,
}

impl TransferSession {
    pub fn temp_name(&self) -> String {
        format!(
            "{}.pending-{}",
            uuid::Uuid::new_v4().simple(),
            self.transaction_id
        )
    }
}

pub trait Transport: Send + Sync {
    fn begin_session(&self, session: TransferSession) -> Result<()>;

    fn end_session(&self) -> Result<()>;

    fn transfer_to_remote(&self, stream: ContentStream) -> Result<TransferHandle>;

    fn transfer_to_local(&self, stream: ContentStream) -> Result<TransferHandle>;
}

/// Check a finished transfer against the stream's promises.
pub fn verify_transfer(
    label: &str,
    expected_size: u64,
    expected_digest: Option<&Digest>,
    handle: &TransferHandle,
) -> Result<()> {
    if handle.size != expected_size {
        return Err(SyncError::Transfer {
            path: label.to_string(),
            message: format!("expected {expected_size} bytes, received {}", handle.size),
        });
    }
    if let Some(expected) = expected_digest {
        if *expected != handle.digest {
            return Err(SyncError::Integrity {
                path: label.to_string(),
                expected: expected.to_string(),
                actual: handle.digest.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_yields_chunks_until_exhausted() {
        let stream = ContentStream::from_bytes("a", Bytes::from_static(b"abcdefg")).with_chunk_size(3);
        assert_eq!(stream.total_size(), 7);
        let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect();
        assert_eq!(chunks, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def"), Bytes::from_static(b"g")]);
    }

    #[test]
    fn verification_distinguishes_size_and_digest() {
        let handle = TransferHandle {
            path: PathBuf::from("/tmp/x"),
            size: 5,
            digest: Digest::of_bytes(b"hello"),
        };
        verify_transfer("a", 5, Some(&Digest::of_bytes(b"hello")), &handle).unwrap();

        let err = verify_transfer("a", 6, None, &handle).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Transfer);

        let err = verify_transfer("a", 5, Some(&Digest::of_bytes(b"world")), &handle).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Integrity);
    }
}
