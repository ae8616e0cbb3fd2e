//! SHA-256 content digests.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

const READ_BUFFER: usize = 64 * 1024;

/// Lowercase hex digest.
///
/// Deserialization accepts any string so that manifests written by other
/// tools round-trip unchanged; digests produced here are always SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    pub(crate) fn from_hasher(hasher: Sha256) -> Self {
        Digest(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `n` characters, used for transaction ids.
    ///
    /// Counts characters rather than bytes; digests read from a manifest are
    /// not guaranteed to be hex.
    pub fn short(&self, n: usize) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(n)
            .map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl From<String> for Digest {
    fn from(value: String) -> Self {
        Digest(value)
    }
}

impl From<&str> for Digest {
    fn from(value: &str) -> Self {
        Digest(value.to_string())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash a file's content without loading it whole.
pub fn hash_file(path: &Path) -> io::Result<Digest> {
    let mut file = File::open(path)?;
    hash_reader(&mut file)
}

pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<Digest> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(Digest::from_hasher(hasher))
}

/// Writer adapter that hashes and counts everything passing through it.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes_written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Consume the writer, returning the inner writer, the digest and the byte count.
    pub fn finish(self) -> (W, Digest, u64) {
        (self.inner, Digest::from_hasher(self.hasher), self.bytes_written)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn digest_of_known_input() {
        assert_eq!(Digest::of_bytes(b"hello").as_str(), HELLO_SHA256);
    }

    #[test]
    fn file_and_writer_agree() -> io::Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(b"hello")?;
        file.flush()?;
        assert_eq!(hash_file(file.path())?.as_str(), HELLO_SHA256);

        let mut writer = DigestWriter::new(Vec::new());
        writer.write_all(b"hel")?;
        writer.write_all(b"lo")?;
        let (inner, digest, n) = writer.finish();
        assert_eq!(inner, b"hello");
        assert_eq!(n, 5);
        assert_eq!(digest.as_str(), HELLO_SHA256);
        Ok(())
    }

    #[test]
    fn short_prefix_is_bounded() {
        let d = Digest::from("abc");
        assert_eq!(d.short(16), "abc");
        assert_eq!(Digest::of_bytes(b"hello").short(4), "2cf2");
    }

    #[test]
    fn short_prefix_of_foreign_digest_stays_on_char_boundary() {
        let d: Digest = serde_json::from_str(r#""\u00e9\u00e9\u00e9""#).unwrap();
        assert_eq!(d.short(1), "\u{e9}");
        assert_eq!(d.short(2), "\u{e9}\u{e9}");
        assert_eq!(d.short(16), "\u{e9}\u{e9}\u{e9}");
    }
}
