//! Content digests in the `sha256:<hex>` form used by image manifests.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};

pub const SHA256_PREFIX: &str = "sha256:";

/// Digest of an in-memory blob.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("{}{:x}", SHA256_PREFIX, Sha256::digest(bytes))
}

/// Hex portion of a `sha256:` digest, validated.
pub fn digest_hex(digest: &str) -> StevedoreResult<&str> {
    let hex = digest.strip_prefix(SHA256_PREFIX).ok_or_else(|| {
        StevedoreError::InvalidArgument(format!(
            "Invalid digest format {:?}, expected sha256:<hex>",
            digest
        ))
    })?;
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StevedoreError::InvalidArgument(format!(
            "Invalid sha256 digest {:?}",
            digest
        )));
    }
    Ok(hex)
}

/// Incremental sha256 with a running byte count.
#[derive(Clone, Default)]
pub struct Digester {
    hasher: Sha256,
    size: u64,
}

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.size += data.len() as u64;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Finish and return (`sha256:<hex>`, size).
    pub fn finish(self) -> (String, u64) {
        (
            format!("{}{:x}", SHA256_PREFIX, self.hasher.finalize()),
            self.size,
        )
    }
}

/// Writer adapter that digests everything written through it.
pub struct DigestingWriter<W: Write> {
    inner: W,
    digester: Digester,
}

impl<W: Write> DigestingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            digester: Digester::new(),
        }
    }

    pub fn into_parts(self) -> (W, Digester) {
        (self.inner, self.digester)
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for DigestingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader adapter that digests everything read through it.
pub struct DigestingReader<R: Read> {
    inner: R,
    digester: Digester,
}

impl<R: Read> DigestingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digester: Digester::new(),
        }
    }

    pub fn finish(self) -> (String, u64) {
        self.digester.finish()
    }
}

impl<R: Read> Read for DigestingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }
}

/// Digest a file on disk, returning (`sha256:<hex>`, size).
pub fn digest_file(path: &Path) -> StevedoreResult<(String, u64)> {
    let file = File::open(path).map_err(|e| {
        StevedoreError::Storage(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let mut reader = DigestingReader::new(file);
    io::copy(&mut reader, &mut io::sink()).map_err(|e| {
        StevedoreError::Storage(format!("Failed to read {}: {}", path.display(), e))
    })?;
    Ok(reader.finish())
}

/// Check that a file matches an expected digest.
pub fn verify_file(path: &Path, expected: &str) -> StevedoreResult<bool> {
    let (actual, _) = digest_file(path)?;
    Ok(actual == expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_sha256_digest_empty() {
        assert_eq!(sha256_digest(b""), EMPTY_SHA256);
    }

    #[test]
    fn test_digest_hex_validation() {
        assert!(digest_hex(EMPTY_SHA256).is_ok());
        assert!(digest_hex("md5:abcd").is_err());
        assert!(digest_hex("sha256:xyz").is_err());
    }

    #[test]
    fn test_digesting_writer_matches_direct_digest() {
        let mut writer = DigestingWriter::new(Vec::new());
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (buf, digester) = writer.into_parts();
        let (digest, size) = digester.finish();
        assert_eq!(buf, b"hello world");
        assert_eq!(size, 11);
        assert_eq!(digest, sha256_digest(b"hello world"));
    }

    #[test]
    fn test_digest_file_and_verify() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"layer bytes").unwrap();
        let (digest, size) = digest_file(&path).unwrap();
        assert_eq!(size, 11);
        assert!(verify_file(&path, &digest).unwrap());
        assert!(!verify_file(&path, EMPTY_SHA256).unwrap());
    }
}
