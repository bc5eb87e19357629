//! Single-pass MD5 + SHA-256 digests over backup streams and files.

use std::path::Path;

use md5::{Digest as Md5Digest, Md5};
use sha2::{Digest as Sha256Digest, Sha256};

use crate::error::{ServiceError, ServiceResult};

/// Computes MD5 and SHA-256 over a byte stream in a single pass.
///
/// Feed chunks with [`ChecksumTee::update`] while they travel through the
/// pipeline, then call [`ChecksumTee::finalize`] for both hex digests.
pub struct ChecksumTee {
    md5: Md5,
    sha256: Sha256,
}

impl ChecksumTee {
    pub fn new() -> Self {
        Self {
            md5: Md5::new(),
            sha256: Sha256::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.md5.update(chunk);
        self.sha256.update(chunk);
    }

    /// Returns `(md5_hex, sha256_hex)`.
    pub fn finalize(self) -> (String, String) {
        (
            hex::encode(self.md5.finalize()),
            hex::encode(self.sha256.finalize()),
        )
    }
}

impl Default for ChecksumTee {
    fn default() -> Self {
        Self::new()
    }
}

/// Calculates both digests for a file on disk in one read.
pub fn file_checksums(path: &Path) -> ServiceResult<(String, String)> {
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
    let mut tee = ChecksumTee::new();
    tee.update(&bytes);
    Ok(tee.finalize())
}

/// Verifies a file against an expected SHA-256 hex digest.
pub fn verify_file_checksum(path: &Path, expected_sha256: &str) -> ServiceResult<()> {
    if expected_sha256.is_empty() {
        return Err(ServiceError::Validation {
            message: "expected checksum is empty".to_string(),
        });
    }

    let (_, actual) = file_checksums(path)?;
    if actual != expected_sha256 {
        return Err(ServiceError::ChecksumMismatch {
            expected: expected_sha256.to_string(),
            actual,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn known_digests() {
        let mut tee = ChecksumTee::new();
        tee.update(b"hello world");
        let (md5, sha256) = tee.finalize();
        assert_eq!(md5, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(
            sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn chunked_updates_match_single_pass() {
        let mut chunked = ChecksumTee::new();
        chunked.update(b"hello ");
        chunked.update(b"world");

        let mut whole = ChecksumTee::new();
        whole.update(b"hello world");

        assert_eq!(chunked.finalize(), whole.finalize());
    }

    #[test]
    fn file_verification_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"dump body").unwrap();
        file.flush().unwrap();

        let (_, sha256) = file_checksums(file.path()).unwrap();
        verify_file_checksum(file.path(), &sha256).unwrap();

        let err = verify_file_checksum(file.path(), "deadbeef").unwrap_err();
        assert!(matches!(err, ServiceError::ChecksumMismatch { .. }));
    }

    #[test]
    fn empty_expectation_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(verify_file_checksum(file.path(), "").is_err());
    }
}
