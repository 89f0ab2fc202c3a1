// keg-aio/src/checksum.rs
use std::path::Path;

use keg_common::error::{KegError, Result};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn compare(subject: &str, actual: &str, expected: &str) -> Result<()> {
    debug!("Calculated SHA256: {}", actual);
    debug!("Expected SHA256:   {}", expected);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(KegError::Integrity(format!(
            "Checksum mismatch for {subject}: expected {expected}, got {actual}"
        )))
    }
}

/// Verifies an in-memory byte stream.
pub fn verify_bytes(bytes: &[u8], expected: &str) -> Result<()> {
    compare("in-memory data", &sha256_hex(bytes), expected)
}

/// Reads the file asynchronously but hashes synchronously.
pub async fn verify_checksum_async(path: &Path, expected: &str) -> Result<()> {
    debug!("Async Verifying checksum for: {}", path.display());
    let mut file = File::open(path).await?;

    let mut hasher = Sha256::new();
    let mut buffer = Vec::with_capacity(8192);
    let mut total_bytes_read = 0u64;
    loop {
        buffer.clear();
        match file.read_buf(&mut buffer).await? {
            0 => break,
            n => {
                hasher.update(&buffer[..n]);
                total_bytes_read += n as u64;
            }
        }
    }
    debug!("Async hashed {} bytes", total_bytes_read);
    compare(&path.display().to_string(), &hex::encode(hasher.finalize()), expected)
}

/// Verifies `path` and deletes it on mismatch so no unverified bytes are
/// left behind. Other errors leave the file alone.
pub async fn verify_or_discard(path: &Path, expected: &str) -> Result<()> {
    match verify_checksum_async(path, expected).await {
        Err(e) if e.is_integrity() => {
            warn!("Removing {} after failed verification", path.display());
            if let Err(remove_err) = tokio::fs::remove_file(path).await {
                warn!("Failed to remove {}: {}", path.display(), remove_err);
            }
            Err(e)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WRONG_SHA: &str = "7aeb2bb38ba0d0a4e5b1b5dc2b7b6ae5fa0cbc8e0b8e9b1a1a5b2dd17c4ee8e4";

    #[test]
    fn bytes_round_trip_case_insensitive() {
        let digest = sha256_hex(b"hello world");
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert!(verify_bytes(b"hello world", &digest.to_ascii_uppercase()).is_ok());
    }

    #[test]
    fn mismatch_is_integrity_error() {
        let err = verify_bytes(b"build\n", WRONG_SHA).unwrap_err();
        assert!(err.is_integrity());
        assert!(err.to_string().contains(WRONG_SHA));
    }

    #[tokio::test]
    async fn corrupted_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.tar.gz");
        std::fs::write(&path, b"original").unwrap();
        let good = sha256_hex(b"original");

        // Re-verifying is idempotent.
        verify_or_discard(&path, &good).await.unwrap();
        verify_or_discard(&path, &good).await.unwrap();
        assert!(verify_checksum_async(&path, &good).await.is_ok());

        std::fs::write(&path, b"0riginal").unwrap();
        let err = verify_or_discard(&path, &good).await.unwrap_err();
        assert!(err.is_integrity());
        assert!(!path.exists());
    }
}
