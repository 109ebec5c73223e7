//! Content hashing for uploads and reconciliation

use crate::shared::error::{FilestoreError, FilestoreResult};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Checksum prefix accepted on uploads
const SHA256_PREFIX: &str = "sha256:";

/// Parse a caller-supplied checksum of the form `sha256:<hex>`.
pub fn parse_checksum(value: &str) -> FilestoreResult<String> {
    let hex_part = value
        .strip_prefix(SHA256_PREFIX)
        .ok_or_else(|| {
            FilestoreError::invalid_checksum(format!(
                "checksum must be of the form sha256:<hex>, got '{value}'"
            ))
        })?
        .to_ascii_lowercase();
    if hex_part.len() != 64 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(FilestoreError::invalid_checksum(
            "checksum digest must be 64 hex characters",
        ));
    }
    Ok(format!("{SHA256_PREFIX}{hex_part}"))
}

/// Streaming sha256 of a staged file, returned as `sha256:<hex>`.
pub async fn sha256_file(path: &Path) -> FilestoreResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{SHA256_PREFIX}{}", hex::encode(hasher.finalize())))
}

/// Streaming blake3 content hash of a staged file.
pub async fn blake3_file(path: &Path) -> FilestoreResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
