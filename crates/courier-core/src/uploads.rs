//! Pure upload bookkeeping: part counts and batch status derivation.

use crate::defaults::UPLOAD_CHUNK_SIZE_BYTES;
use crate::error::{Error, Result};
use crate::models::{UploadBatchStatus, UploadFileStatus};

/// Number of chunks needed to carry `total_size_bytes`.
///
/// `chunk_size_bytes` defaults to 5 MiB. An empty file needs zero parts.
pub fn total_parts(total_size_bytes: i64, chunk_size_bytes: Option<i64>) -> Result<i32> {
    let chunk = chunk_size_bytes.unwrap_or(UPLOAD_CHUNK_SIZE_BYTES);
    if chunk <= 0 {
        return Err(Error::InvalidInput(format!(
            "chunk size must be positive, got {}",
            chunk
        )));
    }
    if total_size_bytes < 0 {
        return Err(Error::InvalidInput(format!(
            "total size must not be negative, got {}",
            total_size_bytes
        )));
    }

    let parts = total_size_bytes / chunk + i64::from(total_size_bytes % chunk != 0);
    i32::try_from(parts)
        .map_err(|_| Error::InvalidInput(format!("upload needs too many parts: {}", parts)))
}

/// Derive a batch status from the statuses of its files.
///
/// Zero files or all failures is `Failed`; all stored or processed is
/// `Complete`; anything else is `Partial`.
pub fn derive_batch_status(files: &[UploadFileStatus]) -> UploadBatchStatus {
    if files.is_empty() {
        return UploadBatchStatus::Failed;
    }

    let succeeded = files.iter().filter(|s| s.is_success()).count();
    let failed = files
        .iter()
        .filter(|s| **s == UploadFileStatus::Failed)
        .count();

    if failed == files.len() {
        UploadBatchStatus::Failed
    } else if succeeded == files.len() {
        UploadBatchStatus::Complete
    } else {
        UploadBatchStatus::Partial
    }
}

/// Whether `sha256` is a 64-character hex digest.
pub fn is_sha256_hex(sha256: &str) -> bool {
    sha256.len() == 64 && sha256.bytes().all(|b| b.is_ascii_hexdigit())
}
