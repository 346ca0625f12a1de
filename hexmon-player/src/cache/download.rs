//! Media download plumbing for the content cache
//!
//! Downloads stream to a `.part` file while hashing, then rename into
//! place; a crash mid-download never leaves a half-written entry behind.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use hexmon_common::Error as PlayerError;

/// Download failure, cloneable so every waiter on a shared single-flight
/// future observes the same outcome
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    /// 401/403 on the signed URL: the snapshot must be refetched for
    /// fresh URLs
    #[error("signed URL rejected (status {status})")]
    UrlExpired { status: u16 },

    #[error("media not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("integrity mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("cache full: need {needed} bytes, capacity {max_bytes} bytes")]
    CacheFull { needed: u64, max_bytes: u64 },

    #[error("{0}")]
    Other(String),
}

impl DownloadError {
    pub fn into_player_error(self, media_id: &str) -> PlayerError {
        match self {
            DownloadError::UrlExpired { status } => PlayerError::UrlExpired { status },
            DownloadError::NotFound(detail) => PlayerError::NotFound(detail),
            DownloadError::Network(detail) => PlayerError::Network(detail),
            DownloadError::Integrity { expected, actual } => PlayerError::IntegrityMismatch {
                media_id: media_id.to_string(),
                expected,
                actual,
            },
            DownloadError::CacheFull { needed, max_bytes } => {
                PlayerError::CacheFull { needed, max_bytes }
            }
            DownloadError::Other(detail) => PlayerError::Internal(detail),
        }
    }

    pub fn classify_status(status: u16, url: &str) -> Self {
        match status {
            401 | 403 => DownloadError::UrlExpired { status },
            404 => DownloadError::NotFound(url.to_string()),
            _ => DownloadError::Network(format!("HTTP {status} fetching {url}")),
        }
    }
}

/// Completed download before registration
pub struct DownloadedFile {
    pub part_path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Stream the response body to `part_path`, hashing as it goes.
///
/// The caller decides what to do with the `.part` file (rename into place,
/// quarantine, or delete).
pub async fn stream_to_part(
    mut response: reqwest::Response,
    part_path: &Path,
) -> Result<DownloadedFile, DownloadError> {
    let mut file = tokio::fs::File::create(part_path)
        .await
        .map_err(|e| DownloadError::Other(format!("cannot create {}: {e}", part_path.display())))?;

    let mut hasher = Sha256::new();
    let mut size: u64 = 0;
    loop {
        let chunk = response
            .chunk()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;
        let Some(chunk) = chunk else { break };
        hasher.update(&chunk);
        size += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::Other(format!("write failed: {e}")))?;
    }
    file.flush()
        .await
        .map_err(|e| DownloadError::Other(format!("flush failed: {e}")))?;

    Ok(DownloadedFile {
        part_path: part_path.to_path_buf(),
        size,
        sha256: hex::encode(hasher.finalize()),
    })
}

/// Map a media id to a safe cache file stem.
///
/// Anything outside `[A-Za-z0-9._-]` becomes `_` so a hostile id can never
/// escape the cache directory.
pub fn sanitize_media_id(media_id: &str) -> String {
    media_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Recover the media file extension from a URL path, falling back to `bin`
pub fn extension_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let candidate = path.rsplit('.').next().unwrap_or("");
    if !candidate.is_empty()
        && candidate.len() <= 5
        && candidate.chars().all(|c| c.is_ascii_alphanumeric())
        && path.contains('.')
    {
        candidate.to_ascii_lowercase()
    } else {
        "bin".to_string()
    }
}
