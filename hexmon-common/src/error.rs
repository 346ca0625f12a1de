//! Error types shared across the signage player
//!
//! One taxonomy covers the whole runtime so that components can branch on
//! failure class (transport vs. authorization vs. integrity) without
//! re-inspecting HTTP statuses or error strings.

use thiserror::Error;

/// Common result type for player operations
pub type Result<T> = std::result::Result<T, Error>;

/// Player error taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure (DNS, connect, timeout, 5xx)
    #[error("Network error: {0}")]
    Network(String),

    /// Authorization failure (401/403) on an API endpoint
    #[error("Authorization failed (status {status})")]
    Auth { status: u16 },

    /// Authorization failure (401/403) on a signed media URL
    ///
    /// Raised separately from [`Error::Auth`] because the snapshot manager
    /// reacts by refetching the snapshot for fresh signed URLs.
    #[error("Signed URL expired (status {status})")]
    UrlExpired { status: u16 },

    /// Resource does not exist (404): unknown pairing code, unpublished
    /// snapshot, deleted media object
    #[error("Not found: {0}")]
    NotFound(String),

    /// Downloaded bytes do not hash to the expected digest
    #[error("Integrity mismatch for {media_id}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        media_id: String,
        expected: String,
        actual: String,
    },

    /// Malformed backend payload or persisted document
    #[error("Parse error: {0}")]
    Parse(String),

    /// Required bytes exceed cache capacity even after eviction
    #[error("Cache full: need {needed} bytes, capacity {max_bytes} bytes")]
    CacheFull { needed: u64, max_bytes: u64 },

    /// Playback error budget exhausted
    #[error("Playback error: {0}")]
    Playback(String),

    /// Configuration validation failure (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Keypair, CSR or certificate handling failure
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// File I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify an HTTP response status for an API endpoint.
    ///
    /// `2xx` is not an error and must be handled by the caller before
    /// classification.
    pub fn from_api_status(status: u16, detail: &str) -> Self {
        match status {
            401 | 403 => Error::Auth { status },
            404 => Error::NotFound(detail.to_string()),
            _ => Error::Network(format!("HTTP {status}: {detail}")),
        }
    }

    /// Classify an HTTP response status for a signed media URL download.
    pub fn from_media_status(status: u16, detail: &str) -> Self {
        match status {
            401 | 403 => Error::UrlExpired { status },
            404 => Error::NotFound(detail.to_string()),
            _ => Error::Network(format!("HTTP {status}: {detail}")),
        }
    }

    /// True for errors that indicate the backend rejected our credentials
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth { .. } | Error::UrlExpired { .. })
    }

    /// True when retrying the same request later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_status_classification() {
        assert!(matches!(
            Error::from_api_status(401, "x"),
            Error::Auth { status: 401 }
        ));
        assert!(matches!(
            Error::from_api_status(403, "x"),
            Error::Auth { status: 403 }
        ));
        assert!(matches!(Error::from_api_status(404, "x"), Error::NotFound(_)));
        assert!(matches!(Error::from_api_status(500, "x"), Error::Network(_)));
    }

    #[test]
    fn test_media_status_classification() {
        // 401/403 on a signed URL is a URL expiry, not a device auth failure
        assert!(matches!(
            Error::from_media_status(403, "x"),
            Error::UrlExpired { status: 403 }
        ));
        assert!(matches!(
            Error::from_media_status(404, "x"),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_transient_flags() {
        assert!(Error::Network("connect refused".into()).is_transient());
        assert!(!Error::NotFound("gone".into()).is_transient());
        assert!(Error::Auth { status: 401 }.is_auth());
        assert!(Error::UrlExpired { status: 403 }.is_auth());
    }
}
