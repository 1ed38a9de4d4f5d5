//! Shared error types for memlift.

use thiserror::Error;

/// Top-level error type for memlift.
#[derive(Error, Debug)]
pub enum MemliftError {
    /// A read from a memory service failed for a transient reason
    /// (network, timeout, rate limit, 5xx). Retryable.
    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    /// A write to a memory service failed for a transient reason. Retryable.
    #[error("Transient write error: {0}")]
    TransientWrite(String),

    /// The referenced agent does not exist on the service.
    #[error("Agent not found: {0}")]
    NotFound(String),

    /// A snapshot file failed framing, digest or checksum validation.
    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// The snapshot was written by a newer format than this reader knows.
    #[error("Unsupported snapshot format version {found} (this build reads up to {supported})")]
    UnsupportedVersion {
        /// Version found in the file header.
        found: u32,
        /// Highest version this reader understands.
        supported: u32,
    },

    /// The snapshot carries sections marked incomplete and cannot be imported.
    #[error("Snapshot is incomplete: sections {0} were not fully exported")]
    IncompleteSnapshot(String),

    /// The service rejected a request and retrying will not help.
    #[error("Service rejected request ({status}): {message}")]
    Remote {
        /// HTTP status code returned by the service.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Pagination returned a different number of records than the service
    /// reported for the section.
    #[error("Truncated pagination in {section}: {fetched} of {reported} reported records fetched")]
    TruncatedPagination {
        /// Section whose stream came up short.
        section: String,
        /// Total the service reported.
        reported: u64,
        /// Records actually returned.
        fetched: u64,
    },

    /// The service answered with a payload we could not decode.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The run was interrupted before it finished.
    #[error("Interrupted")]
    Interrupted,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON serialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MemliftError {
    /// Whether the failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFetch(_) | Self::TransientWrite(_))
    }

    /// Whether this error means the snapshot file itself cannot be trusted.
    pub fn is_snapshot_error(&self) -> bool {
        matches!(
            self,
            Self::CorruptSnapshot(_) | Self::UnsupportedVersion { .. } | Self::IncompleteSnapshot(_)
        )
    }
}

/// Alias for Result with MemliftError.
pub type MemliftResult<T> = Result<T, MemliftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(MemliftError::TransientFetch("503".into()).is_retryable());
        assert!(MemliftError::TransientWrite("timeout".into()).is_retryable());
        assert!(!MemliftError::NotFound("agent-1".into()).is_retryable());
        assert!(!MemliftError::Remote {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!MemliftError::CorruptSnapshot("digest".into()).is_retryable());
        assert!(!MemliftError::TruncatedPagination {
            section: "archival_records".into(),
            reported: 150,
            fetched: 100,
        }
        .is_retryable());
    }

    #[test]
    fn test_unsupported_version_message() {
        let err = MemliftError::UnsupportedVersion {
            found: 7,
            supported: 1,
        };
        assert!(err.to_string().contains("version 7"));
        assert!(err.is_snapshot_error());
    }
}
