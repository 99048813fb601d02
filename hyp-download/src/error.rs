//! Error types for download and verification

use thiserror::Error;

/// Failure of one task inside an aggregate phase error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Relative file name of the failed task
    pub file_name: String,
    /// Human-readable failure reason
    pub reason: String,
}

/// Error types for download operations
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Server answered with an unexpected status
    #[error("unexpected status {status} for {url}")]
    Status {
        /// Requested URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The operation was cancelled cooperatively
    #[error("operation cancelled")]
    Cancelled,

    /// One or more tasks failed after all tasks settled
    #[error("{} download task(s) failed", failures.len())]
    TasksFailed {
        /// Per-task failures, in completion order
        failures: Vec<TaskFailure>,
    },

    /// Aggregate checksum failure raised after every task was checked
    #[error("{} file(s) failed checksum verification", files.len())]
    ChecksumMismatch {
        /// Relative names of the offending files
        files: Vec<String>,
    },

    /// A single file's content did not match its declared checksum
    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    FileChecksum {
        /// Relative file name
        file: String,
        /// Declared checksum
        expected: String,
        /// Computed checksum
        actual: String,
    },
}

/// Result type for download operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a status error
    pub fn status(url: impl Into<String>, status: u16) -> Self {
        Self::Status {
            url: url.into(),
            status,
        }
    }

    /// Create a single-file checksum error
    pub fn file_checksum(
        file: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::FileChecksum {
            file: file.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether this error is the cooperative-cancellation marker
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
