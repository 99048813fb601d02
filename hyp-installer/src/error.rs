//! Error types for the install pipeline

use thiserror::Error;

/// Error types for install operations
#[derive(Error, Debug)]
pub enum Error {
    /// Manifest or metadata-service failure
    #[error(transparent)]
    Manifest(#[from] hyp_manifest::Error),

    /// Download or verification failure
    #[error(transparent)]
    Download(#[from] hyp_download::Error),

    /// Extraction or patch failure
    #[error(transparent)]
    Unpack(#[from] hyp_unpack::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Predownload requested but the service published none
    #[error("already the latest version, nothing to predownload")]
    AlreadyLatestVersion,

    /// Update or predownload requested without an installed build
    #[error("no installed build found at {install_path}")]
    NoLocalVersion {
        /// Install directory that carried no version marker
        install_path: String,
    },

    /// The request contradicts the remote or local state
    #[error("invalid install request: {0}")]
    InvalidRequest(String),

    /// One or more files failed binary-diff merging
    #[error("{} file(s) failed to merge", files.len())]
    MergeFailed {
        /// Relative names of the files whose merge failed
        files: Vec<String>,
    },

    /// The operation was cancelled cooperatively
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for install operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid-request error
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }

    /// Whether this error (or its source) is the cancellation marker
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
            || matches!(self, Self::Download(err) if err.is_cancelled())
    }
}
