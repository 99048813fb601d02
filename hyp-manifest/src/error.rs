//! Error types for manifest and metadata operations

use thiserror::Error;

/// Error types for metadata-service and manifest operations
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON decoding failed
    #[error("JSON decoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid URL
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The metadata service returned a non-zero retcode
    #[error("metadata service error {retcode}: {message}")]
    Api {
        /// Service retcode
        retcode: i64,
        /// Service message
        message: String,
    },

    /// The envelope carried no payload for a success retcode
    #[error("metadata service returned empty payload for {endpoint}")]
    MissingData {
        /// Endpoint that produced the empty envelope
        endpoint: String,
    },

    /// A downloaded index file failed its checksum
    #[error("index {id} checksum mismatch: expected {expected}, got {actual}")]
    IndexChecksum {
        /// Index file id
        id: String,
        /// Declared checksum
        expected: String,
        /// Computed checksum
        actual: String,
    },

    /// A manifest violated a structural invariant
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
}

/// Result type for manifest operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an API error from a service envelope
    pub fn api(retcode: i64, message: impl Into<String>) -> Self {
        Self::Api {
            retcode,
            message: message.into(),
        }
    }

    /// Create a missing-data error
    pub fn missing_data(endpoint: impl Into<String>) -> Self {
        Self::MissingData {
            endpoint: endpoint.into(),
        }
    }

    /// Create an invalid-manifest error
    pub fn invalid_manifest(reason: impl Into<String>) -> Self {
        Self::InvalidManifest(reason.into())
    }
}
