//! Error types for extraction and patching

use std::path::PathBuf;

use thiserror::Error;

/// Error types for archive and patch operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Zip archive error
    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// 7-zip archive error
    #[error("7z archive error: {0}")]
    SevenZ(#[from] sevenz_rust2::Error),

    /// JSON decoding failed (hdiff list entries)
    #[error("JSON decoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Archive entry path escapes the target directory
    #[error("unsafe archive entry path: {name}")]
    UnsafePath {
        /// Offending entry name
        name: String,
    },

    /// The external patch tool was not found
    #[error("patch tool not found: {program}")]
    ToolNotFound {
        /// Configured tool path
        program: PathBuf,
    },

    /// The external patch tool exited with a failure
    #[error("patch tool failed on {target} (exit code {code:?})")]
    ToolFailed {
        /// File being patched
        target: String,
        /// Process exit code, if any
        code: Option<i32>,
    },

    /// A patch entry's source file is missing
    #[error("patch source file missing: {path}")]
    SourceMissing {
        /// Expected source path
        path: PathBuf,
    },
}

/// Result type for archive and patch operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an unsafe-path error
    pub fn unsafe_path(name: impl Into<String>) -> Self {
        Self::UnsafePath { name: name.into() }
    }
}
