//! Download engine for the game install pipeline
//!
//! Executes normalized [`DownloadTask`] lists with bounded concurrency,
//! HTTP-range resume into `_tmp` files, a shared reconfigurable
//! [`RateLimiter`], cooperative cancellation, and hard-link shortcuts
//! against sibling installs. The [`Verifier`] re-hashes every artifact
//! and promotes verified temp files; the [`ChunkAssembler`] builds
//! chunk-protocol files out of content-addressed compressed chunks with
//! local-slice and cache reuse.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hyp_download::{DownloadTask, Downloader, RateLimiter, TransferProgress};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = Arc::new(RateLimiter::new(4 * 1024 * 1024));
//! let downloader = Downloader::new(Arc::clone(&limiter))?;
//! let progress = Arc::new(TransferProgress::new());
//! let tasks = vec![DownloadTask::new(
//!     "game.zip",
//!     "https://cdn.example.com/game.zip",
//!     1_000_000,
//!     "d41d8cd98f00b204e9800998ecf8427e",
//! )];
//! downloader
//!     .download_all(
//!         std::path::Path::new("/games/title"),
//!         &tasks,
//!         &progress,
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod chunk;
mod engine;
mod error;
mod limiter;
mod progress;
mod task;
mod verify;

pub use chunk::{ChunkAssembler, ChunkFilePlan, ChunkSpec, SliceReuse};
pub use engine::Downloader;
pub use error::{Error, Result, TaskFailure};
pub use limiter::RateLimiter;
pub use progress::{ProgressSnapshot, TransferProgress};
pub use task::{DownloadTask, TaskUrl};
pub use verify::{check_file_md5, hash_file_md5, Verifier};
