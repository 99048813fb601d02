//! Download engine
//!
//! Executes a normalized task list with bounded concurrency, per-file
//! resumable partial writes seeded by HTTP range requests, a shared
//! global rate limiter, and cooperative cancellation that stops within
//! one read-buffer iteration while leaving partial files resumable.
//!
//! A failing task never aborts its siblings: each failure is recorded and
//! the phase fails with the full list only after every task has settled.
//! Transient network errors are not retried here — resumable temp files
//! make a fresh run cheap.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    check_file_md5, DownloadTask, Error, RateLimiter, Result, TaskFailure, TransferProgress,
};

/// Default connection timeout
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Upper bound on concurrent transfers regardless of core count
const MAX_CONCURRENCY: usize = 16;

fn default_concurrency() -> usize {
    let cores = std::thread::available_parallelism().map_or(4, std::num::NonZero::get);
    (cores * 2).min(MAX_CONCURRENCY)
}

/// Download engine over a normalized task list
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    concurrency: usize,
}

impl Downloader {
    /// Create an engine sharing the given rate limiter
    pub fn new(limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .pool_max_idle_per_host(MAX_CONCURRENCY)
            .build()?;
        Ok(Self::with_client(client, limiter))
    }

    /// Create an engine with a custom HTTP client
    pub fn with_client(client: reqwest::Client, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            limiter,
            concurrency: default_concurrency(),
        }
    }

    /// Override the transfer concurrency bound
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// The shared rate limiter
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Execute every task, resuming partial files
    ///
    /// Seeds the progress counters with the stat-based already-on-disk
    /// estimate before any transfer starts.
    pub async fn download_all(
        &self,
        root: &Path,
        tasks: &[DownloadTask],
        progress: &Arc<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let total: u64 = tasks.iter().map(|t| t.size).sum();
        let on_disk: u64 = tasks.iter().map(|t| t.bytes_on_disk(root)).sum();
        progress.start_phase(total, tasks.len() as u64);
        progress.seed_finished_bytes(on_disk);
        info!(
            "downloading {} tasks, {total} bytes total, {on_disk} bytes already on disk",
            tasks.len()
        );

        let results: Vec<(String, Result<()>)> = futures_util::stream::iter(tasks.to_vec())
            .map(|task| async move {
                let result = self.download_task(root, &task, progress, cancel).await;
                if result.is_ok() {
                    progress.finish_file();
                }
                (task.file_name.clone(), result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let failures: Vec<TaskFailure> = results
            .into_iter()
            .filter_map(|(file_name, result)| {
                result.err().map(|err| TaskFailure {
                    file_name,
                    reason: err.to_string(),
                })
            })
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::TasksFailed { failures })
        }
    }

    async fn download_task(
        &self,
        root: &Path,
        task: &DownloadTask,
        progress: &Arc<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Counted into the phase seed; used to keep the counters
        // consistent on link shortcuts and forced restarts.
        let seeded = task.bytes_on_disk(root);

        if try_hard_link(root, task).await? {
            debug!("hard-linked {}", task.file_name);
            progress.add_bytes(task.size - seeded);
            return Ok(());
        }

        let target = task.write_target(root);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&target)
            .await?;
        let position = file.metadata().await?.len();
        if position >= task.size {
            return Ok(());
        }

        let url = task.resolve_url();
        debug!("download {} from {url} (resume at {position})", task.file_name);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::RANGE, format!("bytes={position}-"))
            .send()
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                file.seek(SeekFrom::Start(position)).await?;
            }
            StatusCode::OK => {
                if position > 0 {
                    warn!("server ignored range request for {url}, restarting");
                    file.seek(SeekFrom::Start(0)).await?;
                    file.set_len(0).await?;
                    progress.sub_bytes(position);
                }
            }
            status => return Err(Error::status(url, status.as_u16())),
        }

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    file.flush().await?;
                    return Err(Error::Cancelled);
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    self.limiter.acquire(bytes.len() as u64).await;
                    file.write_all(&bytes).await?;
                    progress.add_bytes(bytes.len() as u64);
                }
                Some(Err(err)) => {
                    file.flush().await?;
                    return Err(Error::Http(err));
                }
                None => break,
            }
        }
        file.flush().await?;
        debug!("downloaded {}", task.file_name);
        Ok(())
    }
}

/// Try to satisfy a task by hard-linking its resolved sibling file
async fn try_hard_link(root: &Path, task: &DownloadTask) -> Result<bool> {
    let Some(source) = task.hard_link_source.clone() else {
        return Ok(false);
    };
    link_from_source(&source, &task.final_path(root), task.size, &task.md5).await
}

/// Hard-link `source` over `final_path` when its content matches
///
/// The link lands on a `.link` temp name and replaces the final name by
/// rename. Linking is strictly an optimization: checksum mismatch,
/// cross-device links, permissions or a vanished source all fall back to
/// the network with `Ok(false)`.
pub(crate) async fn link_from_source(
    source: &Path,
    final_path: &Path,
    size: u64,
    md5: &str,
) -> Result<bool> {
    if !check_file_md5(source, size, md5).await? {
        debug!(
            "link source {} does not match {}, falling back to download",
            source.display(),
            final_path.display()
        );
        return Ok(false);
    }
    if let Some(parent) = final_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let source = source.to_path_buf();
    let final_path = final_path.to_path_buf();
    let linked = tokio::task::spawn_blocking(move || {
        let mut link_tmp = final_path.as_os_str().to_os_string();
        link_tmp.push(".link");
        let link_tmp = std::path::PathBuf::from(link_tmp);
        let _ = std::fs::remove_file(&link_tmp);
        match std::fs::hard_link(&source, &link_tmp) {
            Ok(()) => match std::fs::rename(&link_tmp, &final_path) {
                Ok(()) => true,
                Err(err) => {
                    warn!("failed to promote hard link {}: {err}", final_path.display());
                    let _ = std::fs::remove_file(&link_tmp);
                    false
                }
            },
            Err(err) => {
                debug!("hard link failed for {}: {err}", final_path.display());
                false
            }
        }
    })
    .await
    .map_err(|err| Error::Io(std::io::Error::other(err.to_string())))?;
    Ok(linked)
}
