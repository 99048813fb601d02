//! Checksum verification and temp-file promotion
//!
//! Every downloaded artifact is re-opened from disk, stream-hashed, and
//! compared against its manifest-declared length and MD5. Verified temp
//! files are promoted to their final names atomically; mismatches are
//! collected — never acted on here — and raised as one aggregate error
//! after every task has been checked, so the caller knows the exact set
//! of bad files.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use md5::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{DownloadTask, Error, Result, TransferProgress};

const HASH_BUFFER_SIZE: usize = 1 << 19;

/// Stream-hash a file with MD5, reporting hashed bytes to `progress`
///
/// Runs on a blocking thread; the file is read once with a large buffer.
pub async fn hash_file_md5(
    path: impl Into<PathBuf>,
    progress: Option<Arc<TransferProgress>>,
) -> std::io::Result<String> {
    let path = path.into();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Context::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.consume(&buffer[..read]);
            if let Some(progress) = &progress {
                progress.add_bytes(read as u64);
            }
        }
        Ok(hex::encode(hasher.finalize().0))
    })
    .await
    .map_err(|err| std::io::Error::other(err.to_string()))?
}

/// Check a file against an expected length and MD5
///
/// Missing file or wrong length short-circuit to `false` without hashing.
pub async fn check_file_md5(path: &Path, size: u64, md5: &str) -> std::io::Result<bool> {
    let Ok(meta) = path.metadata() else {
        return Ok(false);
    };
    if meta.len() != size {
        return Ok(false);
    }
    let actual = hash_file_md5(path, None).await?;
    Ok(actual.eq_ignore_ascii_case(md5))
}

/// Verifier for a settled download task list
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    skip_verify: bool,
}

impl Verifier {
    /// Create a verifier that checks every task
    pub fn new() -> Self {
        Self::default()
    }

    /// Promote every temp file unconditionally instead of hashing
    ///
    /// This is the only path through which corruption can reach a final
    /// file name; callers exposing it must say so.
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }

    /// Verify every task and promote verified temp files
    ///
    /// On any mismatch the error lists exactly the set of files that
    /// failed length or checksum comparison. Offending files are left on
    /// disk untouched; discarding them is the caller's decision.
    pub async fn verify_all(
        &self,
        root: &Path,
        tasks: &[DownloadTask],
        progress: &Arc<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        progress.start_phase(tasks.iter().map(|t| t.size).sum(), tasks.len() as u64);
        let mut failures: Vec<String> = Vec::new();

        for task in tasks {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.verify_task(root, task, progress).await? {
                true => debug!("verified {}", task.file_name),
                false => {
                    warn!("verification failed for {}", task.file_name);
                    failures.push(task.file_name.clone());
                }
            }
            progress.finish_file();
        }

        if failures.is_empty() {
            info!("verified {} files", tasks.len());
            Ok(())
        } else {
            Err(Error::ChecksumMismatch { files: failures })
        }
    }

    async fn verify_task(
        &self,
        root: &Path,
        task: &DownloadTask,
        progress: &Arc<TransferProgress>,
    ) -> Result<bool> {
        let final_path = task.final_path(root);
        let temp_path = task.temp_path(root);

        if self.skip_verify {
            if temp_path.exists() {
                tokio::fs::rename(&temp_path, &final_path).await?;
            }
            progress.add_bytes(task.size);
            return Ok(true);
        }

        let Some(resident) = task.resident_path(root) else {
            return Ok(false);
        };
        let meta = tokio::fs::metadata(&resident).await?;
        if meta.len() != task.size {
            return Ok(false);
        }
        let actual = hash_file_md5(&resident, Some(Arc::clone(progress))).await?;
        if !actual.eq_ignore_ascii_case(&task.md5) {
            return Ok(false);
        }
        if resident == temp_path {
            tokio::fs::rename(&temp_path, &final_path).await?;
        }
        Ok(true)
    }
}
