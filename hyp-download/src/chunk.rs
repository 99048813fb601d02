//! Chunk-mode file assembly
//!
//! In the chunk protocol a game file is assembled from content-addressed,
//! zstd-compressed chunks. Assembly resumes by file length: chunks are
//! written in manifest order, so the current length of the `_tmp` file
//! tells exactly which chunks are already done.
//!
//! Chunk bytes come from the cheapest available source, in order:
//!
//! 1. a byte-identical slice of the old local version of the file
//!    (update planning records where), verified before reuse
//! 2. a previously downloaded compressed chunk in the cache directory
//!    (predownload drops chunks there)
//! 3. the network, streamed through the shared rate limiter
//!
//! Download progress counts compressed bytes; a plan's expected download
//! size excludes chunks satisfied by slice reuse.

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use md5::Context;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::link_from_source;
use crate::{
    check_file_md5, Error, RateLimiter, Result, TaskFailure, TransferProgress,
};

/// A window of an old local file holding a chunk's uncompressed bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceReuse {
    /// Old file to read from
    pub path: PathBuf,
    /// Offset of the chunk's bytes within the old file
    pub offset: u64,
    /// Expected total size of the old file; reuse is skipped when the
    /// file changed size
    pub file_size: u64,
}

/// One chunk of an assembly plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpec {
    /// Content-addressed chunk id
    pub id: String,
    /// Download URL for the compressed payload
    pub url: String,
    /// Offset within the assembled file
    pub offset: u64,
    /// Compressed payload size
    pub compressed_size: u64,
    /// Decompressed size
    pub uncompressed_size: u64,
    /// MD5 of the compressed payload
    pub compressed_md5: String,
    /// MD5 of the decompressed bytes
    pub uncompressed_md5: String,
    /// Local old-version slice carrying these bytes, when planning found
    /// one
    pub reuse: Option<SliceReuse>,
}

/// Assembly plan for one game file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFilePlan {
    /// Destination path relative to the install root
    pub file_name: String,
    /// Assembled file size
    pub size: u64,
    /// MD5 of the assembled file
    pub md5: String,
    /// Chunks in assembly order
    pub chunks: Vec<ChunkSpec>,
    /// Sibling install file to hard-link instead of assembling
    pub hard_link_source: Option<PathBuf>,
}

impl ChunkFilePlan {
    /// Expected network bytes: compressed sizes of chunks without a
    /// local reuse source
    pub fn download_size(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.reuse.is_none())
            .map(|c| c.compressed_size)
            .sum()
    }

    fn final_path(&self, root: &Path) -> PathBuf {
        root.join(&self.file_name)
    }

    fn temp_path(&self, root: &Path) -> PathBuf {
        let mut name = self.final_path(root).into_os_string();
        name.push("_tmp");
        PathBuf::from(name)
    }
}

/// Assembles chunk-mode files with bounded concurrency
#[derive(Debug, Clone)]
pub struct ChunkAssembler {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    concurrency: usize,
}

impl ChunkAssembler {
    /// Create an assembler sharing the given rate limiter
    pub fn new(limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client, limiter))
    }

    /// Create an assembler with a custom HTTP client
    pub fn with_client(client: reqwest::Client, limiter: Arc<RateLimiter>) -> Self {
        let cores = std::thread::available_parallelism().map_or(4, std::num::NonZero::get);
        Self {
            client,
            limiter,
            concurrency: (cores * 2).min(16),
        }
    }

    /// Override the concurrency bound
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Assemble every plan; failures are collected until all plans settle
    pub async fn assemble_all(
        &self,
        root: &Path,
        plans: &[ChunkFilePlan],
        cache_dir: Option<&Path>,
        progress: &Arc<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let download_total: u64 = plans.iter().map(ChunkFilePlan::download_size).sum();
        progress.start_phase(download_total, plans.len() as u64);
        info!(
            "assembling {} files, {download_total} bytes to download",
            plans.len()
        );

        let results: Vec<(String, Result<()>)> = futures_util::stream::iter(plans.to_vec())
            .map(|plan| async move {
                let result = self
                    .assemble_file(root, &plan, cache_dir, progress, cancel)
                    .await;
                if result.is_ok() {
                    progress.finish_file();
                }
                (plan.file_name.clone(), result)
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

    async fn assemble_file(
        &self,
        root: &Path,
        plan: &ChunkFilePlan,
        cache_dir: Option<&Path>,
        progress: &Arc<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let final_path = plan.final_path(root);

        if let Some(source) = &plan.hard_link_source {
            if link_from_source(source, &final_path, plan.size, &plan.md5).await? {
                debug!("hard-linked {}", plan.file_name);
                progress.add_bytes(plan.download_size());
                return Ok(());
            }
        }
        if check_file_md5(&final_path, plan.size, &plan.md5).await? {
            progress.add_bytes(plan.download_size());
            return Ok(());
        }

        let temp_path = plan.temp_path(root);
        if let Some(parent) = temp_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&temp_path)
            .await?;
        let mut length = file.metadata().await?.len();

        for chunk in &plan.chunks {
            if cancel.is_cancelled() {
                file.flush().await?;
                return Err(Error::Cancelled);
            }
            let end = chunk.offset + chunk.uncompressed_size;
            if length >= end {
                // Chunk already assembled in an earlier run
                if chunk.reuse.is_none() {
                    progress.add_bytes(chunk.compressed_size);
                }
                continue;
            }

            let data = self.obtain_chunk(chunk, cache_dir, progress, cancel).await?;
            file.seek(tokio::io::SeekFrom::Start(chunk.offset)).await?;
            file.write_all(&data).await?;
            length = end;
        }
        file.flush().await?;
        drop(file);

        if check_file_md5(&temp_path, plan.size, &plan.md5).await? {
            tokio::fs::rename(&temp_path, &final_path).await?;
            debug!("assembled {}", plan.file_name);
            Ok(())
        } else {
            let actual = crate::hash_file_md5(&temp_path, None).await.unwrap_or_default();
            // Known-bad temp: discard so the next run restarts cleanly
            tokio::fs::remove_file(&temp_path).await?;
            progress.sub_bytes(plan.download_size());
            Err(Error::file_checksum(plan.file_name.clone(), plan.md5.clone(), actual))
        }
    }

    /// Produce a chunk's uncompressed bytes from the cheapest source
    async fn obtain_chunk(
        &self,
        chunk: &ChunkSpec,
        cache_dir: Option<&Path>,
        progress: &Arc<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        if let Some(reuse) = &chunk.reuse {
            if let Some(data) = read_reusable_slice(reuse, chunk).await? {
                debug!("chunk {} reused from {}", chunk.id, reuse.path.display());
                return Ok(data);
            }
            warn!(
                "chunk {} slice in {} no longer matches, downloading",
                chunk.id,
                reuse.path.display()
            );
        }

        if let Some(cache_dir) = cache_dir {
            if let Some(data) = read_cached_chunk(cache_dir, chunk).await? {
                debug!("chunk {} served from cache", chunk.id);
                progress.add_bytes(chunk.compressed_size);
                return Ok(data);
            }
        }

        let compressed = self.download_chunk(chunk, progress, cancel).await?;
        let data = tokio::task::spawn_blocking(move || {
            zstd::stream::decode_all(Cursor::new(compressed))
        })
        .await
        .map_err(|err| Error::Io(std::io::Error::other(err.to_string())))??;
        Ok(data)
    }

    async fn download_chunk(
        &self,
        chunk: &ChunkSpec,
        progress: &Arc<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let response = self.client.get(&chunk.url).send().await?;
        if !response.status().is_success() {
            return Err(Error::status(chunk.url.clone(), response.status().as_u16()));
        }
        let mut compressed = Vec::with_capacity(chunk.compressed_size as usize);
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    self.limiter.acquire(bytes.len() as u64).await;
                    compressed.extend_from_slice(&bytes);
                    progress.add_bytes(bytes.len() as u64);
                }
                Some(Err(err)) => return Err(Error::Http(err)),
                None => break,
            }
        }
        Ok(compressed)
    }
}

/// Read and verify a chunk's bytes out of an old local file
async fn read_reusable_slice(reuse: &SliceReuse, chunk: &ChunkSpec) -> Result<Option<Vec<u8>>> {
    let reuse = reuse.clone();
    let size = chunk.uncompressed_size;
    let expected_md5 = chunk.uncompressed_md5.clone();
    let data = tokio::task::spawn_blocking(move || -> std::io::Result<Option<Vec<u8>>> {
        let Ok(mut file) = std::fs::File::open(&reuse.path) else {
            return Ok(None);
        };
        if file.metadata()?.len() != reuse.file_size {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(reuse.offset))?;
        let mut data = vec![0u8; size as usize];
        if file.read_exact(&mut data).is_err() {
            return Ok(None);
        }
        let mut hasher = Context::new();
        hasher.consume(&data);
        if hex::encode(hasher.finalize().0).eq_ignore_ascii_case(&expected_md5) {
            Ok(Some(data))
        } else {
            Ok(None)
        }
    })
    .await
    .map_err(|err| Error::Io(std::io::Error::other(err.to_string())))??;
    Ok(data)
}

/// Read and verify a predownloaded compressed chunk from the cache
async fn read_cached_chunk(cache_dir: &Path, chunk: &ChunkSpec) -> Result<Option<Vec<u8>>> {
    let path = cache_dir.join(&chunk.id);
    let compressed = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if compressed.len() as u64 != chunk.compressed_size {
        return Ok(None);
    }
    if !hex::encode(md5::compute(&compressed).0).eq_ignore_ascii_case(&chunk.compressed_md5) {
        return Ok(None);
    }
    let data = tokio::task::spawn_blocking(move || zstd::stream::decode_all(Cursor::new(compressed)))
        .await
        .map_err(|err| Error::Io(std::io::Error::other(err.to_string())))??;
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn md5_hex(data: &[u8]) -> String {
        hex::encode(md5::compute(data).0)
    }

    fn chunk_spec(server: &MockServer, id: &str, offset: u64, data: &[u8]) -> (ChunkSpec, Vec<u8>) {
        let compressed = zstd::stream::encode_all(Cursor::new(data), 0).unwrap();
        let spec = ChunkSpec {
            id: id.to_string(),
            url: format!("{}/chunks/{id}", server.uri()),
            offset,
            compressed_size: compressed.len() as u64,
            uncompressed_size: data.len() as u64,
            compressed_md5: md5_hex(&compressed),
            uncompressed_md5: md5_hex(data),
            reuse: None,
        };
        (spec, compressed)
    }

    fn assembler() -> ChunkAssembler {
        ChunkAssembler::new(Arc::new(RateLimiter::unlimited()))
            .unwrap()
            .with_concurrency(2)
    }

    #[tokio::test]
    async fn assembles_file_from_downloaded_chunks() {
        let server = MockServer::start().await;
        let (c1, payload1) = chunk_spec(&server, "c1", 0, b"first-half-");
        let (c2, payload2) = chunk_spec(&server, "c2", 11, b"second-half");
        for (id, payload) in [("c1", payload1.clone()), ("c2", payload2.clone())] {
            Mock::given(method("GET"))
                .and(path(format!("/chunks/{id}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(payload))
                .mount(&server)
                .await;
        }

        let full = b"first-half-second-half";
        let plan = ChunkFilePlan {
            file_name: "data/blocks.bin".to_string(),
            size: full.len() as u64,
            md5: md5_hex(full),
            chunks: vec![c1.clone(), c2.clone()],
            hard_link_source: None,
        };

        let dir = tempfile::tempdir().unwrap();
        let progress = Arc::new(TransferProgress::new());
        assembler()
            .assemble_all(dir.path(), &[plan], None, &progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fs::read(dir.path().join("data/blocks.bin")).unwrap(), full);
        let snap = progress.snapshot();
        assert_eq!(snap.finished_bytes, c1.compressed_size + c2.compressed_size);
        assert_eq!(snap.finished_files, 1);
    }

    #[tokio::test]
    async fn reused_slice_skips_the_network() {
        let server = MockServer::start().await;
        let (mut c1, _) = chunk_spec(&server, "c1", 0, b"stable-bytes");
        let (c2, payload2) = chunk_spec(&server, "c2", 12, b"-fresh");
        // Only the fresh chunk may be fetched
        Mock::given(method("GET"))
            .and(path("/chunks/c2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload2))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old/blocks.bin");
        fs::create_dir_all(old.parent().unwrap()).unwrap();
        fs::write(&old, b"stable-bytes###").unwrap();
        c1.reuse = Some(SliceReuse {
            path: old.clone(),
            offset: 0,
            file_size: 15,
        });

        let full = b"stable-bytes-fresh";
        let plan = ChunkFilePlan {
            file_name: "new/blocks.bin".to_string(),
            size: full.len() as u64,
            md5: md5_hex(full),
            chunks: vec![c1, c2.clone()],
            hard_link_source: None,
        };

        let progress = Arc::new(TransferProgress::new());
        assembler()
            .assemble_all(dir.path(), &[plan.clone()], None, &progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fs::read(dir.path().join("new/blocks.bin")).unwrap(), full);
        // Download total and finished both exclude the reused chunk
        assert_eq!(plan.download_size(), c2.compressed_size);
        assert_eq!(progress.snapshot().finished_bytes, c2.compressed_size);
    }

    #[tokio::test]
    async fn cached_chunk_is_used_without_fetching() {
        let server = MockServer::start().await;
        let (c1, payload1) = chunk_spec(&server, "c1", 0, b"cached-bytes");
        // No mock for /chunks/c1: fetching it would 404 and fail

        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("chunk");
        fs::create_dir_all(&cache).unwrap();
        fs::write(cache.join("c1"), &payload1).unwrap();

        let plan = ChunkFilePlan {
            file_name: "blocks.bin".to_string(),
            size: 12,
            md5: md5_hex(b"cached-bytes"),
            chunks: vec![c1],
            hard_link_source: None,
        };

        let progress = Arc::new(TransferProgress::new());
        assembler()
            .assemble_all(
                dir.path(),
                &[plan],
                Some(&cache),
                &progress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(fs::read(dir.path().join("blocks.bin")).unwrap(), b"cached-bytes");
    }

    #[tokio::test]
    async fn corrupt_assembly_is_discarded_and_reported() {
        let server = MockServer::start().await;
        let (c1, payload1) = chunk_spec(&server, "c1", 0, b"actual-bytes");
        Mock::given(method("GET"))
            .and(path("/chunks/c1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload1))
            .mount(&server)
            .await;

        let plan = ChunkFilePlan {
            file_name: "blocks.bin".to_string(),
            size: 12,
            // Declared hash differs from what the chunks produce
            md5: md5_hex(b"declared-bytes"),
            chunks: vec![c1],
            hard_link_source: None,
        };

        let dir = tempfile::tempdir().unwrap();
        let progress = Arc::new(TransferProgress::new());
        let err = assembler()
            .assemble_all(dir.path(), &[plan], None, &progress, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            Error::TasksFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].file_name, "blocks.bin");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dir.path().join("blocks.bin").exists());
        assert!(!dir.path().join("blocks.bin_tmp").exists());
    }

    #[tokio::test]
    async fn resume_skips_completed_chunks() {
        let server = MockServer::start().await;
        let (c1, _) = chunk_spec(&server, "c1", 0, b"first-half-");
        let (c2, payload2) = chunk_spec(&server, "c2", 11, b"second-half");
        // c1 must not be fetched again
        Mock::given(method("GET"))
            .and(path("/chunks/c2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload2))
            .expect(1)
            .mount(&server)
            .await;

        let full = b"first-half-second-half";
        let plan = ChunkFilePlan {
            file_name: "blocks.bin".to_string(),
            size: full.len() as u64,
            md5: md5_hex(full),
            chunks: vec![c1.clone(), c2],
            hard_link_source: None,
        };

        let dir = tempfile::tempdir().unwrap();
        // Prior run already wrote the first chunk
        fs::write(dir.path().join("blocks.bin_tmp"), b"first-half-").unwrap();

        let progress = Arc::new(TransferProgress::new());
        assembler()
            .assemble_all(dir.path(), &[plan], None, &progress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fs::read(dir.path().join("blocks.bin")).unwrap(), full);
    }
}
