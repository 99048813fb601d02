//! Metadata-service client
//!
//! Fetches the remote manifest shapes for one variant: the per-variant
//! profile, package and chunk manifests, patch builds, the deprecated-file
//! feed, channel SDK descriptors, and `pkg_version` ground-truth listings.
//! Responses arrive in a `{retcode, message, data}` envelope; non-zero
//! retcodes surface as typed errors except the service's "build not found"
//! code, which maps to `Ok(None)` where absence is an answer.
//!
//! Chunk and patch index files are content-addressed, zstd-compressed and
//! checksummed; the client caches them on disk keyed by id and validates
//! the checksum before every reuse.

use std::io::Cursor;
use std::path::PathBuf;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    parse_pkg_version, ChannelSdk, ChunkBuild, ChunkCategory, ChunkIndex, DeprecatedFileConfig,
    Error, GameBranches, GamePackage, GameVariant, IndexFile, PatchBuild, PatchCategory,
    PatchIndex, PkgVersionEntry, Result, VariantProfile,
};

/// Service retcode for a build that does not exist
const RETCODE_NOT_FOUND: i64 = -202;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    retcode: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

/// Client for the remote metadata service
#[derive(Debug, Clone)]
pub struct MetadataClient {
    http: reqwest::Client,
    base: Url,
    cache_dir: Option<PathBuf>,
}

impl MetadataClient {
    /// Create a client against a service base URL
    pub fn new(base: impl AsRef<str>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            base: Url::parse(base.as_ref())?,
            cache_dir: None,
        })
    }

    /// Create a client with a custom HTTP client
    pub fn with_client(http: reqwest::Client, base: impl AsRef<str>) -> Result<Self> {
        Ok(Self {
            http,
            base: Url::parse(base.as_ref())?,
            cache_dir: None,
        })
    }

    /// Cache downloaded index files under `dir`
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    async fn get_envelope<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Envelope<T>> {
        let mut url = self.base.join(path)?;
        url.query_pairs_mut().extend_pairs(query);
        debug!("metadata request: {url}");
        let response = self.http.get(url).send().await?;
        let response = response.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn get_data<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let envelope: Envelope<T> = self.get_envelope(path, query).await?;
        if envelope.retcode != 0 {
            return Err(Error::api(envelope.retcode, envelope.message));
        }
        envelope.data.ok_or_else(|| Error::missing_data(path))
    }

    /// Same as [`get_data`](Self::get_data) but maps the service's
    /// "not found" retcode to `Ok(None)`.
    async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        let envelope: Envelope<T> = self.get_envelope(path, query).await?;
        match envelope.retcode {
            0 => Ok(Some(
                envelope.data.ok_or_else(|| Error::missing_data(path))?,
            )),
            RETCODE_NOT_FOUND => Ok(None),
            code => Err(Error::api(code, envelope.message)),
        }
    }

    /// Fetch the per-variant profile (download mode, marker paths, flags)
    pub async fn variant_profile(&self, variant: &GameVariant) -> Result<VariantProfile> {
        self.get_data("api/profile", &[("biz", &variant.biz())])
            .await
    }

    /// Fetch the legacy package manifest
    pub async fn game_package(&self, variant: &GameVariant) -> Result<GamePackage> {
        let package: GamePackage = self
            .get_data("api/package", &[("biz", &variant.biz())])
            .await?;
        package.validate()?;
        Ok(package)
    }

    /// Fetch branch tags for the chunk protocol family
    pub async fn branches(&self, variant: &GameVariant) -> Result<GameBranches> {
        self.get_data("api/branches", &[("biz", &variant.biz())])
            .await
    }

    /// Fetch a chunk build; `tag` selects a specific version, empty means
    /// latest. Returns `None` when no build exists for the tag.
    pub async fn chunk_build(
        &self,
        variant: &GameVariant,
        tag: &str,
    ) -> Result<Option<ChunkBuild>> {
        let build: Option<ChunkBuild> = self
            .get_optional("api/chunk_build", &[("biz", &variant.biz()), ("tag", tag)])
            .await?;
        if let Some(build) = &build {
            build.validate()?;
        }
        Ok(build)
    }

    /// Fetch the patch build for the main or predownload branch
    ///
    /// The service publishes an empty `build_id` when no patch build
    /// exists; that also maps to `None`.
    pub async fn patch_build(
        &self,
        variant: &GameVariant,
        branch_tag: &str,
    ) -> Result<Option<PatchBuild>> {
        let build: Option<PatchBuild> = self
            .get_optional(
                "api/patch_build",
                &[("biz", &variant.biz()), ("tag", branch_tag)],
            )
            .await?;
        Ok(build.filter(|b| !b.build_id.is_empty()))
    }

    /// Fetch the deprecated-file feed
    pub async fn deprecated_files(&self, variant: &GameVariant) -> Result<DeprecatedFileConfig> {
        self.get_data("api/deprecated_files", &[("biz", &variant.biz())])
            .await
    }

    /// Fetch the channel SDK descriptor, if one is published
    pub async fn channel_sdk(&self, variant: &GameVariant) -> Result<Option<ChannelSdk>> {
        self.get_optional("api/channel_sdk", &[("biz", &variant.biz())])
            .await
    }

    /// Fetch and parse a `pkg_version` listing from a resource prefix
    ///
    /// A missing listing (404) is an empty list: not every variant
    /// publishes per-language audio listings.
    pub async fn pkg_version(&self, res_list_url: &str, name: &str) -> Result<Vec<PkgVersionEntry>> {
        let url = format!("{}/{name}", res_list_url.trim_end_matches('/'));
        debug!("pkg_version request: {url}");
        let response = self.http.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!("pkg_version listing {name} not published");
            return Ok(Vec::new());
        }
        let bytes = response.error_for_status()?.bytes().await?;
        parse_pkg_version(Cursor::new(bytes))
    }

    /// Fetch, validate and decode the chunk index of a category
    pub async fn chunk_index(&self, category: &ChunkCategory) -> Result<ChunkIndex> {
        let payload = self
            .ensure_index(
                &category.manifest,
                &category.manifest_download.url_for(&category.manifest.id),
            )
            .await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Fetch, validate and decode the patch index of a category
    pub async fn patch_index(&self, category: &PatchCategory) -> Result<PatchIndex> {
        let payload = self
            .ensure_index(
                &category.manifest,
                &category.manifest_download.url_for(&category.manifest.id),
            )
            .await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Return the decompressed, checksum-validated payload of an index
    /// file, reusing the on-disk cache when it still validates.
    async fn ensure_index(&self, descriptor: &IndexFile, url: &str) -> Result<Vec<u8>> {
        if let Some(cache) = &self.cache_dir {
            let path = cache.join(&descriptor.id);
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                if meta.len() == descriptor.compressed_size {
                    let compressed = tokio::fs::read(&path).await?;
                    if let Ok(payload) = decode_and_check(&compressed, descriptor) {
                        debug!("index {} served from cache", descriptor.id);
                        return Ok(payload);
                    }
                    warn!("cached index {} failed validation, refetching", descriptor.id);
                }
            }
        }

        debug!("index request: {url}");
        let response = self.http.get(url).send().await?;
        let compressed = response.error_for_status()?.bytes().await?;
        let payload = decode_and_check(&compressed, descriptor)?;

        if let Some(cache) = &self.cache_dir {
            tokio::fs::create_dir_all(cache).await?;
            tokio::fs::write(cache.join(&descriptor.id), &compressed).await?;
        }
        info!(
            "fetched index {} ({} bytes compressed)",
            descriptor.id,
            compressed.len()
        );
        Ok(payload)
    }
}

fn decode_and_check(compressed: &[u8], descriptor: &IndexFile) -> Result<Vec<u8>> {
    let payload = zstd::stream::decode_all(Cursor::new(compressed))?;
    let actual = hex::encode(md5::compute(&payload).0);
    if actual.eq_ignore_ascii_case(&descriptor.checksum) {
        Ok(payload)
    } else {
        Err(Error::IndexChecksum {
            id: descriptor.id.clone(),
            expected: descriptor.checksum.clone(),
            actual,
        })
    }
}
