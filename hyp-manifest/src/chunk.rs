//! Content-addressed chunk manifest protocol
//!
//! The newer remote protocol. A build is described per category (game body,
//! one category per audio locale, optional expansion categories) by an
//! index file listing every shipped file and the compressed chunks that
//! assemble it. Chunks are content-addressed and deduplicated across
//! files, so the manifest tracks raw and deduplicated statistics
//! separately. Patch builds describe version-to-version binary diffs over
//! the same category structure.

use serde::{Deserialize, Serialize};

use crate::{AudioLanguages, Error, Result};

/// Descriptor of a downloadable index file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFile {
    /// Content-addressed id, also the file name on the CDN
    pub id: String,
    /// MD5 of the decompressed index payload, lowercase hex
    pub checksum: String,
    /// Size of the index file as stored on the CDN
    pub compressed_size: u64,
    /// Size of the decompressed payload
    pub uncompressed_size: u64,
}

/// URL construction template for CDN objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlTemplate {
    /// Prefix prepended to the object id
    pub url_prefix: String,
    /// Suffix appended after the object id, usually empty
    #[serde(default)]
    pub url_suffix: String,
}

impl UrlTemplate {
    /// Build the full URL for an object id
    pub fn url_for(&self, id: &str) -> String {
        format!(
            "{}/{}{}",
            self.url_prefix.trim_end_matches('/'),
            id,
            self.url_suffix
        )
    }
}

/// Raw or deduplicated size statistics for one category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStats {
    /// Total compressed chunk bytes
    pub compressed_size: u64,
    /// Total uncompressed bytes
    pub uncompressed_size: u64,
    /// Number of files
    pub file_count: u64,
    /// Number of chunks
    pub chunk_count: u64,
}

/// One category of a chunk build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCategory {
    /// Category tag: `game`, an audio locale code, or a numeric expansion id
    pub matching_field: String,
    /// Index file descriptor
    pub manifest: IndexFile,
    /// Where index files are served
    pub manifest_download: UrlTemplate,
    /// Where chunk payloads are served
    pub chunk_download: UrlTemplate,
    /// Statistics counting every chunk reference
    pub stats: ChunkStats,
    /// Statistics counting each distinct chunk once
    pub deduplicated_stats: ChunkStats,
}

impl ChunkCategory {
    /// Whether this category is an audio-locale category
    pub fn is_audio(&self) -> bool {
        let f = self.matching_field.as_bytes();
        f.len() == 5 && f[2] == b'-'
    }
}

/// Remote chunk build for one variant and version tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBuild {
    /// Build identifier assigned by the service
    pub build_id: String,
    /// Version tag of this build
    pub tag: String,
    /// Per-category manifests
    #[serde(default)]
    pub manifests: Vec<ChunkCategory>,
}

impl ChunkBuild {
    /// Categories to process for an audio selection
    ///
    /// Non-audio categories are always included unless named by
    /// `ignored`; audio categories only when their locale is selected.
    pub fn select_categories(
        &self,
        langs: AudioLanguages,
        ignored: &[String],
    ) -> Vec<&ChunkCategory> {
        let mut out = Vec::new();
        for cat in &self.manifests {
            if ignored.contains(&cat.matching_field) {
                continue;
            }
            if cat.is_audio() {
                continue;
            }
            out.push(cat);
        }
        for locale in langs.locales() {
            if let Some(cat) = self
                .manifests
                .iter()
                .find(|c| c.matching_field == locale)
            {
                out.push(cat);
            }
        }
        out
    }

    /// Find a category by its matching field
    pub fn category(&self, matching_field: &str) -> Option<&ChunkCategory> {
        self.manifests
            .iter()
            .find(|c| c.matching_field == matching_field)
    }

    /// Enforce structural invariants after deserialization
    pub fn validate(&self) -> Result<()> {
        if self.build_id.is_empty() {
            return Err(Error::invalid_manifest("chunk build missing build_id"));
        }
        if self.manifests.is_empty() {
            return Err(Error::invalid_manifest("chunk build has no categories"));
        }
        Ok(())
    }
}

/// One chunk of a file in a chunk index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Content-addressed chunk id
    pub id: String,
    /// Byte offset of this chunk's payload within the assembled file
    pub offset: u64,
    /// Stored (compressed) size
    pub compressed_size: u64,
    /// Decompressed size
    pub uncompressed_size: u64,
    /// MD5 of the stored payload
    pub compressed_md5: String,
    /// MD5 of the decompressed payload
    pub uncompressed_md5: String,
}

/// One file entry in a chunk index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFile {
    /// Path relative to the install root
    pub name: String,
    /// Assembled file size
    pub size: u64,
    /// MD5 of the assembled file
    pub md5: String,
    /// Directory entries carry no chunks
    #[serde(default)]
    pub is_directory: bool,
    /// Chunks in assembly order
    #[serde(default)]
    pub chunks: Vec<ChunkRef>,
}

/// Decoded chunk index: the complete file list of one category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkIndex {
    /// All files of the category
    #[serde(default)]
    pub files: Vec<ChunkFile>,
}

impl ChunkIndex {
    /// Regular-file entries, skipping directories
    pub fn regular_files(&self) -> impl Iterator<Item = &ChunkFile> {
        self.files.iter().filter(|f| !f.is_directory)
    }
}

/// One category of a patch build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchCategory {
    /// Category tag, same scheme as chunk categories
    pub matching_field: String,
    /// Patch index file descriptor
    pub manifest: IndexFile,
    /// Where patch index files are served
    pub manifest_download: UrlTemplate,
    /// Where diff payloads are served
    pub diff_download: DiffDownload,
}

impl PatchCategory {
    /// Whether this category is an audio-locale category
    pub fn is_audio(&self) -> bool {
        let f = self.matching_field.as_bytes();
        f.len() == 5 && f[2] == b'-'
    }
}

/// Diff payload location plus its encoding flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffDownload {
    /// Prefix prepended to the diff blob id
    pub url_prefix: String,
    /// Suffix appended after the id
    #[serde(default)]
    pub url_suffix: String,
    /// Non-zero when diff payloads are compressed
    #[serde(default)]
    pub compression: u32,
}

impl DiffDownload {
    /// Build the full URL for a diff blob id
    pub fn url_for(&self, id: &str) -> String {
        format!(
            "{}/{}{}",
            self.url_prefix.trim_end_matches('/'),
            id,
            self.url_suffix
        )
    }

    /// Whether diff payloads are compressed
    pub fn is_compressed(&self) -> bool {
        self.compression != 0
    }
}

/// Remote patch build for one variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchBuild {
    /// Build identifier; empty when no patch build is published
    pub build_id: String,
    /// Target version tag
    pub tag: String,
    /// Per-category patch manifests
    #[serde(default)]
    pub manifests: Vec<PatchCategory>,
}

impl PatchBuild {
    /// Categories to process for an audio selection
    pub fn select_categories(
        &self,
        langs: AudioLanguages,
        ignored: &[String],
    ) -> Vec<&PatchCategory> {
        let mut out = Vec::new();
        for cat in &self.manifests {
            if ignored.contains(&cat.matching_field) {
                continue;
            }
            if cat.is_audio() {
                continue;
            }
            out.push(cat);
        }
        for locale in langs.locales() {
            if let Some(cat) = self
                .manifests
                .iter()
                .find(|c| c.matching_field == locale)
            {
                out.push(cat);
            }
        }
        out
    }
}

/// Where the bytes of one patched file come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSource {
    /// Diff blob id the patch data lives in
    pub id: String,
    /// Offset of this file's patch data within the blob
    pub patch_offset: u64,
    /// Length of this file's patch data
    pub patch_length: u64,
    /// Total size of the diff blob
    pub patch_file_size: u64,
    /// MD5 of the diff blob
    pub patch_file_md5: String,
    /// Old file the diff applies to; absent when the patch data is the
    /// whole new file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    /// Size of the old file
    #[serde(default)]
    pub original_size: u64,
    /// MD5 of the old file
    #[serde(default)]
    pub original_md5: String,
}

/// One file entry in a patch index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchFile {
    /// Path relative to the install root
    pub name: String,
    /// Size of the patched file
    pub size: u64,
    /// MD5 of the patched file
    pub md5: String,
    /// Patch data location; absent for files copied verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<PatchSource>,
}

/// Files deleted when patching from a given source version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTag {
    /// Source version the deletions apply to
    pub tag: String,
    /// Relative paths to delete
    #[serde(default)]
    pub files: Vec<String>,
}

/// Decoded patch index of one category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchIndex {
    /// Patched files
    #[serde(default)]
    pub patches: Vec<PatchFile>,
    /// Deletions keyed by source version
    #[serde(default)]
    pub delete_tags: Vec<DeleteTag>,
}

impl PatchIndex {
    /// Files to delete when patching from `local_version`
    pub fn deletes_for(&self, local_version: &str) -> &[String] {
        match self.delete_tags.iter().find(|t| t.tag == local_version) {
            Some(tag) => &tag.files,
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category(field: &str) -> ChunkCategory {
        ChunkCategory {
            matching_field: field.to_string(),
            manifest: IndexFile {
                id: format!("{field}-index"),
                checksum: "00".repeat(16),
                compressed_size: 10,
                uncompressed_size: 20,
            },
            manifest_download: UrlTemplate {
                url_prefix: "https://cdn.example.com/manifests".to_string(),
                url_suffix: String::new(),
            },
            chunk_download: UrlTemplate {
                url_prefix: "https://cdn.example.com/chunks/".to_string(),
                url_suffix: String::new(),
            },
            stats: ChunkStats::default(),
            deduplicated_stats: ChunkStats::default(),
        }
    }

    #[test]
    fn url_template_joins_cleanly() {
        let t = UrlTemplate {
            url_prefix: "https://cdn.example.com/chunks/".to_string(),
            url_suffix: String::new(),
        };
        assert_eq!(
            t.url_for("abc123"),
            "https://cdn.example.com/chunks/abc123"
        );
    }

    #[test]
    fn audio_categories_detected_by_locale_shape() {
        assert!(category("zh-cn").is_audio());
        assert!(category("ja-jp").is_audio());
        assert!(!category("game").is_audio());
        assert!(!category("10302").is_audio());
    }

    #[test]
    fn category_selection_honors_audio_and_ignores() {
        let build = ChunkBuild {
            build_id: "b1".to_string(),
            tag: "1.1.0".to_string(),
            manifests: vec![
                category("game"),
                category("10302"),
                category("zh-cn"),
                category("ja-jp"),
            ],
        };
        let ignored = vec!["10302".to_string()];
        let selected = build.select_categories(AudioLanguages::JAPANESE, &ignored);
        let fields: Vec<&str> = selected.iter().map(|c| c.matching_field.as_str()).collect();
        assert_eq!(fields, vec!["game", "ja-jp"]);
    }

    #[test]
    fn delete_tags_keyed_by_source_version() {
        let index = PatchIndex {
            patches: vec![],
            delete_tags: vec![DeleteTag {
                tag: "1.0.0".to_string(),
                files: vec!["old.dat".to_string()],
            }],
        };
        assert_eq!(index.deletes_for("1.0.0"), ["old.dat".to_string()]);
        assert!(index.deletes_for("0.9.0").is_empty());
    }

    #[test]
    fn chunk_index_skips_directories() {
        let index = ChunkIndex {
            files: vec![
                ChunkFile {
                    name: "data".to_string(),
                    size: 0,
                    md5: String::new(),
                    is_directory: true,
                    chunks: vec![],
                },
                ChunkFile {
                    name: "data/a.bin".to_string(),
                    size: 4,
                    md5: "x".to_string(),
                    is_directory: false,
                    chunks: vec![],
                },
            ],
        };
        let names: Vec<&str> = index.regular_files().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["data/a.bin"]);
    }
}
