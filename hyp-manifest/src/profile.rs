//! Per-variant launcher profile and auxiliary remote shapes

use serde::{Deserialize, Serialize};

/// Preferred download protocol for a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadMode {
    /// Content-addressed chunk protocol
    #[serde(rename = "DOWNLOAD_MODE_CHUNK")]
    Chunk,
    /// Chunk protocol with ldiff patch builds for updates
    #[serde(rename = "DOWNLOAD_MODE_LDIFF")]
    Ldiff,
    /// Legacy compressed-package protocol
    #[serde(rename = "DOWNLOAD_MODE_FILE")]
    CompressedPackage,
}

impl DownloadMode {
    /// Whether this mode is served by the chunk protocol family
    pub fn is_chunked(self) -> bool {
        matches!(self, Self::Chunk | Self::Ldiff)
    }
}

/// Feature flags and marker-file locations for one variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantProfile {
    /// Protocol family the service prefers for this variant
    pub default_download_mode: DownloadMode,
    /// Relative path of the audio-language marker inside the install tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_scan_file: Option<String>,
    /// Relative path of the category ignore list inside the install tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_category_dir: Option<String>,
    /// Whether cross-variant hard linking is allowed for this title
    #[serde(default)]
    pub hard_link_eligible: bool,
}

/// One line of the category ignore list
///
/// The game writes this file to mark optional categories the player
/// removed; planning skips matching categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryIgnoreEntry {
    /// Chunk category matching field
    pub category: String,
    /// Whether the category was removed locally
    #[serde(default)]
    pub is_delete: bool,
}

/// Per-channel SDK overlay delivered alongside third-party store builds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSdk {
    /// SDK version recorded in the config marker
    pub version: String,
    /// SDK archive
    pub package: crate::PackageArchive,
    /// `pkg_version`-style listing validating the extracted SDK
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkg_version_file_name: Option<String>,
}

/// One deprecated file to remove after install or update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprecatedFile {
    /// Path relative to the install root
    pub name: String,
}

/// Remote list of files to delete unconditionally after install/update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprecatedFileConfig {
    /// Relative paths to delete
    #[serde(default)]
    pub deprecated_files: Vec<DeprecatedFile>,
}

/// Branch tags for the chunk protocol family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// Version tag of the branch
    pub tag: String,
    /// Source versions a patch build can update from
    #[serde(default)]
    pub diff_tags: Vec<String>,
}

/// Main and predownload branch tags for one variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameBranches {
    /// Currently released branch
    pub main: BranchInfo,
    /// Upcoming branch published ahead of release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_download: Option<BranchInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_mode_names() {
        let json = r#""DOWNLOAD_MODE_CHUNK""#;
        let mode: DownloadMode = serde_json::from_str(json).unwrap();
        assert_eq!(mode, DownloadMode::Chunk);
        assert!(mode.is_chunked());
        assert!(!DownloadMode::CompressedPackage.is_chunked());
    }

    #[test]
    fn ignore_entry_round_trip() {
        let line = r#"{"category":"10302","is_delete":true}"#;
        let entry: CategoryIgnoreEntry = serde_json::from_str(line).unwrap();
        assert_eq!(entry.category, "10302");
        assert!(entry.is_delete);
    }

    #[test]
    fn branches_predownload_optional() {
        let json = r#"{"main": {"tag": "1.1.0", "diff_tags": ["1.0.0"]}}"#;
        let branches: GameBranches = serde_json::from_str(json).unwrap();
        assert_eq!(branches.main.tag, "1.1.0");
        assert!(branches.pre_download.is_none());
    }
}
