//! Legacy compressed-package manifest protocol
//!
//! The older of the two remote protocols: a build ships as one or more
//! game-body archives plus language-tagged audio archives, and updates ship
//! as diff archives keyed by the source version they patch from. Archives
//! larger than the CDN's volume limit are split into `.001`/`.002`...
//! segments that the decompress phase reads as one stream.

use serde::{Deserialize, Serialize};

use crate::{AudioLanguages, Error, Result};

/// A single downloadable archive (game body, audio pack, or segment)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageArchive {
    /// Download URL
    pub url: String,
    /// Compressed size in bytes
    pub size: u64,
    /// MD5 of the archive file, lowercase hex
    pub md5: String,
    /// Uncompressed payload size
    #[serde(default)]
    pub decompressed_size: u64,
    /// Audio locale code for audio packs, absent for game archives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl PackageArchive {
    /// File name portion of the download URL
    pub fn file_name(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(self.url.as_str())
    }
}

/// One complete archive set: either a full build or one diff step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSet {
    /// Target version for `major` sets, source version for diff sets
    pub version: String,
    /// Game-body archives, in volume order
    #[serde(default)]
    pub game_pkgs: Vec<PackageArchive>,
    /// Per-language audio archives
    #[serde(default)]
    pub audio_pkgs: Vec<PackageArchive>,
    /// URL prefix of the `pkg_version` ground-truth listing, when published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_list_url: Option<String>,
}

impl PackageSet {
    /// Archives needed for this set given an audio selection
    pub fn archives_for(&self, langs: AudioLanguages) -> Vec<&PackageArchive> {
        let mut out: Vec<&PackageArchive> = self.game_pkgs.iter().collect();
        for pkg in &self.audio_pkgs {
            let wanted = pkg
                .language
                .as_deref()
                .is_some_and(|code| langs.contains(AudioLanguages::from_locale(code)));
            if wanted {
                out.push(pkg);
            }
        }
        out
    }

    /// Total download size for the given audio selection
    pub fn download_size(&self, langs: AudioLanguages) -> u64 {
        self.archives_for(langs).iter().map(|a| a.size).sum()
    }
}

/// One protocol branch: the current full set plus diff sets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageBranch {
    /// Full archive set for the branch's version
    pub major: Option<PackageSet>,
    /// Diff sets keyed by the source version they patch from
    #[serde(default)]
    pub patches: Vec<PackageSet>,
}

impl PackageBranch {
    /// Diff set patching from `local_version`, if one is published
    pub fn patch_from(&self, local_version: &str) -> Option<&PackageSet> {
        self.patches.iter().find(|p| p.version == local_version)
    }
}

/// Remote package manifest for one variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamePackage {
    /// Currently released branch; always present
    pub main: PackageBranch,
    /// Upcoming version published ahead of release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_download: Option<PackageBranch>,
}

impl GamePackage {
    /// Enforce structural invariants after deserialization
    ///
    /// `main.major` must be present; a predownload branch, when present,
    /// must carry at least one archive set.
    pub fn validate(&self) -> Result<()> {
        let major = self
            .main
            .major
            .as_ref()
            .ok_or_else(|| Error::invalid_manifest("package manifest missing main.major"))?;
        if major.game_pkgs.is_empty() {
            return Err(Error::invalid_manifest(
                "package manifest main.major has no game archives",
            ));
        }
        if let Some(pre) = &self.pre_download {
            if pre.major.is_none() && pre.patches.is_empty() {
                return Err(Error::invalid_manifest(
                    "predownload branch has neither major nor patches",
                ));
            }
        }
        Ok(())
    }

    /// Version of the currently released build
    pub fn latest_version(&self) -> Option<&str> {
        self.main.major.as_deref_version()
    }

    /// Version published for predownload, if any
    pub fn predownload_version(&self) -> Option<&str> {
        self.pre_download
            .as_ref()
            .and_then(|b| b.major.as_deref_version())
    }
}

trait AsDerefVersion {
    fn as_deref_version(&self) -> Option<&str>;
}

impl AsDerefVersion for Option<PackageSet> {
    fn as_deref_version(&self) -> Option<&str> {
        self.as_ref().map(|set| set.version.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn archive(url: &str, size: u64, lang: Option<&str>) -> PackageArchive {
        PackageArchive {
            url: url.to_string(),
            size,
            md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            decompressed_size: size * 2,
            language: lang.map(str::to_string),
        }
    }

    fn sample_package() -> GamePackage {
        GamePackage {
            main: PackageBranch {
                major: Some(PackageSet {
                    version: "1.1.0".to_string(),
                    game_pkgs: vec![
                        archive("https://cdn.example.com/game_1.1.0.zip.001", 100, None),
                        archive("https://cdn.example.com/game_1.1.0.zip.002", 50, None),
                    ],
                    audio_pkgs: vec![
                        archive("https://cdn.example.com/audio_zh-cn.zip", 30, Some("zh-cn")),
                        archive("https://cdn.example.com/audio_ja-jp.zip", 40, Some("ja-jp")),
                    ],
                    res_list_url: Some("https://cdn.example.com/res".to_string()),
                }),
                patches: vec![PackageSet {
                    version: "1.0.0".to_string(),
                    game_pkgs: vec![archive("https://cdn.example.com/patch.zip", 10, None)],
                    audio_pkgs: vec![],
                    res_list_url: None,
                }],
            },
            pre_download: None,
        }
    }

    #[test]
    fn deserializes_remote_shape() {
        let json = r#"{
            "main": {
                "major": {
                    "version": "1.1.0",
                    "game_pkgs": [
                        {"url": "https://cdn.example.com/game.zip", "size": 42, "md5": "abc"}
                    ],
                    "audio_pkgs": []
                },
                "patches": []
            }
        }"#;
        let pkg: GamePackage = serde_json::from_str(json).unwrap();
        pkg.validate().unwrap();
        assert_eq!(pkg.latest_version(), Some("1.1.0"));
        assert_eq!(pkg.predownload_version(), None);
    }

    #[test]
    fn validate_requires_main_major() {
        let pkg = GamePackage {
            main: PackageBranch {
                major: None,
                patches: vec![],
            },
            pre_download: None,
        };
        assert!(pkg.validate().is_err());
    }

    #[test]
    fn audio_selection_filters_archives() {
        let pkg = sample_package();
        let major = pkg.main.major.as_ref().unwrap();
        let selected = major.archives_for(AudioLanguages::CHINESE);
        let names: Vec<&str> = selected.iter().map(|a| a.file_name()).collect();
        assert_eq!(
            names,
            vec!["game_1.1.0.zip.001", "game_1.1.0.zip.002", "audio_zh-cn.zip"]
        );
        assert_eq!(major.download_size(AudioLanguages::CHINESE), 180);
    }

    #[test]
    fn patch_lookup_by_source_version() {
        let pkg = sample_package();
        assert!(pkg.main.patch_from("1.0.0").is_some());
        assert!(pkg.main.patch_from("0.9.0").is_none());
    }
}
