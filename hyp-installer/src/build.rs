//! Local installed-build inspection
//!
//! The install root carries two small marker files:
//!
//! - `config.ini` — `key=value` lines under a `[General]` section
//!   recording the installed version, channel values and SDK version;
//!   written only on successful finish
//! - an audio-language marker (path from the variant profile) — one
//!   display name per line, maintained by the game itself
//!
//! Both are re-read at the start of every pipeline run and never cached
//! across runs: the directory may have been modified externally.

use std::path::{Path, PathBuf};

use hyp_manifest::{AudioLanguages, CategoryIgnoreEntry, GameVersion, VariantProfile};
use tracing::{debug, warn};

use crate::Result;

/// File name of the config marker inside the install root
pub const CONFIG_MARKER: &str = "config.ini";

/// Ordered `key=value` content of the config marker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMarker {
    entries: Vec<(String, String)>,
}

impl ConfigMarker {
    /// Load the marker from an install root; `None` when absent
    pub async fn load(install_path: &Path) -> Result<Option<Self>> {
        let path = install_path.join(CONFIG_MARKER);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("config marker not found: {}", path.display());
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('[') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.push((key.trim().to_string(), value.trim().to_string()));
            }
        }
        Ok(Some(Self { entries }))
    }

    /// Write the marker back under a `[General]` section
    pub async fn save(&self, install_path: &Path) -> Result<()> {
        let mut out = String::from("[General]\n");
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        tokio::fs::create_dir_all(install_path).await?;
        tokio::fs::write(install_path.join(CONFIG_MARKER), out).await?;
        Ok(())
    }

    /// Look up a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace a key
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Remove a key if present
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    /// Parsed `game_version` value
    pub fn game_version(&self) -> Option<GameVersion> {
        self.get("game_version").and_then(GameVersion::parse)
    }

    /// Recorded `sdk_version` value
    pub fn sdk_version(&self) -> Option<&str> {
        self.get("sdk_version").filter(|v| !v.is_empty())
    }

    /// Recorded `predownload` value
    pub fn predownload(&self) -> Option<&str> {
        self.get("predownload").filter(|v| !v.is_empty())
    }
}

/// Snapshot of the local install, re-read per run
#[derive(Debug, Clone)]
pub struct InstalledBuild {
    /// Install root
    pub install_path: PathBuf,
    /// Version from the config marker, if any
    pub version: Option<GameVersion>,
    /// SDK version from the config marker
    pub sdk_version: Option<String>,
    /// Pending predownload record, if any
    pub predownload: Option<String>,
    /// Audio languages detected from the marker file
    pub audio_languages: AudioLanguages,
}

impl InstalledBuild {
    /// Inspect an install root
    pub async fn detect(install_path: &Path, profile: &VariantProfile) -> Result<Self> {
        let marker = ConfigMarker::load(install_path).await?;
        let audio_languages = read_audio_marker(install_path, profile).await?;
        Ok(Self {
            install_path: install_path.to_path_buf(),
            version: marker.as_ref().and_then(ConfigMarker::game_version),
            sdk_version: marker
                .as_ref()
                .and_then(|m| m.sdk_version().map(str::to_string)),
            predownload: marker
                .as_ref()
                .and_then(|m| m.predownload().map(str::to_string)),
            audio_languages,
        })
    }
}

/// Read the audio-language marker
pub async fn read_audio_marker(
    install_path: &Path,
    profile: &VariantProfile,
) -> Result<AudioLanguages> {
    let Some(scan_file) = &profile.audio_scan_file else {
        return Ok(AudioLanguages::NONE);
    };
    let path = install_path.join(scan_file);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(AudioLanguages::from_marker_lines(content.lines())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(AudioLanguages::NONE),
        Err(err) => Err(err.into()),
    }
}

/// Write the audio-language marker
pub async fn write_audio_marker(
    install_path: &Path,
    profile: &VariantProfile,
    langs: AudioLanguages,
) -> Result<()> {
    let Some(scan_file) = &profile.audio_scan_file else {
        return Ok(());
    };
    let path = install_path.join(scan_file);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut content = langs.marker_lines().join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    tokio::fs::write(&path, content).await?;
    Ok(())
}

/// Read the category ignore list the game maintains inside the install
/// tree; categories marked deleted are skipped during planning
pub async fn read_category_ignores(
    install_path: &Path,
    profile: &VariantProfile,
) -> Result<Vec<String>> {
    let Some(rel) = &profile.res_category_dir else {
        return Ok(Vec::new());
    };
    let path = install_path.join(rel);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut ignored = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<CategoryIgnoreEntry>(line) {
            Ok(entry) if entry.is_delete && !entry.category.is_empty() => {
                ignored.push(entry.category);
            }
            Ok(_) => {}
            Err(err) => warn!("malformed category ignore line skipped: {err}"),
        }
    }
    Ok(ignored)
}
