//! Hard-link source resolution
//!
//! Before planning, sibling installs of the same title (other regions or
//! channels) are inspected: one on the same volume, on a filesystem that
//! supports hard links, becomes the link source root. The download engine
//! then tries a link before fetching any file whose relative path and
//! checksum match. Linking is strictly an optimization and every failure
//! falls back to the network, so resolution errs on the side of `None`.

use std::path::{Path, PathBuf};

use hyp_manifest::{GameVariant, VariantProfile};
use tracing::{debug, info};

use crate::SiblingInstall;

/// Hard link probe file name
const PROBE_FILE: &str = ".hyp_hard_link_probe";

/// Whether two paths live on the same volume
///
/// On Unix this compares device ids; elsewhere it falls back to the path
/// root component.
pub fn same_volume(a: &Path, b: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match (nearest_metadata(a), nearest_metadata(b)) {
            (Some(meta_a), Some(meta_b)) => meta_a.dev() == meta_b.dev(),
            _ => false,
        }
    }
    #[cfg(not(unix))]
    {
        let root = |p: &Path| p.components().next().map(|c| c.as_os_str().to_owned());
        match (root(a), root(b)) {
            (Some(ra), Some(rb)) => ra == rb,
            _ => false,
        }
    }
}

#[cfg(unix)]
fn nearest_metadata(path: &Path) -> Option<std::fs::Metadata> {
    let mut current = Some(path);
    while let Some(p) = current {
        if let Ok(meta) = p.metadata() {
            return Some(meta);
        }
        current = p.parent();
    }
    None
}

/// Probe whether the filesystem under `dir` supports hard links
///
/// Creates a probe file, links it next to itself, and cleans both up.
pub fn probe_hard_link_support(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let source = dir.join(PROBE_FILE);
    let target = dir.join(format!("{PROBE_FILE}_link"));
    let _ = std::fs::remove_file(&source);
    let _ = std::fs::remove_file(&target);
    if std::fs::write(&source, b"probe").is_err() {
        return false;
    }
    let supported = std::fs::hard_link(&source, &target).is_ok();
    let _ = std::fs::remove_file(&target);
    let _ = std::fs::remove_file(&source);
    if !supported {
        info!("hard links not supported under {}", dir.display());
    }
    supported
}

/// Pick a link source root among sibling installs
///
/// Eligibility: the variant's profile allows linking and the user enabled
/// it. Candidates must be true siblings (same title, different region)
/// with an install path on the same volume as `install_path`. Among
/// candidates, one with a running task wins over idle installs, then the
/// highest detected version.
pub fn resolve_link_root(
    variant: &GameVariant,
    install_path: &Path,
    profile: &VariantProfile,
    enabled: bool,
    siblings: &[SiblingInstall],
) -> Option<PathBuf> {
    if !enabled || !profile.hard_link_eligible {
        return None;
    }
    if !probe_hard_link_support(install_path) {
        return None;
    }

    let mut candidates: Vec<&SiblingInstall> = siblings
        .iter()
        .filter(|s| s.variant.is_sibling_of(variant))
        .filter(|s| s.install_path != install_path)
        .filter(|s| same_volume(install_path, &s.install_path))
        .collect();
    if candidates.is_empty() {
        return None;
    }

    // Prefer a sibling with an active task, then the newest local build
    candidates.sort_by(|a, b| {
        b.active
            .cmp(&a.active)
            .then_with(|| b.version.cmp(&a.version))
    });
    let chosen = candidates[0];
    debug!(
        "hard-link source for {variant}: {} (version {:?}, active {})",
        chosen.install_path.display(),
        chosen.version,
        chosen.active
    );
    Some(chosen.install_path.clone())
}
