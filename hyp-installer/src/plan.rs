//! Resource planning
//!
//! The planner is the single point where the two remote protocol families
//! meet the local install state. It fetches the right manifests for the
//! requested operation, decides between fresh install, diff update,
//! repair and predownload, and emits a normalized plan: flat download
//! tasks, chunk assembly plans, or patch merge operations. Everything
//! downstream operates on the plan, never on raw manifests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hyp_download::{ChunkFilePlan, ChunkSpec, DownloadTask, SliceReuse};
use hyp_manifest::{
    AudioLanguages, ChunkBuild, ChunkFile, GamePackage, GameVariant, MetadataClient, PackageSet,
    PatchBuild, PkgVersionEntry, VariantProfile,
};
use tracing::{debug, info};

use crate::{Error, InstallOperation, InstalledBuild, Result};

/// Directory under the install root caching predownloaded chunks
pub const CHUNK_CACHE_DIR: &str = "chunk";

/// Directory under the install root caching downloaded diff blobs
pub const LDIFF_DIR: &str = "ldiff";

/// One multi-volume archive group, extracted as a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveGroup {
    /// Volume file names relative to the install root, in order
    pub volumes: Vec<String>,
}

/// One file merged from a downloaded diff blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchMergeOp {
    /// Target path relative to the install root
    pub file_name: String,
    /// Size of the merged file
    pub size: u64,
    /// MD5 of the merged file
    pub md5: String,
    /// Diff blob id (stored under `ldiff/`)
    pub blob_id: String,
    /// Offset of this file's patch data within the blob
    pub patch_offset: u64,
    /// Length of this file's patch data
    pub patch_length: u64,
    /// Old file the diff applies to; absent when the patch data is the
    /// complete new file
    pub original_name: Option<String>,
    /// Whether the patch data is a compressed diff (run through the
    /// merge tool) rather than raw file bytes
    pub compressed: bool,
}

/// Protocol-normalized work description
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanMode {
    /// Whole archives to download, verify and extract
    Package {
        /// Flat download tasks (game body volumes + audio archives)
        tasks: Vec<DownloadTask>,
        /// Extraction groups in manifest order
        groups: Vec<ArchiveGroup>,
    },
    /// Chunk-protocol file assembly
    Chunk {
        /// Per-file assembly plans
        files: Vec<ChunkFilePlan>,
    },
    /// Predownload of raw chunks into the cache directory
    ChunkPredownload {
        /// Chunk payload downloads (`chunk/<id>`)
        tasks: Vec<DownloadTask>,
    },
    /// Diff-blob update: download blobs, merge per file, apply deletions
    Patch {
        /// Diff blob downloads (`ldiff/<id>`)
        tasks: Vec<DownloadTask>,
        /// Per-file merge operations
        merges: Vec<PatchMergeOp>,
        /// Files deleted after merging
        deletes: Vec<String>,
    },
    /// Predownload of diff blobs into `ldiff/`
    PatchPredownload {
        /// Diff blob downloads
        tasks: Vec<DownloadTask>,
    },
    /// Repair against a `pkg_version` ground-truth listing
    Repair {
        /// Single-file fetches resolved against the listing prefix
        tasks: Vec<DownloadTask>,
        /// The ground truth itself, for extraneous-file deletion
        ground_truth: Vec<PkgVersionEntry>,
    },
}

/// Output of the planner: everything one run needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    /// Operation the plan was produced for
    pub operation: InstallOperation,
    /// Version this plan converges the install to
    pub target_version: Option<String>,
    /// Version being predownloaded, for the config marker
    pub predownload_version: Option<String>,
    /// Normalized work description
    pub mode: PlanMode,
    /// Resolved hard-link source root, when the resolver found one
    pub link_root: Option<PathBuf>,
}

impl InstallPlan {
    /// Total bytes this plan downloads
    pub fn download_total(&self) -> u64 {
        match &self.mode {
            PlanMode::Package { tasks, .. }
            | PlanMode::ChunkPredownload { tasks }
            | PlanMode::Patch { tasks, .. }
            | PlanMode::PatchPredownload { tasks }
            | PlanMode::Repair { tasks, .. } => tasks.iter().map(|t| t.size).sum(),
            PlanMode::Chunk { files } => files.iter().map(ChunkFilePlan::download_size).sum(),
        }
    }

    /// Stat-based estimate of bytes already on disk
    ///
    /// A cheap optimistic resume estimate, never a correctness claim:
    /// the verify phase re-establishes truth.
    pub fn bytes_on_disk(&self, root: &Path) -> u64 {
        match &self.mode {
            PlanMode::Package { tasks, .. }
            | PlanMode::ChunkPredownload { tasks }
            | PlanMode::Patch { tasks, .. }
            | PlanMode::PatchPredownload { tasks }
            | PlanMode::Repair { tasks, .. } => {
                tasks.iter().map(|t| t.bytes_on_disk(root)).sum()
            }
            PlanMode::Chunk { .. } => 0,
        }
    }

    /// Attach a hard-link source root to every linkable entry
    ///
    /// Archives and cached blobs are not linked, only real game files:
    /// chunk-mode assembly targets and repair-mode fetches.
    pub fn attach_link_root(&mut self, link_root: &Path) {
        match &mut self.mode {
            PlanMode::Chunk { files } => {
                for file in files {
                    file.hard_link_source = Some(link_root.join(&file.file_name));
                }
            }
            PlanMode::Repair { tasks, .. } => {
                for task in tasks {
                    task.hard_link_source = Some(link_root.join(&task.file_name));
                }
            }
            _ => return,
        }
        self.link_root = Some(link_root.to_path_buf());
    }
}

/// Plans one operation by consulting the metadata service
#[derive(Debug, Clone, Copy)]
pub struct Planner<'a> {
    client: &'a MetadataClient,
}

impl<'a> Planner<'a> {
    /// Create a planner over a metadata client
    pub fn new(client: &'a MetadataClient) -> Self {
        Self { client }
    }

    /// Fetch manifests and produce the plan for one operation
    pub async fn prepare(
        &self,
        variant: &GameVariant,
        profile: &VariantProfile,
        local: &InstalledBuild,
        audio: AudioLanguages,
        operation: InstallOperation,
    ) -> Result<InstallPlan> {
        let ignored = crate::read_category_ignores(&local.install_path, profile).await?;
        let plan = match operation {
            InstallOperation::Install => {
                self.prepare_install(variant, profile, &local.install_path, audio, &ignored)
                    .await?
            }
            InstallOperation::Repair => {
                self.prepare_repair(variant, profile, local, audio, &ignored)
                    .await?
            }
            InstallOperation::Update | InstallOperation::Predownload => {
                self.prepare_update_or_predownload(variant, profile, local, audio, operation, &ignored)
                    .await?
            }
        };
        info!(
            "planned {operation} for {variant}: target {:?}, {} bytes to download",
            plan.target_version,
            plan.download_total()
        );
        Ok(plan)
    }

    async fn prepare_install(
        &self,
        variant: &GameVariant,
        profile: &VariantProfile,
        root: &Path,
        audio: AudioLanguages,
        ignored: &[String],
    ) -> Result<InstallPlan> {
        if profile.default_download_mode.is_chunked() {
            if let Some(build) = self.client.chunk_build(variant, "").await? {
                let files = self
                    .plan_chunk_files(root, &build, None, audio, ignored)
                    .await?;
                return Ok(InstallPlan {
                    operation: InstallOperation::Install,
                    target_version: Some(build.tag.clone()),
                    predownload_version: None,
                    mode: PlanMode::Chunk { files },
                    link_root: None,
                });
            }
            debug!("no chunk build published for {variant}, falling back to packages");
        }
        let package = self.client.game_package(variant).await?;
        let major = required_major(&package)?;
        let (tasks, groups) = plan_package_set(major, audio);
        Ok(InstallPlan {
            operation: InstallOperation::Install,
            target_version: Some(major.version.clone()),
            predownload_version: None,
            mode: PlanMode::Package { tasks, groups },
            link_root: None,
        })
    }

    async fn prepare_repair(
        &self,
        variant: &GameVariant,
        profile: &VariantProfile,
        local: &InstalledBuild,
        audio: AudioLanguages,
        ignored: &[String],
    ) -> Result<InstallPlan> {
        if profile.default_download_mode.is_chunked() {
            if let Some(build) = self.client.chunk_build(variant, "").await? {
                let local_build = match &local.version {
                    Some(version) => {
                        self.client
                            .chunk_build(variant, &version.to_string())
                            .await?
                    }
                    None => None,
                };
                let files = self
                    .plan_chunk_files(&local.install_path, &build, local_build.as_ref(), audio, ignored)
                    .await?;
                return Ok(InstallPlan {
                    operation: InstallOperation::Repair,
                    target_version: Some(build.tag.clone()),
                    predownload_version: None,
                    mode: PlanMode::Chunk { files },
                    link_root: None,
                });
            }
        }
        let package = self.client.game_package(variant).await?;
        let major = required_major(&package)?;
        let prefix = major.res_list_url.clone().ok_or_else(|| {
            Error::invalid_request(format!("{variant} publishes no pkg_version listing"))
        })?;
        let ground_truth = self.fetch_ground_truth(&prefix, audio).await?;
        let tasks = plan_repair_tasks(&prefix, &ground_truth);
        Ok(InstallPlan {
            operation: InstallOperation::Repair,
            target_version: Some(major.version.clone()),
            predownload_version: None,
            mode: PlanMode::Repair {
                tasks,
                ground_truth,
            },
            link_root: None,
        })
    }

    async fn prepare_update_or_predownload(
        &self,
        variant: &GameVariant,
        profile: &VariantProfile,
        local: &InstalledBuild,
        audio: AudioLanguages,
        operation: InstallOperation,
        ignored: &[String],
    ) -> Result<InstallPlan> {
        let local_version = local.version.as_ref().ok_or_else(|| Error::NoLocalVersion {
            install_path: local.install_path.display().to_string(),
        })?;
        let local_tag = local_version.to_string();

        if profile.default_download_mode.is_chunked() {
            let branches = self.client.branches(variant).await?;
            let (branch, predownload) = match operation {
                InstallOperation::Predownload => {
                    let pre = branches
                        .pre_download
                        .as_ref()
                        .ok_or(Error::AlreadyLatestVersion)?;
                    (pre, true)
                }
                _ => (&branches.main, false),
            };

            if branch.diff_tags.iter().any(|tag| *tag == local_tag) {
                if let Some(patch) = self.client.patch_build(variant, &branch.tag).await? {
                    return self
                        .plan_patch(&patch, &local_tag, audio, ignored, operation, predownload)
                        .await;
                }
            }

            let build = self
                .client
                .chunk_build(variant, if predownload { &branch.tag } else { "" })
                .await?
                .ok_or_else(|| {
                    Error::invalid_request(format!(
                        "no chunk build published for {variant} tag {}",
                        branch.tag
                    ))
                })?;
            if predownload {
                let tasks = self.plan_chunk_predownload(&build, audio, ignored).await?;
                return Ok(InstallPlan {
                    operation,
                    target_version: Some(branches.main.tag.clone()),
                    predownload_version: Some(build.tag.clone()),
                    mode: PlanMode::ChunkPredownload { tasks },
                    link_root: None,
                });
            }
            let local_build = self.client.chunk_build(variant, &local_tag).await?;
            let files = self
                .plan_chunk_files(&local.install_path, &build, local_build.as_ref(), audio, ignored)
                .await?;
            return Ok(InstallPlan {
                operation,
                target_version: Some(build.tag.clone()),
                predownload_version: None,
                mode: PlanMode::Chunk { files },
                link_root: None,
            });
        }

        let package = self.client.game_package(variant).await?;
        match operation {
            InstallOperation::Predownload => {
                let branch = package
                    .pre_download
                    .as_ref()
                    .ok_or(Error::AlreadyLatestVersion)?;
                let set = branch
                    .patch_from(&local_tag)
                    .or(branch.major.as_ref())
                    .ok_or(Error::AlreadyLatestVersion)?;
                let (tasks, groups) = plan_package_set(set, audio);
                Ok(InstallPlan {
                    operation,
                    target_version: package.latest_version().map(str::to_string),
                    predownload_version: Some(predownload_set_version(branch, set)),
                    mode: PlanMode::Package { tasks, groups },
                    link_root: None,
                })
            }
            _ => {
                let major = required_major(&package)?;
                let set = package.main.patch_from(&local_tag).unwrap_or(major);
                let (tasks, groups) = plan_package_set(set, audio);
                Ok(InstallPlan {
                    operation,
                    target_version: Some(major.version.clone()),
                    predownload_version: None,
                    mode: PlanMode::Package { tasks, groups },
                    link_root: None,
                })
            }
        }
    }

    async fn plan_patch(
        &self,
        patch: &PatchBuild,
        local_tag: &str,
        audio: AudioLanguages,
        ignored: &[String],
        operation: InstallOperation,
        predownload: bool,
    ) -> Result<InstallPlan> {
        let mut merges = Vec::new();
        let mut deletes = Vec::new();
        let mut blobs: HashMap<String, DownloadTask> = HashMap::new();

        for category in patch.select_categories(audio, ignored) {
            let index = self.client.patch_index(category).await?;
            deletes.extend(index.deletes_for(local_tag).iter().cloned());
            for file in &index.patches {
                let Some(source) = &file.patch else {
                    debug!("patch entry {} carries no source, skipped", file.name);
                    continue;
                };
                blobs.entry(source.id.clone()).or_insert_with(|| {
                    DownloadTask::new(
                        format!("{LDIFF_DIR}/{}", source.id),
                        category.diff_download.url_for(&source.id),
                        source.patch_file_size,
                        source.patch_file_md5.clone(),
                    )
                });
                merges.push(PatchMergeOp {
                    file_name: file.name.clone(),
                    size: file.size,
                    md5: file.md5.clone(),
                    blob_id: source.id.clone(),
                    patch_offset: source.patch_offset,
                    patch_length: source.patch_length,
                    original_name: source.original_name.clone(),
                    compressed: category.diff_download.is_compressed(),
                });
            }
        }
        // A file that is patched must not also be deleted
        deletes.retain(|name| !merges.iter().any(|m| m.file_name == *name));
        deletes.sort();
        deletes.dedup();

        let mut tasks: Vec<DownloadTask> = blobs.into_values().collect();
        tasks.sort_by(|a, b| a.file_name.cmp(&b.file_name));

        let mode = if predownload {
            PlanMode::PatchPredownload { tasks }
        } else {
            PlanMode::Patch {
                tasks,
                merges,
                deletes,
            }
        };
        Ok(InstallPlan {
            operation,
            target_version: Some(patch.tag.clone()),
            predownload_version: predownload.then(|| patch.tag.clone()),
            mode,
            link_root: None,
        })
    }

    /// Build per-file assembly plans, wiring reuse sources from the
    /// local version's chunk index
    async fn plan_chunk_files(
        &self,
        root: &Path,
        build: &ChunkBuild,
        local_build: Option<&ChunkBuild>,
        audio: AudioLanguages,
        ignored: &[String],
    ) -> Result<Vec<ChunkFilePlan>> {
        let mut files = Vec::new();
        for category in build.select_categories(audio, ignored) {
            let index = self.client.chunk_index(category).await?;
            let local_files: HashMap<String, ChunkFile> = match local_build
                .and_then(|b| b.category(&category.matching_field))
            {
                Some(local_category) => self
                    .client
                    .chunk_index(local_category)
                    .await?
                    .files
                    .into_iter()
                    .filter(|f| !f.is_directory)
                    .map(|f| (f.name.clone(), f))
                    .collect(),
                None => HashMap::new(),
            };
            for file in index.regular_files() {
                files.push(chunk_file_plan(root, file, local_files.get(&file.name), category));
            }
        }
        Ok(files)
    }

    /// Plan raw chunk downloads into the cache directory, deduplicated
    /// by chunk id
    ///
    /// Reuse sources are only consulted during assembly, which
    /// predownload defers; every referenced chunk is cached.
    async fn plan_chunk_predownload(
        &self,
        build: &ChunkBuild,
        audio: AudioLanguages,
        ignored: &[String],
    ) -> Result<Vec<DownloadTask>> {
        let mut tasks: HashMap<String, DownloadTask> = HashMap::new();
        for category in build.select_categories(audio, ignored) {
            let index = self.client.chunk_index(category).await?;
            for file in index.regular_files() {
                for chunk in &file.chunks {
                    tasks.entry(chunk.id.clone()).or_insert_with(|| {
                        DownloadTask::new(
                            format!("{CHUNK_CACHE_DIR}/{}", chunk.id),
                            category.chunk_download.url_for(&chunk.id),
                            chunk.compressed_size,
                            chunk.compressed_md5.clone(),
                        )
                    });
                }
            }
        }
        let mut tasks: Vec<DownloadTask> = tasks.into_values().collect();
        tasks.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(tasks)
    }

    /// Fetch the pkg_version ground truth, including the per-language
    /// audio listings for the selected languages
    async fn fetch_ground_truth(
        &self,
        prefix: &str,
        audio: AudioLanguages,
    ) -> Result<Vec<PkgVersionEntry>> {
        let mut entries = self.client.pkg_version(prefix, "pkg_version").await?;
        for name in audio.marker_lines() {
            let listing = format!("Audio_{name}_pkg_version");
            entries.extend(self.client.pkg_version(prefix, &listing).await?);
        }
        Ok(entries)
    }
}

fn required_major(package: &GamePackage) -> Result<&PackageSet> {
    package
        .main
        .major
        .as_ref()
        .ok_or_else(|| Error::Manifest(hyp_manifest::Error::invalid_manifest("missing main.major")))
}

fn predownload_set_version(
    branch: &hyp_manifest::PackageBranch,
    set: &PackageSet,
) -> String {
    // Diff sets are keyed by source version; the branch's major names the
    // version actually being predownloaded
    branch
        .major
        .as_ref()
        .map_or_else(|| set.version.clone(), |major| major.version.clone())
}

/// Plan the archives of one package set: flat tasks plus extraction
/// groups in manifest order
pub(crate) fn plan_package_set(
    set: &PackageSet,
    audio: AudioLanguages,
) -> (Vec<DownloadTask>, Vec<ArchiveGroup>) {
    let mut tasks = Vec::new();
    let mut groups = Vec::new();

    let multi_volume = set.game_pkgs.len() > 1;
    let mut body_volumes = Vec::new();
    for archive in &set.game_pkgs {
        let name = archive.file_name().to_string();
        let mut task = DownloadTask::new(&name, &archive.url, archive.size, &archive.md5);
        if multi_volume {
            task = task.segment();
        }
        tasks.push(task);
        body_volumes.push(name);
    }
    if !body_volumes.is_empty() {
        groups.push(ArchiveGroup {
            volumes: body_volumes,
        });
    }

    for archive in &set.audio_pkgs {
        let wanted = archive
            .language
            .as_deref()
            .is_some_and(|code| audio.contains(AudioLanguages::from_locale(code)));
        if !wanted {
            continue;
        }
        let name = archive.file_name().to_string();
        tasks.push(DownloadTask::new(&name, &archive.url, archive.size, &archive.md5));
        groups.push(ArchiveGroup {
            volumes: vec![name],
        });
    }
    (tasks, groups)
}

/// Single-file repair tasks against a listing prefix
pub(crate) fn plan_repair_tasks(
    prefix: &str,
    ground_truth: &[PkgVersionEntry],
) -> Vec<DownloadTask> {
    ground_truth
        .iter()
        .map(|entry| {
            DownloadTask::prefixed(&entry.remote_name, prefix, entry.file_size, &entry.md5)
        })
        .collect()
}

/// Build a chunk assembly plan for one file, wiring slice reuse against
/// the local version's copy of the same file
fn chunk_file_plan(
    root: &Path,
    file: &ChunkFile,
    local: Option<&ChunkFile>,
    category: &hyp_manifest::ChunkCategory,
) -> ChunkFilePlan {
    let chunks = file
        .chunks
        .iter()
        .map(|chunk| {
            let reuse = local.and_then(|local_file| {
                local_file
                    .chunks
                    .iter()
                    .find(|lc| lc.uncompressed_md5 == chunk.uncompressed_md5)
                    .map(|lc| SliceReuse {
                        path: root.join(&local_file.name),
                        offset: lc.offset,
                        file_size: local_file.size,
                    })
            });
            ChunkSpec {
                id: chunk.id.clone(),
                url: category.chunk_download.url_for(&chunk.id),
                offset: chunk.offset,
                compressed_size: chunk.compressed_size,
                uncompressed_size: chunk.uncompressed_size,
                compressed_md5: chunk.compressed_md5.clone(),
                uncompressed_md5: chunk.uncompressed_md5.clone(),
                reuse,
            }
        })
        .collect();
    ChunkFilePlan {
        file_name: file.name.clone(),
        size: file.size,
        md5: file.md5.clone(),
        chunks,
        hard_link_source: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyp_manifest::PackageArchive;

    fn archive(url: &str, size: u64, lang: Option<&str>) -> PackageArchive {
        PackageArchive {
            url: url.to_string(),
            size,
            md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            decompressed_size: 0,
            language: lang.map(str::to_string),
        }
    }

    #[test]
    fn package_set_plans_volumes_and_selected_audio() {
        let set = PackageSet {
            version: "1.1.0".to_string(),
            game_pkgs: vec![
                archive("https://cdn/game.zip.001", 100, None),
                archive("https://cdn/game.zip.002", 50, None),
            ],
            audio_pkgs: vec![
                archive("https://cdn/audio_zh-cn.zip", 30, Some("zh-cn")),
                archive("https://cdn/audio_ja-jp.zip", 40, Some("ja-jp")),
            ],
            res_list_url: None,
        };

        let (tasks, groups) = plan_package_set(&set, AudioLanguages::JAPANESE);
        let names: Vec<&str> = tasks.iter().map(|t| t.file_name.as_str()).collect();
        assert_eq!(names, vec!["game.zip.001", "game.zip.002", "audio_ja-jp.zip"]);
        assert!(tasks[0].is_segment && tasks[1].is_segment);
        assert!(!tasks[2].is_segment);
        assert_eq!(
            groups,
            vec![
                ArchiveGroup {
                    volumes: vec!["game.zip.001".to_string(), "game.zip.002".to_string()]
                },
                ArchiveGroup {
                    volumes: vec!["audio_ja-jp.zip".to_string()]
                },
            ]
        );
    }

    #[test]
    fn single_volume_body_is_not_a_segment() {
        let set = PackageSet {
            version: "1.1.0".to_string(),
            game_pkgs: vec![archive("https://cdn/game.zip", 100, None)],
            audio_pkgs: vec![],
            res_list_url: None,
        };
        let (tasks, groups) = plan_package_set(&set, AudioLanguages::NONE);
        assert!(!tasks[0].is_segment);
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn repair_tasks_resolve_against_prefix() {
        let entries = vec![PkgVersionEntry {
            remote_name: "data/blocks.bin".to_string(),
            md5: "aa".to_string(),
            file_size: 9,
        }];
        let tasks = plan_repair_tasks("https://cdn/res", &entries);
        assert_eq!(tasks[0].resolve_url(), "https://cdn/res/data/blocks.bin");
        assert_eq!(tasks[0].size, 9);
    }

    #[test]
    fn plan_totals_and_link_attachment() {
        let tasks = vec![
            DownloadTask::prefixed("a.bin", "https://cdn/res", 5, "00"),
            DownloadTask::prefixed("b.bin", "https://cdn/res", 7, "00"),
        ];
        let mut plan = InstallPlan {
            operation: InstallOperation::Repair,
            target_version: Some("1.1.0".to_string()),
            predownload_version: None,
            mode: PlanMode::Repair {
                tasks,
                ground_truth: vec![],
            },
            link_root: None,
        };
        assert_eq!(plan.download_total(), 12);

        plan.attach_link_root(Path::new("/games/sibling"));
        let PlanMode::Repair { tasks, .. } = &plan.mode else {
            panic!("mode changed");
        };
        assert_eq!(
            tasks[0].hard_link_source.as_deref(),
            Some(Path::new("/games/sibling/a.bin"))
        );
        assert_eq!(plan.link_root.as_deref(), Some(Path::new("/games/sibling")));
    }
}
