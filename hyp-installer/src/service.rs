//! Install state machine
//!
//! Drives one [`InstallTask`] through `Prepare → Download → Verify →
//! Decompress → Merge → Finish`. `Error` is reachable from any phase;
//! cancellation returns the task to `None` and records the phase it was
//! cancelled in, because a task cancelled mid-`Download` may continue
//! without re-planning: the task list is reused and on-disk sizes are
//! re-stated. A task cancelled in any other phase re-plans from
//! `Prepare`, since manifests may have changed under it.
//!
//! Repair skips Decompress/Merge entirely: repaired files download to
//! their final relative paths, are verified in place, and files absent
//! from the ground-truth listing are deleted.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyp_download::{
    check_file_md5, ChunkAssembler, Downloader, DownloadTask, RateLimiter, Verifier,
};
use hyp_manifest::{ChannelSdk, GameVariant, MetadataClient, PkgVersionEntry, VariantProfile};
use hyp_unpack::{
    apply_delete_list, apply_hdiff_entry, clear_hdiff_list, extract_package, read_hdiff_list,
    FileSliceStream, HpatchTool,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::plan::{ArchiveGroup, PatchMergeOp, CHUNK_CACHE_DIR, LDIFF_DIR};
use crate::{
    read_audio_marker, write_audio_marker, ConfigMarker, Error, InstallOperation, InstallPhase,
    InstallPlan, InstallTask, InstalledBuild, PlanMode, Planner, Result, TaskHandle,
};

/// Work directory for partially staged content
const STAGING_DIR: &str = "staging";

/// Executes install operations against one install root at a time
#[derive(Debug, Clone)]
pub struct InstallService {
    client: MetadataClient,
    limiter: Arc<RateLimiter>,
    downloader: Downloader,
    assembler: ChunkAssembler,
    hpatch: HpatchTool,
}

impl InstallService {
    /// Create a service over a metadata client and a shared limiter
    pub fn new(
        client: MetadataClient,
        limiter: Arc<RateLimiter>,
        hpatch: HpatchTool,
    ) -> Result<Self> {
        let downloader = Downloader::new(Arc::clone(&limiter)).map_err(Error::Download)?;
        let assembler = ChunkAssembler::new(Arc::clone(&limiter)).map_err(Error::Download)?;
        Ok(Self {
            client,
            limiter,
            downloader,
            assembler,
            hpatch,
        })
    }

    /// The shared rate limiter
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The metadata client
    pub fn client(&self) -> &MetadataClient {
        &self.client
    }

    /// Run one operation to a terminal state
    ///
    /// Cancellation puts the task into `None` with its resume phase
    /// recorded; any other failure lands in `Error` with the message
    /// handed to the control plane verbatim.
    pub async fn run(&self, task: &mut InstallTask) -> Result<()> {
        let handle = Arc::clone(&task.handle);
        let cancel = handle.cancellation_token();
        handle.set_error(None);
        info!(
            "starting {} for {} at {}",
            task.request.operation,
            task.request.variant,
            task.request.install_path.display()
        );

        let result = self.run_phases(task, &cancel).await;
        match &result {
            Ok(()) => {
                handle.set_phase(InstallPhase::Finish);
                info!("{} finished for {}", task.request.operation, task.request.variant);
            }
            Err(err) if err.is_cancelled() => {
                task.resume_phase = handle.phase();
                handle.set_phase(InstallPhase::None);
                info!(
                    "{} cancelled for {} during {}",
                    task.request.operation, task.request.variant, task.resume_phase
                );
            }
            Err(err) => {
                handle.set_error(Some(err.to_string()));
                handle.set_phase(InstallPhase::Error);
                warn!("{} failed for {}: {err}", task.request.operation, task.request.variant);
            }
        }
        result
    }

    async fn run_phases(&self, task: &mut InstallTask, cancel: &CancellationToken) -> Result<()> {
        let request = task.request.clone();
        let root = request.install_path.clone();
        let handle = Arc::clone(&task.handle);
        tokio::fs::create_dir_all(&root).await?;

        let profile = self.client.variant_profile(&request.variant).await?;

        if task.can_resume_download() {
            debug!("resuming {} in download phase, plan reused", request.variant);
        } else {
            handle.set_phase(InstallPhase::Prepare);
            task.plan = Some(
                self.prepare(&request, &profile, &root).await?,
            );
        }
        task.resume_phase = InstallPhase::None;
        let plan = task
            .plan
            .clone()
            .ok_or_else(|| Error::invalid_request("no plan after prepare"))?;

        self.download_phase(&root, &plan, &handle, cancel).await?;
        self.verify_phase(&root, &request, &plan, &handle, cancel)
            .await?;
        self.content_phase(&root, &profile, &plan, &handle, cancel)
            .await?;
        self.finish_phase(&request, &profile, &plan).await?;
        Ok(())
    }

    async fn prepare(
        &self,
        request: &crate::InstallRequest,
        profile: &VariantProfile,
        root: &Path,
    ) -> Result<InstallPlan> {
        let local = InstalledBuild::detect(root, profile).await?;
        let audio = if request.audio.is_empty() {
            local.audio_languages
        } else {
            request.audio
        };
        if !audio.is_empty() {
            // Persisted so later repairs use the same selection without
            // re-asking the user
            write_audio_marker(root, profile, audio).await?;
        }

        let planner = Planner::new(&self.client);
        let mut plan = planner
            .prepare(&request.variant, profile, &local, audio, request.operation)
            .await?;

        if let Some(link_root) = crate::resolve_link_root(
            &request.variant,
            root,
            profile,
            request.hard_link_enabled,
            &request.siblings,
        ) {
            plan.attach_link_root(&link_root);
        }
        Ok(plan)
    }

    async fn download_phase(
        &self,
        root: &Path,
        plan: &InstallPlan,
        handle: &TaskHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        handle.set_phase(InstallPhase::Download);
        match &plan.mode {
            PlanMode::Package { tasks, .. }
            | PlanMode::ChunkPredownload { tasks }
            | PlanMode::PatchPredownload { tasks }
            | PlanMode::Patch { tasks, .. } => {
                self.downloader
                    .download_all(root, tasks, &handle.download, cancel)
                    .await?;
            }
            PlanMode::Chunk { files } => {
                let cache = root.join(CHUNK_CACHE_DIR);
                let cache = cache.exists().then_some(cache);
                self.assembler
                    .assemble_all(root, files, cache.as_deref(), &handle.download, cancel)
                    .await?;
            }
            PlanMode::Repair { tasks, .. } => {
                let pending = self.repair_prefilter(root, tasks, cancel).await?;
                self.downloader
                    .download_all(root, &pending, &handle.download, cancel)
                    .await?;
            }
        }
        Ok(())
    }

    /// Drop repair tasks whose on-disk file already matches ground
    /// truth, and discard files that do not: their bytes are known bad.
    async fn repair_prefilter(
        &self,
        root: &Path,
        tasks: &[DownloadTask],
        cancel: &CancellationToken,
    ) -> Result<Vec<DownloadTask>> {
        let mut pending = Vec::new();
        for task in tasks {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let final_path = task.final_path(root);
            if check_file_md5(&final_path, task.size, &task.md5).await? {
                continue;
            }
            if final_path.exists() && final_path.metadata()?.len() >= task.size {
                // Same-or-larger but wrong content: resuming in place
                // cannot converge, start the file over
                tokio::fs::remove_file(&final_path).await?;
            }
            pending.push(task.clone());
        }
        info!("repair: {} of {} files need fixing", pending.len(), tasks.len());
        Ok(pending)
    }

    async fn verify_phase(
        &self,
        root: &Path,
        request: &crate::InstallRequest,
        plan: &InstallPlan,
        handle: &TaskHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        handle.set_phase(InstallPhase::Verify);
        let tasks: &[DownloadTask] = match &plan.mode {
            PlanMode::Package { tasks, .. }
            | PlanMode::ChunkPredownload { tasks }
            | PlanMode::PatchPredownload { tasks }
            | PlanMode::Patch { tasks, .. }
            | PlanMode::Repair { tasks, .. } => tasks,
            // Chunk assembly verifies and promotes each file itself
            PlanMode::Chunk { .. } => return Ok(()),
        };
        let verifier = Verifier::new().skip_verify(request.skip_verify);
        match verifier
            .verify_all(root, tasks, &handle.download, cancel)
            .await
        {
            Ok(()) => Ok(()),
            Err(hyp_download::Error::ChecksumMismatch { files }) => {
                // The offending bytes are known bad: discard them so the
                // next download run starts those files from scratch
                for task in tasks.iter().filter(|t| files.contains(&t.file_name)) {
                    if let Some(resident) = task.resident_path(root) {
                        warn!("discarding corrupt file {}", resident.display());
                        tokio::fs::remove_file(&resident).await?;
                    }
                }
                Err(Error::Download(hyp_download::Error::ChecksumMismatch { files }))
            }
            Err(err) => Err(Error::Download(err)),
        }
    }

    /// Decompress/Merge for package plans, Merge for patch plans,
    /// extraneous-file deletion for repair
    async fn content_phase(
        &self,
        root: &Path,
        profile: &VariantProfile,
        plan: &InstallPlan,
        handle: &TaskHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match &plan.mode {
            PlanMode::Package { groups, .. }
                if plan.operation != InstallOperation::Predownload =>
            {
                self.decompress_groups(root, groups, handle, cancel).await
            }
            PlanMode::Patch {
                merges, deletes, ..
            } => self.merge_patch_files(root, merges, deletes, handle, cancel).await,
            PlanMode::Repair { ground_truth, .. } => {
                self.delete_extraneous_files(root, profile, ground_truth).await
            }
            _ => Ok(()),
        }
    }

    async fn decompress_groups(
        &self,
        root: &Path,
        groups: &[ArchiveGroup],
        handle: &TaskHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut total = 0u64;
        for group in groups {
            for volume in &group.volumes {
                if let Ok(meta) = root.join(volume).metadata() {
                    total += meta.len();
                }
            }
        }
        handle.content.start_phase(total, groups.len() as u64);

        for group in groups {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let volumes: Vec<PathBuf> = group.volumes.iter().map(|v| root.join(v)).collect();
            if volumes.iter().any(|v| !v.exists()) {
                // Already consumed by a previous run
                debug!("archive group {:?} already extracted", group.volumes.first());
                handle.content.finish_file();
                continue;
            }

            handle.set_phase(InstallPhase::Decompress);
            let progress = Arc::clone(&handle.content);
            let target = root.to_path_buf();
            tokio::task::spawn_blocking(move || {
                extract_package(&volumes, &target, |delta| progress.add_bytes(delta))
            })
            .await
            .map_err(|err| Error::Io(std::io::Error::other(err.to_string())))??;
            handle.content.finish_file();

            // Diff application for a package happens strictly after that
            // package's extraction, preserving manifest patch order
            handle.set_phase(InstallPhase::Merge);
            apply_delete_list(root).await?;
            if let Some(entries) = read_hdiff_list(root).await? {
                info!("merging {} binary diffs", entries.len());
                for entry in &entries {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    apply_hdiff_entry(root, &self.hpatch, entry).await?;
                }
                clear_hdiff_list(root).await?;
            }
        }
        Ok(())
    }

    async fn merge_patch_files(
        &self,
        root: &Path,
        merges: &[PatchMergeOp],
        deletes: &[String],
        handle: &TaskHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        handle.set_phase(InstallPhase::Merge);
        handle
            .content
            .start_phase(merges.iter().map(|m| m.size).sum(), merges.len() as u64);

        let mut failed: Vec<String> = Vec::new();
        for op in merges {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let target = root.join(&op.file_name);
            if check_file_md5(&target, op.size, &op.md5).await? {
                handle.content.add_bytes(op.size);
                handle.content.finish_file();
                continue;
            }
            match self.apply_patch_op(root, op).await {
                Ok(()) => {
                    handle.content.add_bytes(op.size);
                    handle.content.finish_file();
                }
                Err(err) => {
                    warn!("merge failed for {}: {err}", op.file_name);
                    failed.push(op.file_name.clone());
                }
            }
        }
        if !failed.is_empty() {
            return Err(Error::MergeFailed { files: failed });
        }

        let mut deleted = 0usize;
        for name in deletes {
            let path = root.join(name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        info!("patch merge done, {deleted} files deleted");
        Ok(())
    }

    /// Merge one file out of its diff blob
    ///
    /// The file's patch data is a window of a shared blob; it is sliced
    /// out to a scratch file first because the external tool reads whole
    /// files. Raw (uncompressed) windows are the complete new file and
    /// are copied directly. Merges always land on `<target>_tmp` and
    /// replace the target only on success.
    async fn apply_patch_op(&self, root: &Path, op: &PatchMergeOp) -> Result<()> {
        let target = root.join(&op.file_name);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let blob = root.join(LDIFF_DIR).join(&op.blob_id);
        let scratch = root
            .join(LDIFF_DIR)
            .join(format!("{}_{}.diff", op.blob_id, op.patch_offset));

        let blob_clone = blob.clone();
        let scratch_clone = scratch.clone();
        let (offset, length) = (op.patch_offset, op.patch_length);
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut slice = FileSliceStream::open(&blob_clone, offset, length)?;
            let mut out = std::fs::File::create(&scratch_clone)?;
            std::io::copy(&mut slice, &mut out)?;
            Ok(())
        })
        .await
        .map_err(|err| Error::Io(std::io::Error::other(err.to_string())))??;

        let result = if op.compressed {
            let source = match &op.original_name {
                Some(name) => {
                    let source = root.join(name);
                    if !source.exists() {
                        tokio::fs::remove_file(&scratch).await.ok();
                        return Err(Error::Unpack(hyp_unpack::Error::SourceMissing {
                            path: source,
                        }));
                    }
                    Some(source)
                }
                None => None,
            };
            self.hpatch
                .patch_and_replace(source.as_deref(), &scratch, &target)
                .await
                .map_err(Error::Unpack)
        } else {
            // The window is the complete new file
            let tmp = root.join(format!("{}_tmp", op.file_name));
            tokio::fs::rename(&scratch, &tmp).await?;
            tokio::fs::rename(&tmp, &target).await.map_err(Error::Io)
        };

        tokio::fs::remove_file(&scratch).await.ok();
        if result.is_ok() {
            if let Some(name) = &op.original_name {
                let original = root.join(name);
                if original != target && original.exists() {
                    tokio::fs::remove_file(&original).await?;
                }
            }
        }
        result
    }

    /// Repair: anything on disk absent from the ground truth is deleted
    ///
    /// The pipeline's own files (markers, caches, temp files handled by
    /// cleanup) are exempt.
    async fn delete_extraneous_files(
        &self,
        root: &Path,
        profile: &VariantProfile,
        ground_truth: &[PkgVersionEntry],
    ) -> Result<()> {
        let mut expected: HashSet<String> = ground_truth
            .iter()
            .map(|e| e.remote_name.replace('\\', "/"))
            .collect();
        // The marker files the pipeline and the game maintain stay put
        for keep in [&profile.audio_scan_file, &profile.res_category_dir] {
            if let Some(keep) = keep {
                expected.insert(keep.replace('\\', "/"));
            }
        }
        let root_owned = root.to_path_buf();
        let removed = tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
            let mut removed = 0usize;
            for entry in walkdir::WalkDir::new(&root_owned)
                .into_iter()
                .filter_map(std::result::Result::ok)
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root_owned) else {
                    continue;
                };
                let name = relative.to_string_lossy().replace('\\', "/");
                if expected.contains(&name) || is_pipeline_file(&name) {
                    continue;
                }
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
            Ok(removed)
        })
        .await
        .map_err(|err| Error::Io(std::io::Error::other(err.to_string())))??;
        info!("repair removed {removed} files not in ground truth");
        Ok(())
    }

    async fn finish_phase(
        &self,
        request: &crate::InstallRequest,
        profile: &VariantProfile,
        plan: &InstallPlan,
    ) -> Result<()> {
        let root = &request.install_path;
        let sdk_version = if plan.operation == InstallOperation::Predownload {
            None
        } else {
            self.ensure_channel_sdk(&request.variant, root).await?
        };

        let mut marker = ConfigMarker::load(root).await?.unwrap_or_default();
        if plan.operation == InstallOperation::Predownload {
            let local = marker
                .game_version()
                .map_or_else(String::new, |v| v.to_string());
            let audio = read_audio_marker(root, profile).await?;
            let pre = plan.predownload_version.clone().unwrap_or_default();
            marker.set("predownload", format!("{local},{pre},{audio}"));
        } else {
            if let Some(version) = &plan.target_version {
                marker.set("game_version", version.clone());
            }
            marker.remove("predownload");
        }
        let region = request.variant.region();
        marker.set("channel", region.channel());
        marker.set("sub_channel", region.sub_channel());
        marker.set("cps", region.cps());
        marker.set("game_biz", request.variant.biz());
        if let Some(sdk_version) = sdk_version {
            marker.set("sdk_version", sdk_version);
        }
        marker.save(root).await?;
        info!("wrote config marker for {}", request.variant);

        self.cleanup(request, plan, &marker).await
    }

    /// Ensure the channel SDK overlay is present and current
    ///
    /// Returns the SDK version to record in the config marker.
    async fn ensure_channel_sdk(
        &self,
        variant: &GameVariant,
        root: &Path,
    ) -> Result<Option<String>> {
        let Some(sdk) = self.client.channel_sdk(variant).await? else {
            return Ok(None);
        };
        if self.channel_sdk_current(&sdk, root).await? {
            debug!("channel SDK {} already current", sdk.version);
            return Ok(Some(sdk.version));
        }

        info!("installing channel SDK {}", sdk.version);
        let name = sdk.package.file_name().to_string();
        let task = DownloadTask::new(&name, &sdk.package.url, sdk.package.size, &sdk.package.md5);
        let progress = Arc::new(hyp_download::TransferProgress::new());
        let cancel = CancellationToken::new();
        self.downloader
            .download_all(root, std::slice::from_ref(&task), &progress, &cancel)
            .await?;
        Verifier::new()
            .verify_all(root, std::slice::from_ref(&task), &progress, &cancel)
            .await?;

        let archive = task.final_path(root);
        let target = root.to_path_buf();
        tokio::task::spawn_blocking(move || extract_package(&[archive], &target, |_| {}))
            .await
            .map_err(|err| Error::Io(std::io::Error::other(err.to_string())))??;
        Ok(Some(sdk.version))
    }

    /// Whether the recorded SDK matches and its own listing validates
    async fn channel_sdk_current(&self, sdk: &ChannelSdk, root: &Path) -> Result<bool> {
        let marker = ConfigMarker::load(root).await?;
        let recorded = marker.as_ref().and_then(ConfigMarker::sdk_version);
        if recorded != Some(sdk.version.as_str()) {
            return Ok(false);
        }
        let Some(listing_name) = &sdk.pkg_version_file_name else {
            return Ok(true);
        };
        let listing = root.join(listing_name);
        let bytes = match tokio::fs::read(&listing).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let entries = hyp_manifest::parse_pkg_version(std::io::Cursor::new(bytes))?;
        for entry in entries {
            let path = root.join(&entry.remote_name);
            if !check_file_md5(&path, entry.file_size, &entry.md5).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Post-finish cleanup: deprecated-file feed, stray temp and diff
    /// files, and the chunk/ldiff/staging work directories
    ///
    /// Skipped while a predownload is pending so its cached payload
    /// survives until the version switch.
    async fn cleanup(
        &self,
        request: &crate::InstallRequest,
        plan: &InstallPlan,
        marker: &ConfigMarker,
    ) -> Result<()> {
        if plan.operation == InstallOperation::Predownload {
            return Ok(());
        }
        let root = &request.install_path;
        let mut count = 0usize;

        // Leftover archive volumes (normally consumed by extraction)
        if let PlanMode::Package { groups, .. } = &plan.mode {
            for volume in groups.iter().flat_map(|g| &g.volumes) {
                let path = root.join(volume);
                if path.exists() {
                    tokio::fs::remove_file(&path).await?;
                    count += 1;
                }
            }
        }

        // Remote deprecated-file feed; a feed outage never fails an
        // otherwise complete install
        match self.client.deprecated_files(&request.variant).await {
            Ok(config) => {
                for file in &config.deprecated_files {
                    let path = root.join(&file.name);
                    if path.exists() {
                        tokio::fs::remove_file(&path).await?;
                        count += 1;
                    }
                }
            }
            Err(err) => warn!("deprecated-file feed unavailable: {err}"),
        }

        if marker.predownload().is_none() {
            let root_owned = root.clone();
            count += tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
                let mut removed = 0usize;
                for entry in walkdir::WalkDir::new(&root_owned)
                    .into_iter()
                    .filter_map(std::result::Result::ok)
                {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy();
                    if name.ends_with("_tmp") || name.ends_with(".hdiff") {
                        std::fs::remove_file(entry.path())?;
                        removed += 1;
                    }
                }
                for dir in [CHUNK_CACHE_DIR, LDIFF_DIR, STAGING_DIR] {
                    let path = root_owned.join(dir);
                    if path.exists() {
                        std::fs::remove_dir_all(&path)?;
                    }
                }
                Ok(removed)
            })
            .await
            .map_err(|err| Error::Io(std::io::Error::other(err.to_string())))??;
        }
        info!("cleanup removed {count} deprecated or stray files");
        Ok(())
    }
}

/// Files the pipeline itself owns, exempt from repair deletion
fn is_pipeline_file(name: &str) -> bool {
    name == crate::CONFIG_MARKER
        || name.starts_with(&format!("{CHUNK_CACHE_DIR}/"))
        || name.starts_with(&format!("{LDIFF_DIR}/"))
        || name.starts_with(&format!("{STAGING_DIR}/"))
        || name.ends_with("_tmp")
        || name.ends_with(".hdiff")
}
