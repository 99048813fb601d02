//! Diff-list application after extraction
//!
//! A diff package drops two control files into the install root:
//!
//! - `deletefiles.txt` — plain relative paths to remove
//! - `hdifffiles.txt` — JSON lines naming files with a co-located
//!   `<path>.hdiff` to merge via the external patch tool
//!
//! Both lists delete themselves once fully applied. The merge never
//! patches in place: the tool writes `<target>_tmp` and the target is
//! replaced by rename only after the tool reports success, so a crash or
//! tool failure mid-merge leaves the original file intact.

use std::io::{BufRead, BufReader, Cursor};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// File name of the deletion list inside an extracted diff package
pub const DELETE_LIST_NAME: &str = "deletefiles.txt";

/// File name of the binary-diff list inside an extracted diff package
pub const HDIFF_LIST_NAME: &str = "hdifffiles.txt";

/// One entry of `hdifffiles.txt`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HdiffEntry {
    /// Target path relative to the install root
    #[serde(rename = "remoteName")]
    pub remote_name: String,
}

/// Driver for the external binary-diff merge tool
#[derive(Debug, Clone)]
pub struct HpatchTool {
    program: PathBuf,
}

impl HpatchTool {
    /// Use an explicit tool binary
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Resolve the tool from `PATH`
    pub fn from_path() -> Self {
        Self::new("hpatchz")
    }

    /// Merge `diff` into `output`, optionally starting from `source`
    ///
    /// `source` is absent when the diff data is the complete new file.
    /// The output path must not be the source path; in-place merges are
    /// rejected by construction of the call sites.
    pub async fn patch(&self, source: Option<&Path>, diff: &Path, output: &Path) -> Result<()> {
        let mut command = Command::new(&self.program);
        command.arg("-f");
        match source {
            Some(source) => command.arg(source),
            None => command.arg(""),
        };
        command.arg(diff).arg(output);

        let status = command.status().await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::ToolNotFound {
                    program: self.program.clone(),
                }
            } else {
                Error::Io(err)
            }
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::ToolFailed {
                target: output.display().to_string(),
                code: status.code(),
            })
        }
    }

    /// Merge into `<target>_tmp` and rename over `target` on success
    pub async fn patch_and_replace(
        &self,
        source: Option<&Path>,
        diff: &Path,
        target: &Path,
    ) -> Result<()> {
        let tmp = temp_output_path(target);
        self.patch(source, diff, &tmp).await?;
        tokio::fs::rename(&tmp, target).await?;
        Ok(())
    }
}

fn temp_output_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push("_tmp");
    PathBuf::from(name)
}

/// Read the deletion list, if the package dropped one
pub async fn read_delete_list(install_root: &Path) -> Result<Option<Vec<String>>> {
    let path = install_root.join(DELETE_LIST_NAME);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(Some(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        )),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Read the binary-diff list, if the package dropped one
pub async fn read_hdiff_list(install_root: &Path) -> Result<Option<Vec<HdiffEntry>>> {
    let path = install_root.join(HDIFF_LIST_NAME);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let reader = BufReader::new(Cursor::new(bytes));
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(line)?);
    }
    Ok(Some(entries))
}

/// Apply the deletion list and remove it
///
/// Returns the number of files actually deleted. Missing targets are
/// fine: the list describes the remote's idea of the old tree.
pub async fn apply_delete_list(install_root: &Path) -> Result<usize> {
    let Some(entries) = read_delete_list(install_root).await? else {
        return Ok(0);
    };
    let mut deleted = 0usize;
    for entry in &entries {
        let target = install_root.join(entry);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => deleted += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    tokio::fs::remove_file(install_root.join(DELETE_LIST_NAME)).await?;
    info!("deleted {deleted} files listed in {DELETE_LIST_NAME}");
    Ok(deleted)
}

/// Apply one entry of the binary-diff list
///
/// Returns `true` when the target was merged, `false` when the entry was
/// skipped because target or diff is absent (some lists name files the
/// local install never had).
pub async fn apply_hdiff_entry(
    install_root: &Path,
    tool: &HpatchTool,
    entry: &HdiffEntry,
) -> Result<bool> {
    let target = install_root.join(&entry.remote_name);
    let diff = PathBuf::from(format!("{}.hdiff", target.display()));
    if !target.exists() || !diff.exists() {
        warn!("skipping hdiff entry {}: file or diff missing", entry.remote_name);
        return Ok(false);
    }
    tool.patch_and_replace(Some(&target), &diff, &target).await?;
    tokio::fs::remove_file(&diff).await?;
    debug!("merged {}", entry.remote_name);
    Ok(true)
}

/// Remove the binary-diff list after all entries were applied
pub async fn clear_hdiff_list(install_root: &Path) -> Result<()> {
    match tokio::fs::remove_file(install_root.join(HDIFF_LIST_NAME)).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
