//! Download task descriptors
//!
//! A task is the unit of resumability: its identity is the destination
//! file name, and a task whose bytes already exist on disk (final or
//! `_tmp`) resumes instead of restarting. Everything downstream of the
//! planner operates on this normalized shape regardless of which remote
//! protocol produced it.

use std::path::{Path, PathBuf};

/// Source URL of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskUrl {
    /// Complete URL known at planning time
    Absolute(String),
    /// URL built lazily from a shared prefix plus the task's relative
    /// name (repair-mode single-file fetches)
    Prefixed {
        /// URL prefix shared by every file of the listing
        prefix: String,
    },
}

/// One downloadable file of a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    /// Destination path relative to the install root; task identity
    pub file_name: String,
    /// Where the bytes come from
    pub url: TaskUrl,
    /// Expected total size in bytes
    pub size: u64,
    /// Expected MD5, lowercase hex
    pub md5: String,
    /// Whether this file is one volume of a multi-volume archive group
    pub is_segment: bool,
    /// Sibling install file to hard-link instead of downloading, when the
    /// resolver found one
    pub hard_link_source: Option<PathBuf>,
}

impl DownloadTask {
    /// Create a task with an absolute URL
    pub fn new(
        file_name: impl Into<String>,
        url: impl Into<String>,
        size: u64,
        md5: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            url: TaskUrl::Absolute(url.into()),
            size,
            md5: md5.into(),
            is_segment: false,
            hard_link_source: None,
        }
    }

    /// Create a repair-mode task resolved against a listing prefix
    pub fn prefixed(
        file_name: impl Into<String>,
        prefix: impl Into<String>,
        size: u64,
        md5: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            url: TaskUrl::Prefixed {
                prefix: prefix.into(),
            },
            size,
            md5: md5.into(),
            is_segment: false,
            hard_link_source: None,
        }
    }

    /// Mark the task as a multi-volume archive member
    pub fn segment(mut self) -> Self {
        self.is_segment = true;
        self
    }

    /// Attach a hard-link source
    pub fn with_hard_link_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.hard_link_source = Some(source.into());
        self
    }

    /// Resolve the source URL
    pub fn resolve_url(&self) -> String {
        match &self.url {
            TaskUrl::Absolute(url) => url.clone(),
            TaskUrl::Prefixed { prefix } => {
                format!("{}/{}", prefix.trim_end_matches('/'), self.file_name)
            }
        }
    }

    /// Final destination path
    pub fn final_path(&self, root: &Path) -> PathBuf {
        root.join(&self.file_name)
    }

    /// Temporary download path (`<name>_tmp`)
    pub fn temp_path(&self, root: &Path) -> PathBuf {
        let mut name = self.final_path(root).into_os_string();
        name.push("_tmp");
        PathBuf::from(name)
    }

    /// Where new bytes are written
    ///
    /// A partial file already sitting under the final name is resumed in
    /// place (legacy layout); otherwise writes go to the temp path.
    pub fn write_target(&self, root: &Path) -> PathBuf {
        let final_path = self.final_path(root);
        if let Ok(meta) = final_path.metadata() {
            if meta.len() < self.size {
                return final_path;
            }
        }
        self.temp_path(root)
    }

    /// The on-disk file verification should read, preferring the final
    /// name over the temp name
    pub fn resident_path(&self, root: &Path) -> Option<PathBuf> {
        let final_path = self.final_path(root);
        if final_path.exists() {
            return Some(final_path);
        }
        let temp = self.temp_path(root);
        temp.exists().then_some(temp)
    }

    /// Bytes already on disk for this task, by stat alone
    ///
    /// A cheap resume estimate: correctness is re-established by the
    /// verifier, never here.
    pub fn bytes_on_disk(&self, root: &Path) -> u64 {
        self.resident_path(root)
            .and_then(|p| p.metadata().ok())
            .map_or(0, |meta| meta.len().min(self.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn url_resolution() {
        let absolute = DownloadTask::new("a.zip", "https://cdn.example.com/a.zip", 1, "00");
        assert_eq!(absolute.resolve_url(), "https://cdn.example.com/a.zip");

        let prefixed = DownloadTask::prefixed(
            "data/blocks.bin",
            "https://cdn.example.com/res/",
            1,
            "00",
        );
        assert_eq!(
            prefixed.resolve_url(),
            "https://cdn.example.com/res/data/blocks.bin"
        );
    }

    #[test]
    fn paths_and_temp_naming() {
        let task = DownloadTask::new("data/a.bin", "https://x/a.bin", 10, "00");
        let root = Path::new("/install");
        assert_eq!(task.final_path(root), Path::new("/install/data/a.bin"));
        assert_eq!(task.temp_path(root), Path::new("/install/data/a.bin_tmp"));
    }

    #[test]
    fn write_target_resumes_partial_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let task = DownloadTask::new("a.bin", "https://x/a.bin", 10, "00");

        // Nothing on disk: write to temp
        assert_eq!(task.write_target(dir.path()), task.temp_path(dir.path()));

        // Partial final file: legacy in-place resume
        fs::write(dir.path().join("a.bin"), b"12345").unwrap();
        assert_eq!(task.write_target(dir.path()), task.final_path(dir.path()));

        // Complete final file: back to temp (nothing will be written)
        fs::write(dir.path().join("a.bin"), b"1234567890").unwrap();
        assert_eq!(task.write_target(dir.path()), task.temp_path(dir.path()));
    }

    #[test]
    fn bytes_on_disk_is_stat_based_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let task = DownloadTask::new("a.bin", "https://x/a.bin", 4, "00");
        assert_eq!(task.bytes_on_disk(dir.path()), 0);

        fs::write(dir.path().join("a.bin_tmp"), b"12").unwrap();
        assert_eq!(task.bytes_on_disk(dir.path()), 2);

        // Final file wins over temp, and overlong files are capped
        fs::write(dir.path().join("a.bin"), b"123456").unwrap();
        assert_eq!(task.bytes_on_disk(dir.path()), 4);
    }
}
