//! `pkg_version` ground-truth listings
//!
//! Repair mode validates an install against a newline-delimited JSON file
//! listing every shipped file with its MD5 and size. One JSON object per
//! line; blank lines are skipped.

use std::io::BufRead;

use serde::{Deserialize, Serialize};

use crate::Result;

/// One entry of a `pkg_version` listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkgVersionEntry {
    /// Path relative to the install root
    #[serde(rename = "remoteName")]
    pub remote_name: String,
    /// MD5 of the file, lowercase hex
    pub md5: String,
    /// File size in bytes
    #[serde(rename = "fileSize")]
    pub file_size: u64,
}

/// Parse a newline-delimited JSON `pkg_version` payload
pub fn parse_pkg_version<R: BufRead>(reader: R) -> Result<Vec<PkgVersionEntry>> {
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(line)?);
    }
    Ok(entries)
}
