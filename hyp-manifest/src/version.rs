//! Dotted game version numbers
//!
//! Versions in config markers and remote manifests are dotted decimal
//! strings (`1.6.0`, `2.10.0`). Comparison is segment-wise numeric, so
//! `1.10.0 > 1.9.0`.

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// A parsed dotted version number
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GameVersion(Vec<u32>);

impl GameVersion {
    /// Parse a version, returning `None` on malformed input
    ///
    /// Convenience for marker files where a missing or garbled version
    /// means "no installed build" rather than an error.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Version segments, most significant first
    pub fn segments(&self) -> &[u32] {
        &self.0
    }
}

impl FromStr for GameVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::invalid_manifest("empty version string"));
        }
        let segments = s
            .split('.')
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| Error::invalid_manifest(format!("bad version segment in {s:?}")))
            })
            .collect::<Result<Vec<u32>, Error>>()?;
        Ok(Self(segments))
    }
}

impl fmt::Display for GameVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{seg}")?;
            first = false;
        }
        Ok(())
    }
}
