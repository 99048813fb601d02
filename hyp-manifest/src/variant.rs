//! Game variant identity
//!
//! A variant is a (title, region/channel) pair. It decides which metadata
//! endpoints are queried and which channel values are written into the
//! local config marker. Variants of the same title in different regions
//! are siblings for hard-link purposes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Distribution region / channel of a game title
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    /// Mainland channel
    Cn,
    /// Global channel
    Global,
    /// Third-party store channel
    Bilibili,
}

impl Region {
    /// Region name as used in API queries and biz strings
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cn => "cn",
            Self::Global => "global",
            Self::Bilibili => "bilibili",
        }
    }

    /// `channel` value recorded in the config marker
    pub fn channel(self) -> &'static str {
        match self {
            Self::Cn | Self::Global => "1",
            Self::Bilibili => "14",
        }
    }

    /// `sub_channel` value recorded in the config marker
    pub fn sub_channel(self) -> &'static str {
        match self {
            Self::Cn => "1",
            Self::Global | Self::Bilibili => "0",
        }
    }

    /// `cps` tag recorded in the config marker
    pub fn cps(self) -> &'static str {
        match self {
            Self::Cn => "hyp_cn",
            Self::Global => "hyp_global",
            Self::Bilibili => "hyp_bilibili",
        }
    }
}

impl FromStr for Region {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cn" => Ok(Self::Cn),
            "global" => Ok(Self::Global),
            "bilibili" => Ok(Self::Bilibili),
            other => Err(Error::invalid_manifest(format!("unknown region {other:?}"))),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (title, region) pair identifying one installable game variant
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameVariant {
    title: String,
    region: Region,
}

impl GameVariant {
    /// Create a variant from a title id (e.g. `hk4e`) and region
    pub fn new(title: impl Into<String>, region: Region) -> Self {
        Self {
            title: title.into(),
            region,
        }
    }

    /// Parse a biz string of the form `<title>_<region>`
    pub fn from_biz(biz: &str) -> Result<Self, Error> {
        let (title, region) = biz
            .rsplit_once('_')
            .ok_or_else(|| Error::invalid_manifest(format!("malformed biz string {biz:?}")))?;
        if title.is_empty() {
            return Err(Error::invalid_manifest(format!(
                "malformed biz string {biz:?}"
            )));
        }
        Ok(Self::new(title, region.parse()?))
    }

    /// Title id shared by all sibling variants
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Distribution region
    pub fn region(&self) -> Region {
        self.region
    }

    /// The `<title>_<region>` identifier used in API queries and the
    /// config marker's `game_biz` key
    pub fn biz(&self) -> String {
        format!("{}_{}", self.title, self.region)
    }

    /// Whether `other` is a sibling: same title, different region
    pub fn is_sibling_of(&self, other: &Self) -> bool {
        self.title == other.title && self.region != other.region
    }
}

impl fmt::Display for GameVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.title, self.region)
    }
}
