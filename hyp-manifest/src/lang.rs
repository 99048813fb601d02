//! Audio language selection
//!
//! Audio packs are selected by a small bitset. The set is persisted inside
//! the install tree as a line-per-language marker file using the pack
//! display names (`Chinese`, `English(US)`, ...), and is matched against
//! manifest entries by locale code (`zh-cn`, `en-us`, ...).

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Bitset of selected audio languages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioLanguages(u8);

impl AudioLanguages {
    /// No audio packs selected
    pub const NONE: Self = Self(0);
    /// Chinese audio pack
    pub const CHINESE: Self = Self(1);
    /// English audio pack
    pub const ENGLISH: Self = Self(1 << 1);
    /// Japanese audio pack
    pub const JAPANESE: Self = Self(1 << 2);
    /// Korean audio pack
    pub const KOREAN: Self = Self(1 << 3);

    const ALL: [(Self, &'static str, &'static str); 4] = [
        (Self::CHINESE, "zh-cn", "Chinese"),
        (Self::ENGLISH, "en-us", "English(US)"),
        (Self::JAPANESE, "ja-jp", "Japanese"),
        (Self::KOREAN, "ko-kr", "Korean"),
    ];

    /// Whether no language is selected
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether all languages in `other` are selected
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Selected languages as locale codes
    pub fn locales(self) -> Vec<&'static str> {
        Self::ALL
            .iter()
            .filter(|(flag, _, _)| self.contains(*flag))
            .map(|(_, locale, _)| *locale)
            .collect()
    }

    /// Selected languages as marker-file line names
    pub fn marker_lines(self) -> Vec<&'static str> {
        Self::ALL
            .iter()
            .filter(|(flag, _, _)| self.contains(*flag))
            .map(|(_, _, line)| *line)
            .collect()
    }

    /// Parse a locale code, ignoring unknown values
    pub fn from_locale(locale: &str) -> Self {
        // zh-tw audio ships in the Chinese pack
        if locale.eq_ignore_ascii_case("zh-tw") {
            return Self::CHINESE;
        }
        Self::ALL
            .iter()
            .find(|(_, code, _)| locale.eq_ignore_ascii_case(code))
            .map_or(Self::NONE, |(flag, _, _)| *flag)
    }

    /// Parse a comma-separated list of locale codes
    pub fn from_locales(locales: &str) -> Self {
        locales
            .split(',')
            .map(str::trim)
            .map(Self::from_locale)
            .fold(Self::NONE, Self::bitor)
    }

    /// Detect languages from marker-file lines
    ///
    /// Matching is substring-based, the way launchers probe the scan file
    /// the game itself maintains.
    pub fn from_marker_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut set = Self::NONE;
        for line in lines {
            for (flag, _, name) in Self::ALL {
                if line.contains(name) {
                    set |= flag;
                }
            }
        }
        set
    }
}

impl BitOr for AudioLanguages {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AudioLanguages {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for AudioLanguages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&self.locales().join(","))
    }
}
