//! Semantic versions and the compatibility check run on first contact.

use std::fmt;
use std::str::FromStr;

/// Dotted three-part version. Total order is lexicographic on
/// (major, minor, patch), which the derived `Ord` provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a `major.minor.patch` string.
    pub fn parse(s: &str) -> Result<Self, VersionParseError> {
        s.parse()
    }
}

impl FromStr for SemVer {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let (a, b, c) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c), None) => (a, b, c),
            _ => return Err(VersionParseError::WrongShape),
        };
        let number = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| VersionParseError::BadComponent(p.to_string()))
        };
        Ok(SemVer {
            major: number(a)?,
            minor: number(b)?,
            patch: number(c)?,
        })
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionParseError {
    #[error("version must be three dot-separated numbers")]
    WrongShape,
    #[error("version component is not a number: {0}")]
    BadComponent(String),
}

/// Outcome of comparing two sides' announced versions and floors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// Each side's version meets the other side's floor.
    Compatible,
    /// Exactly one side falls below the other's floor.
    Warning,
    /// Neither side meets the other's floor.
    Incompatible,
}

impl fmt::Display for Compatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Compatibility::Compatible => "compatible",
            Compatibility::Warning => "partially compatible",
            Compatibility::Incompatible => "incompatible",
        };
        f.write_str(s)
    }
}

/// Classify mutual compatibility: the remote's announced version is checked
/// against the local floor, and the local version against the remote's floor.
/// Pure and deterministic.
pub fn classify(local: SemVer, local_min: SemVer, remote: SemVer, remote_min: SemVer) -> Compatibility {
    let remote_ok = remote >= local_min;
    let local_ok = local >= remote_min;
    match (remote_ok, local_ok) {
        (true, true) => Compatibility::Compatible,
        (false, false) => Compatibility::Incompatible,
        _ => Compatibility::Warning,
    }
}
