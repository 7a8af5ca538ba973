//! Semantic protocol versions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version, carried on the wire as three bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SemVer {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl SemVer {
    /// Version 1.0.0, the only version the current protocol defines.
    pub const V100: SemVer = SemVer::new(1, 0, 0);

    /// Create a version.
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Convert to the 3-byte wire representation.
    pub fn to_bytes(self) -> [u8; 3] {
        [self.major, self.minor, self.patch]
    }

    /// Parse the 3-byte wire representation.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [major, minor, patch] => Some(Self::new(*major, *minor, *patch)),
            _ => None,
        }
    }

    /// Pick the first version from the peer's preference list that we support.
    pub fn negotiate(theirs: &[SemVer], ours: &[SemVer]) -> Option<SemVer> {
        theirs.iter().copied().find(|v| ours.contains(v))
    }
}

impl Default for SemVer {
    fn default() -> Self {
        SemVer::V100
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
