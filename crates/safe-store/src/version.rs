//! Ordered schema versions (`major.minor.patch`).

use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Version key for a migration and for the schema the code expects.
///
/// Compared numerically per component, so `1.2.10` sorts after `1.2.9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SchemaVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SchemaVersion {
    pub const ZERO: SchemaVersion = SchemaVersion::new(0, 0, 0);

    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for SchemaVersion {
    type Err = StoreError;

    /// Parse `"1.2.10"`, `"v6.2"` or `"5"`. Missing components are zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if body.is_empty() {
            return Err(StoreError::InvalidVersion(s.to_string()));
        }

        let mut parts = [0u64; 3];
        for (i, part) in body.split('.').enumerate() {
            if i >= parts.len() {
                return Err(StoreError::InvalidVersion(s.to_string()));
            }
            parts[i] = part
                .parse()
                .map_err(|_| StoreError::InvalidVersion(s.to_string()))?;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
