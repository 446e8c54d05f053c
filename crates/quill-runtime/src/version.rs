//! Semantic version handling for manifests and the host API.
//!
//! Manifests carry plain `major.minor.patch` strings. The host API
//! compatibility rule is: major must match exactly, minor may be at most
//! the host's minor. Patch never affects compatibility.

use crate::error::{RuntimeError, RuntimeResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A strict `major.minor.patch` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    /// Create a version from its components.
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a `major.minor.patch` string.
    pub fn parse(s: &str) -> RuntimeResult<Self> {
        let mut parts = s.split('.');
        let mut next = |what: &str| -> RuntimeResult<u64> {
            let part = parts
                .next()
                .ok_or_else(|| bad_version(s, &format!("missing {what} component")))?;
            part.parse::<u64>()
                .map_err(|_| bad_version(s, &format!("invalid {what} component '{part}'")))
        };

        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;

        if parts.next().is_some() {
            return Err(bad_version(s, "too many components"));
        }

        Ok(Self::new(major, minor, patch))
    }

    /// Whether an extension built against `self` can run on a host that
    /// provides `host`: same major, and minor not newer than the host's.
    pub fn is_compatible_with(&self, host: Version) -> bool {
        self.major == host.major && self.minor <= host.minor
    }

    /// Whether this version satisfies a `>= min` requirement.
    pub fn satisfies_min(&self, min: Version) -> bool {
        *self >= min
    }
}

fn bad_version(input: &str, reason: &str) -> RuntimeError {
    RuntimeError::InvalidManifest(format!("invalid version '{input}': {reason}"))
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = RuntimeError;

    fn from_str(s: &str) -> RuntimeResult<Self> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(D::Error::custom)
    }
}
