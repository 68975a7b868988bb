//! Protocol versioning for Strand.
//!
//! The version is advertised to the server as the `vsn` query parameter of the
//! connection URL and selects the frame layout the server speaks back.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::codec::ProtocolError;

/// Current protocol version (array frames).
pub const PROTOCOL_VERSION: Version = Version::new(2, 0, 0);

/// Legacy protocol version (object frames).
pub const LEGACY_VERSION: Version = Version::new(1, 0, 0);

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
    /// Patch version.
    pub patch: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::Unsupported(format!("version {s}"));
        let mut parts = s.trim().split('.').map(|part| part.parse::<u8>().map_err(|_| invalid()));
        let version = Version::new(
            parts.next().ok_or_else(invalid)??,
            parts.next().unwrap_or(Ok(0))?,
            parts.next().unwrap_or(Ok(0))?,
        );
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "2.0.0");
        assert_eq!(LEGACY_VERSION.to_string(), "1.0.0");
    }

    #[test]
    fn test_version_parse() {
        assert_eq!("2.0.0".parse::<Version>().unwrap(), PROTOCOL_VERSION);
        assert_eq!("1".parse::<Version>().unwrap(), LEGACY_VERSION);
        assert!("2.x".parse::<Version>().is_err());
        assert!("1.0.0.0".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
    }

    #[test]
    fn test_default_is_current() {
        assert_eq!(Version::default(), PROTOCOL_VERSION);
    }
}
