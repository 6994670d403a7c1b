//! Protocol versioning for Tether.
//!
//! The version is sent as the `v` query parameter on every connection
//! attempt; the service rejects versions it no longer supports.

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 2, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check if this version is compatible with another version.
    ///
    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Value of the `v` query parameter. Only the major version goes on the wire.
    #[must_use]
    pub fn query_value(&self) -> String {
        self.major.to_string()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

/// Client identifier sent as the `agent` query parameter.
#[must_use]
pub fn agent() -> String {
    format!("tether-rs/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v2_0 = Version::new(2, 0);
        let v2_1 = Version::new(2, 1);
        let v1_0 = Version::new(1, 0);

        assert!(v2_0.is_compatible_with(&v2_1));
        assert!(!v2_0.is_compatible_with(&v1_0));
    }

    #[test]
    fn test_query_value() {
        assert_eq!(PROTOCOL_VERSION.query_value(), "2");
        assert_eq!(PROTOCOL_VERSION.to_string(), "2.0");
        assert!(agent().starts_with("tether-rs/"));
    }
}
