//! Protocol version comparison, used by contact/routing-table hygiene (see
//! `storj_network`'s cleaner) and by RPC envelope exemption checks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A `major.minor.patch[-build]` protocol version.
///
/// Compatibility (per the network facade's Versioning rule) requires the same major
/// AND minor AND build tag; patch may differ freely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: Option<String>,
}

impl ProtocolVersion {
    pub fn new(major: u32, minor: u32, patch: u32, build: Option<&str>) -> Self {
        Self { major, minor, patch, build: build.map(str::to_owned) }
    }

    /// Parses `major.minor.patch` or `major.minor.patch-build`.
    pub fn parse(s: &str) -> Option<Self> {
        let (version, build) = match s.split_once('-') {
            Some((v, b)) => (v, Some(b.to_owned())),
            None => (s, None),
        };
        let mut parts = version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { major, minor, patch, build })
    }

    /// Same major, same minor, same build tag. Patch is allowed to differ.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major && self.minor == other.minor && self.build == other.build
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.build {
            Some(build) => write!(f, "{}.{}.{}-{}", self.major, self.minor, self.patch, build),
            None => write!(f, "{}.{}.{}", self.major, self.minor, self.patch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_major_minor_build_is_compatible_regardless_of_patch() {
        let a = ProtocolVersion::parse("1.2.3").unwrap();
        let b = ProtocolVersion::parse("1.2.9").unwrap();
        assert!(a.is_compatible_with(&b));
    }

    #[test]
    fn different_build_tag_is_incompatible() {
        let a = ProtocolVersion::parse("1.2.3-beta").unwrap();
        let b = ProtocolVersion::parse("1.2.3").unwrap();
        assert!(!a.is_compatible_with(&b));
    }

    #[test]
    fn different_major_is_incompatible() {
        let a = ProtocolVersion::parse("1.2.3").unwrap();
        let b = ProtocolVersion::parse("999.0.0").unwrap();
        assert!(!a.is_compatible_with(&b));
    }

    #[test]
    fn roundtrips_through_display() {
        let v = ProtocolVersion::new(2, 4, 1, Some("rc1"));
        assert_eq!(ProtocolVersion::parse(&v.to_string()).unwrap(), v);
    }
}
