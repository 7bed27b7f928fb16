//! Dotted-integer version strings, spec.md §3 `Version`.
//!
//! Grounded in `original_source/libs/core/src/Assets/AppAssetRoots.cc`'s use
//! of `Utils::VersionString`: directory names under a module root are
//! parsed as versions, compared to track the latest, and an empty or
//! non-numeric string yields a value that is never `is_valid()`.

use std::cmp::Ordering;
use std::fmt;

/// A version parsed from a dotted-integer string (`"1.2.3"`). An empty or
/// malformed string parses to an invalid sentinel that compares equal only
/// to itself and is never treated as "the latest" of anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    parts: Vec<u64>,
    valid: bool,
}

impl Version {
    /// Parse `s` as a dotted-integer version. Whitespace-only or
    /// non-numeric segments produce an invalid version.
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Self::invalid();
        }
        let mut parts = Vec::new();
        for segment in trimmed.split('.') {
            match segment.parse::<u64>() {
                Ok(n) => parts.push(n),
                Err(_) => return Self::invalid(),
            }
        }
        Self { parts, valid: true }
    }

    /// The invalid sentinel: `is_valid() == false`.
    pub fn invalid() -> Self {
        Self {
            parts: Vec::new(),
            valid: false,
        }
    }

    /// Whether this value parsed as a well-formed dotted-integer version.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.valid {
            return write!(f, "");
        }
        let rendered: Vec<String> = self.parts.iter().map(u64::to_string).collect();
        write!(f, "{}", rendered.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_integers() {
        let v = Version::parse("1.2.3");
        assert!(v.is_valid());
        assert_eq!(v.to_string(), "1.2.3");
    }

    #[test]
    fn empty_and_whitespace_are_invalid() {
        assert!(!Version::parse("").is_valid());
        assert!(!Version::parse("   ").is_valid());
    }

    #[test]
    fn non_numeric_segment_is_invalid() {
        assert!(!Version::parse("1.x.3").is_valid());
    }

    #[test]
    fn compares_numerically_not_lexically() {
        assert!(Version::parse("1.9.0") < Version::parse("1.10.0"));
        assert!(Version::parse("2.0.0") > Version::parse("1.99.99"));
    }

    #[test]
    fn equal_versions_compare_equal() {
        assert_eq!(Version::parse("1.0"), Version::parse("1.0"));
    }
}
