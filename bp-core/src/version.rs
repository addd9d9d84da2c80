//! Version gate: `tosca_definitions_version` parsing and feature gating (§4.1).

use std::cmp::Ordering;
use std::fmt;

use crate::error::DslParsingFormatError;

/// `(major, minor, micro)` parsed from a `cloudify_dsl_<M>_<m>[_<p>]` token.
/// Ordering is lexicographic on the triple, so feature gates are a plain
/// comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major,
            minor,
            micro,
        }
    }

    /// Parse a `cloudify_dsl_<M>_<m>[_<p>]` token.
    pub fn parse(token: &str) -> Result<Self, DslParsingFormatError> {
        let rest = token.strip_prefix("cloudify_dsl_").ok_or_else(|| {
            DslParsingFormatError::BadVersionToken {
                token: token.to_string(),
            }
        })?;

        let mut parts = rest.split('_');
        let bad = || DslParsingFormatError::BadVersionToken {
            token: token.to_string(),
        };

        let major: u32 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let minor: u32 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let micro: u32 = match parts.next() {
            Some(p) => p.parse().map_err(|_| bad())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(bad());
        }

        Ok(Self::new(major, minor, micro))
    }

    /// True when `self >= minimum`, the shape every feature gate checks.
    pub fn at_least(&self, minimum: Version) -> bool {
        *self >= minimum
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cloudify_dsl_{}_{}_{}", self.major, self.minor, self.micro)
    }
}

/// Minimum version required to use `concat` (§4.1).
pub const CONCAT_MIN_VERSION: Version = Version::new(1, 1, 0);
/// Minimum version required to use `merge` (§4.1).
pub const MERGE_MIN_VERSION: Version = Version::new(1, 3, 0);
/// Minimum version required for import-merging of `inputs`, `node_templates`,
/// `outputs`, `policy_types`, `policy_triggers`, `groups` (§4.1, §4.2).
pub const MERGEABLE_SECTIONS_MIN_VERSION: Version = Version::new(1, 3, 0);

/// A gate's comparison result, kept distinct from a bare bool so call sites
/// read as a sentence (`gate.check(...)?`) rather than an inline comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateResult {
    Permitted,
    BelowMinimum { minimum: Version },
}

impl GateResult {
    pub fn evaluate(current: Version, minimum: Version) -> Self {
        if current.at_least(minimum) {
            Self::Permitted
        } else {
            Self::BelowMinimum { minimum }
        }
    }

    pub fn is_permitted(&self) -> bool {
        matches!(self, Self::Permitted)
    }
}

impl PartialOrd for GateResult {
    fn partial_cmp(&self, _other: &Self) -> Option<Ordering> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_triple() {
        let v = Version::parse("cloudify_dsl_1_3_2").unwrap();
        assert_eq!(v, Version::new(1, 3, 2));
    }

    #[test]
    fn parses_two_component_form_with_implicit_micro() {
        let v = Version::parse("cloudify_dsl_1_3").unwrap();
        assert_eq!(v, Version::new(1, 3, 0));
    }

    #[test]
    fn rejects_malformed_token() {
        assert!(Version::parse("dsl_1_3").is_err());
        assert!(Version::parse("cloudify_dsl_x_y").is_err());
        assert!(Version::parse("cloudify_dsl_1_3_2_4").is_err());
    }

    #[test]
    fn ordering_is_lexicographic_on_the_triple() {
        assert!(Version::new(1, 2, 9) < Version::new(1, 3, 0));
        assert!(Version::new(1, 3, 0) < Version::new(2, 0, 0));
        assert!(Version::new(1, 3, 0) == Version::new(1, 3, 0));
    }

    #[test]
    fn concat_requires_1_1_0() {
        assert!(!Version::new(1, 0, 0).at_least(CONCAT_MIN_VERSION));
        assert!(Version::new(1, 1, 0).at_least(CONCAT_MIN_VERSION));
    }

    #[test]
    fn merge_requires_1_3_0() {
        assert!(!Version::new(1, 2, 0).at_least(MERGE_MIN_VERSION));
        assert!(Version::new(1, 3, 0).at_least(MERGE_MIN_VERSION));
    }

    #[test]
    fn gate_result_reports_minimum_on_failure() {
        let result = GateResult::evaluate(Version::new(1, 0, 0), MERGE_MIN_VERSION);
        assert_eq!(
            result,
            GateResult::BelowMinimum {
                minimum: MERGE_MIN_VERSION
            }
        );
        assert!(!result.is_permitted());
    }
}
