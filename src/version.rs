//! Dotted numeric versions, compared component-wise.
//!
//! Workers declare the engine version they were written against; a worker
//! loads iff its `engine_version` is not newer than the running engine.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utilities::errors::RegistrationError;

/// Version of the running game engine.
pub const GAME_ENGINE_VERSION_RAW: &str = env!("CARGO_PKG_VERSION");

/// Parsed form of [`GAME_ENGINE_VERSION_RAW`].
pub fn game_engine_version() -> Version {
    GAME_ENGINE_VERSION_RAW
        .parse()
        .expect("engine version constant is well-formed")
}

/// A dotted numeric version such as `1.2.10`.
///
/// Missing trailing components compare as zero, so `1.2` == `1.2.0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version(Vec<u64>);

impl Version {
    /// The numeric components, most significant first.
    pub fn components(&self) -> &[u64] {
        &self.0
    }
}

impl FromStr for Version {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistrationError::InvalidVersion {
            version: s.to_string(),
        };
        if s.is_empty() {
            return Err(invalid());
        }
        let components = s
            .split('.')
            .map(|part| part.parse::<u64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Version(components))
    }
}

impl TryFrom<String> for Version {
    type Error = RegistrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_orders_component_wise() {
        let a: Version = "0.4.3".parse().unwrap();
        let b: Version = "0.4.10".parse().unwrap();
        let c: Version = "1.0".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, "0.4.3".parse().unwrap());
    }

    #[test]
    fn missing_components_compare_as_zero() {
        let short: Version = "1.2".parse().unwrap();
        let long: Version = "1.2.0".parse().unwrap();
        assert_eq!(short.cmp(&long), Ordering::Equal);
    }

    #[test]
    fn rejects_non_numeric_versions() {
        assert!("1.2b".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
        assert!("1..2".parse::<Version>().is_err());
    }

    #[test]
    fn round_trips_through_display() {
        let v: Version = "2.0.17".parse().unwrap();
        assert_eq!(v.to_string(), "2.0.17");
    }

    #[test]
    fn engine_version_constant_parses() {
        let v = game_engine_version();
        assert!(!v.components().is_empty());
    }
}
