//! Origin identifiers
//!
//! Every history entry is tagged with the [`OriginId`] of the handle that
//! wrote it. Handles use origins to skip their own entries during replay.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseError;

/// Opaque tag naming the logical owner of a store handle
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OriginId(String);

impl OriginId {
    /// Create an origin from a caller-chosen name
    ///
    /// Names are trimmed; blank names are rejected.
    pub fn new(name: impl AsRef<str>) -> Result<Self, ParseError> {
        let trimmed = name.as_ref().trim();
        if trimmed.is_empty() {
            return Err(ParseError::InvalidOrigin(name.as_ref().to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Generate a unique origin for an anonymous handle
    pub fn random() -> Self {
        Self(format!("handle-{}", Uuid::new_v4()))
    }

    /// Stand-in for a stored origin that is not a valid identifier
    ///
    /// Never equal to an origin produced by [`OriginId::new`] or
    /// [`OriginId::random`], so it is never excluded from replay.
    pub fn unknown() -> Self {
        Self(String::new())
    }

    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OriginId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OriginId> for String {
    fn from(origin: OriginId) -> Self {
        origin.0
    }
}

impl Display for OriginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OriginId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_is_trimmed() {
        let origin = OriginId::new("  com.example.app ").unwrap();
        assert_eq!(origin.as_str(), "com.example.app");
    }

    #[test]
    fn test_blank_origin_rejected() {
        assert!(OriginId::new("  ").is_err());
        assert!("".parse::<OriginId>().is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let origin: OriginId = serde_json::from_str("\" app \"").unwrap();
        assert_eq!(origin.as_str(), "app");
        assert!(serde_json::from_str::<OriginId>("\"  \"").is_err());
        assert_eq!(serde_json::to_string(&origin).unwrap(), "\"app\"");
    }

    #[test]
    fn test_unknown_differs_from_every_valid_origin() {
        let unknown = OriginId::unknown();
        assert!(unknown.is_unknown());
        assert!(!OriginId::new("x").unwrap().is_unknown());
        assert_ne!(unknown, OriginId::random());
    }

    #[test]
    fn test_random_origins_differ() {
        assert_ne!(OriginId::random(), OriginId::random());
    }
}
