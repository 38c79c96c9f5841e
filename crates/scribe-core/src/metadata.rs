//! Structured metadata attached to log records
//!
//! A [`MetadataValue`] is a closed recursive type: a string, a value rendered
//! to its string form at construction ([`MetadataValue::Stringable`]), an
//! ordered list of values, or a string-keyed map of values.
//!
//! ## Codec
//!
//! Values are persisted as plain JSON and decoded purely from shape. Decoding
//! tries a string, then a list, then a map; the first that parses wins.
//! `Stringable` therefore comes back as `String` after a round trip.
//!
//! ## Search text
//!
//! [`flatten`] joins every leaf string depth-first with `", "`. Map keys are
//! not part of the search text, and map values are visited in key order so
//! the derived text is identical across runs.

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MetadataError;

/// Top-level metadata attached to a record
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Separator placed between leaf strings of the search text
pub const FLATTEN_SEPARATOR: &str = ", ";

/// A single metadata value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetadataValue {
    /// A plain string
    String(String),
    /// A typed value already rendered to its string form
    Stringable(String),
    /// An ordered list of values
    Array(Vec<MetadataValue>),
    /// A string-keyed map of values
    Map(Metadata),
}

impl MetadataValue {
    /// Render any displayable value into a `Stringable`
    pub fn stringable(value: impl Display) -> Self {
        Self::Stringable(value.to_string())
    }

    /// Leaf strings of this value joined depth-first
    pub fn flatten(&self) -> String {
        match self {
            Self::String(s) | Self::Stringable(s) => s.clone(),
            Self::Array(values) => join(values.iter()),
            Self::Map(map) => join(map.values()),
        }
    }

    /// Encode this value as JSON bytes
    pub fn encode(&self) -> Result<Vec<u8>, MetadataError> {
        serde_json::to_vec(self).map_err(|e| MetadataError::Encode(e.to_string()))
    }

    /// Decode a value from JSON bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, MetadataError> {
        serde_json::from_slice(bytes).map_err(|e| MetadataError::Corrupted(e.to_string()))
    }
}

fn join<'a>(values: impl Iterator<Item = &'a MetadataValue>) -> String {
    values
        .map(MetadataValue::flatten)
        .collect::<Vec<_>>()
        .join(FLATTEN_SEPARATOR)
}

/// Flatten the values of a metadata map into search text
pub fn flatten(metadata: &Metadata) -> String {
    join(metadata.values())
}

/// Search text stored beside a record, absent when metadata is absent or empty
pub fn search_text(metadata: Option<&Metadata>) -> Option<String> {
    metadata.filter(|m| !m.is_empty()).map(flatten)
}

/// Encode a metadata map as JSON bytes
pub fn encode(metadata: &Metadata) -> Result<Vec<u8>, MetadataError> {
    serde_json::to_vec(metadata).map_err(|e| MetadataError::Encode(e.to_string()))
}

/// Decode a metadata map from JSON bytes
pub fn decode(bytes: &[u8]) -> Result<Metadata, MetadataError> {
    serde_json::from_slice(bytes).map_err(|e| MetadataError::Corrupted(e.to_string()))
}

impl Serialize for MetadataValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::String(s) | Self::Stringable(s) => serializer.serialize_str(s),
            Self::Array(values) => values.serialize(serializer),
            Self::Map(map) => map.serialize(serializer),
        }
    }
}

/// Decoding order: string, list, map
#[derive(Deserialize)]
#[serde(untagged)]
enum Shape {
    String(String),
    Array(Vec<MetadataValue>),
    Map(Metadata),
}

impl<'de> Deserialize<'de> for MetadataValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Shape::deserialize(deserializer)? {
            Shape::String(s) => Self::String(s),
            Shape::Array(values) => Self::Array(values),
            Shape::Map(map) => Self::Map(map),
        })
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl<V: Into<MetadataValue>> From<Vec<V>> for MetadataValue {
    fn from(values: Vec<V>) -> Self {
        Self::Array(values.into_iter().map(Into::into).collect())
    }
}

impl From<Metadata> for MetadataValue {
    fn from(map: Metadata) -> Self {
        Self::Map(map)
    }
}
