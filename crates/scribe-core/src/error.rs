//! Error types for Scribe core types

use thiserror::Error;

/// Errors raised by the metadata codec
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    /// Persisted bytes matched none of the metadata shapes
    #[error("Corrupted metadata: {0}")]
    Corrupted(String),

    /// Metadata could not be encoded
    #[error("Metadata encoding failed: {0}")]
    Encode(String),
}

/// Errors related to parsing core values from text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Unknown log level: {0}")]
    UnknownLevel(String),

    #[error("Invalid origin identifier: {0}")]
    InvalidOrigin(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupted_message() {
        let err = MetadataError::Corrupted("expected string".into());
        assert!(err.to_string().starts_with("Corrupted metadata"));
    }

    #[test]
    fn test_unknown_level_message() {
        let err = ParseError::UnknownLevel("loud".into());
        assert!(err.to_string().contains("loud"));
    }
}
