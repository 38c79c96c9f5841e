//! Error types for scribe-storage
//!
//! Every failure in this crate is reported to the caller through a `Result`
//! or a completion. None of them leave the store unusable.

use scribe_core::MetadataError;
use thiserror::Error;

/// Errors that can occur in storage operations
///
/// Payloads are strings so the error can be cloned and handed to every
/// caller that shared one unit of work (a group commit, a merge cycle).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// I/O error while preparing the store location
    #[error("I/O error: {0}")]
    Io(String),

    /// The database rejected an operation (busy, locked, full); retryable
    #[error("Database error: {0}")]
    Database(String),

    /// A read failed; no partial results are returned
    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    /// Metadata could not be encoded for storage
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The writer context has shut down
    #[error("Store writer is closed")]
    WriterClosed,

    /// History synchronization is not enabled for this handle
    #[error("History tracking is disabled")]
    HistoryDisabled,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

/// Convert from postcard Error to StorageError
impl From<postcard::Error> for StorageError {
    fn from(err: postcard::Error) -> Self {
        StorageError::Deserialization(err.to_string())
    }
}

impl StorageError {
    /// Create a new QueryExecution error
    pub fn query(message: impl Into<String>) -> Self {
        Self::QueryExecution(message.into())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Database(_) | Self::QueryExecution(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
        assert!(storage_err.is_transient());
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let err: StorageError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, StorageError::Database(_)));
    }

    #[test]
    fn test_metadata_error_conversion() {
        let err: StorageError = MetadataError::Corrupted("bad".into()).into();
        assert!(matches!(err, StorageError::Metadata(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_errors_are_cloneable() {
        let err = StorageError::query("index corrupt");
        assert_eq!(err.clone(), err);
        assert!(err.to_string().contains("index corrupt"));
    }
}
