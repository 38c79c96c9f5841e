//! # Scribe Storage
//!
//! Persistent log message store backed by a single SQLite file.
//!
//! ## Features
//!
//! - **MessageStore**: durable append, filtered fetch and delete-before
//!   through a single-writer thread with group commit
//! - **Observation**: live queries that receive the complete result set
//!   after each committed change that affects it
//! - **History replay**: token-cursor synchronization between handles that
//!   share one store file, including handles in other processes
//! - **LogSink**: the write entry point consumed by logging front-ends
//!
//! ## Example
//!
//! ```rust,no_run
//! use scribe_core::{Level, NewRecord, Query};
//! use scribe_storage::{MessageStore, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), scribe_storage::StorageError> {
//!     let store = MessageStore::open(StoreConfig::new("./logs.sqlite")).await?;
//!
//!     let (_observation, mut updates) =
//!         store.observe_channel(Query::all().with_minimum_level(Level::Error))?;
//!
//!     store
//!         .append(NewRecord::new("net", Level::Error, "connection reset"))
//!         .await?;
//!
//!     let latest = updates.recv().await.unwrap_or_default();
//!     assert_eq!(latest.len(), store.fetch(&Query::all().with_minimum_level(Level::Error))?.len());
//!
//!     store.close().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod history;
pub mod observation;
pub mod schema;
pub mod store;
pub mod writer;

// Re-exports
pub use config::{HistoryConfig, StoreConfig};
pub use error::StorageError;
pub use history::{HistoryStats, MergeEvent, MergeReport};
pub use observation::{ChangeSet, Observation};
pub use store::MessageStore;
pub use writer::Completion;

use async_trait::async_trait;
use scribe_core::{NewRecord, RecordId};

/// Write entry point for emitters
///
/// Front-ends that filter by level and format messages hand finished
/// records to a sink. Implementations persist the record and report the
/// outcome exactly once.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Persist one record
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be written; the caller may
    /// retry when [`StorageError::is_transient`] holds.
    async fn append(&self, record: NewRecord) -> Result<RecordId, StorageError>;
}

#[async_trait]
impl LogSink for MessageStore {
    async fn append(&self, record: NewRecord) -> Result<RecordId, StorageError> {
        MessageStore::append(self, record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::{Level, Query};

    /// Test that the LogSink trait is object-safe
    fn _assert_object_safe(_: &dyn LogSink) {}

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_store_as_sink() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(StoreConfig::new(dir.path().join("sink.sqlite")))
            .await
            .unwrap();
        let sink: &dyn LogSink = &store;

        let id = sink
            .append(NewRecord::new("sink", Level::Info, "hello"))
            .await
            .unwrap();

        let records = store.fetch(&Query::all()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        store.close().await.unwrap();
    }
}
