//! # Scribe Core
//!
//! Core types for the Scribe structured log store.
//!
//! This crate has no I/O. It defines the shapes that the storage crate
//! persists and that readers receive:
//!
//! - [`MetadataValue`]: recursive structured metadata and its JSON codec
//! - [`NewRecord`] / [`LogRecord`]: the emitter input and the stored record
//! - [`Level`]: totally ordered severities
//! - [`Query`]: search term plus level subset, evaluated in SQL or in memory
//! - [`HistoryToken`], [`HistoryEntry`], [`OriginId`]: history replay cursors
//!
//! ## Example
//!
//! ```rust
//! use scribe_core::{Level, Metadata, MetadataValue, NewRecord, Query};
//!
//! let mut metadata = Metadata::new();
//! metadata.insert("user-id".into(), MetadataValue::from("1"));
//!
//! let record = NewRecord::new("auth", Level::Info, "user logged in")
//!     .with_metadata(metadata);
//! assert_eq!(record.metadata_search_text().as_deref(), Some("1"));
//!
//! let query = Query::all().with_search_term("logged").with_minimum_level(Level::Info);
//! assert_eq!(query.search_term(), Some("logged"));
//! ```

pub mod error;
pub mod history;
pub mod identity;
pub mod level;
pub mod metadata;
pub mod query;
pub mod record;
pub mod search;

pub use error::*;
pub use history::*;
pub use identity::*;
pub use level::*;
pub use metadata::{Metadata, MetadataValue};
pub use query::*;
pub use record::*;
