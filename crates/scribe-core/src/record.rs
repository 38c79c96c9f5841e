//! Log records
//!
//! [`NewRecord`] carries the fields an emitter supplies; [`LogRecord`] is the
//! stored, immutable projection returned by reads and observations.

use std::cmp::{Ordering, Reverse};
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::level::Level;
use crate::metadata::{self, Metadata};

/// Store-assigned record identity, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub i64);

impl RecordId {
    /// Raw row id
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fields supplied by an emitter for one append
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    pub label: String,
    pub level: Level,
    pub message: String,
    pub metadata: Option<Metadata>,
    pub source: String,
    pub file: String,
    pub function: String,
    pub line: u64,
    /// Write time is used when absent
    pub date: Option<DateTime<Utc>>,
}

impl NewRecord {
    /// Create a record with empty provenance
    pub fn new(label: impl Into<String>, level: Level, message: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            level,
            message: message.into(),
            metadata: None,
            source: String::new(),
            file: String::new(),
            function: String::new(),
            line: 0,
            date: None,
        }
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the emitting module or subsystem
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the code location
    pub fn with_location(
        mut self,
        file: impl Into<String>,
        function: impl Into<String>,
        line: u64,
    ) -> Self {
        self.file = file.into();
        self.function = function.into();
        self.line = line;
        self
    }

    /// Set an explicit timestamp
    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Derived search text for the metadata column
    pub fn metadata_search_text(&self) -> Option<String> {
        metadata::search_text(self.metadata.as_ref())
    }

    /// Materialize the stored form once the store has assigned an id
    pub fn into_record(self, id: RecordId, written_at: DateTime<Utc>) -> LogRecord {
        let metadata_search_text = self.metadata_search_text();
        LogRecord {
            id,
            label: self.label,
            level: self.level,
            message: self.message,
            metadata: self.metadata.filter(|m| !m.is_empty()),
            metadata_search_text,
            source: self.source,
            file: self.file,
            function: self.function,
            line: self.line,
            date: self.date.unwrap_or(written_at),
        }
    }
}

/// A stored log record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: RecordId,
    pub label: String,
    pub level: Level,
    pub message: String,
    pub metadata: Option<Metadata>,
    pub metadata_search_text: Option<String>,
    pub source: String,
    pub file: String,
    pub function: String,
    pub line: u64,
    pub date: DateTime<Utc>,
}

impl LogRecord {
    /// Sort key for reads: newest first, later insertion first on equal dates
    pub fn read_order_key(&self) -> (Reverse<DateTime<Utc>>, Reverse<RecordId>) {
        (Reverse(self.date), Reverse(self.id))
    }

    /// Compare two records in read order
    pub fn read_order(a: &LogRecord, b: &LogRecord) -> Ordering {
        a.read_order_key().cmp(&b.read_order_key())
    }
}
