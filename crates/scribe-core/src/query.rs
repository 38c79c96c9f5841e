//! Record filters
//!
//! A [`Query`] combines an optional search term with an optional level
//! subset. It is normalized on construction: a blank term becomes no term,
//! and a level set equal to [`Level::ALL`] becomes no level filter.

use std::collections::BTreeSet;

use crate::level::Level;
use crate::record::LogRecord;
use crate::search::{contains_folded, fold};

/// Immutable filter used by fetches and observations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    search_term: Option<String>,
    folded_term: Option<String>,
    levels: Option<BTreeSet<Level>>,
}

impl Query {
    /// A query that matches every record
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to records whose label, message or metadata contain `term`
    pub fn with_search_term(mut self, term: impl AsRef<str>) -> Self {
        let trimmed = term.as_ref().trim();
        if trimmed.is_empty() {
            self.search_term = None;
            self.folded_term = None;
        } else {
            self.folded_term = Some(fold(trimmed));
            self.search_term = Some(trimmed.to_string());
        }
        self
    }

    /// Restrict to the given levels
    pub fn with_levels(mut self, levels: impl IntoIterator<Item = Level>) -> Self {
        let levels: BTreeSet<Level> = levels.into_iter().collect();
        self.levels = if levels.len() == Level::ALL.len() {
            None
        } else {
            Some(levels)
        };
        self
    }

    /// Restrict to `minimum` and every more severe level
    pub fn with_minimum_level(self, minimum: Level) -> Self {
        self.with_levels(Level::ALL.into_iter().filter(|l| *l >= minimum))
    }

    /// Trimmed search term as supplied
    pub fn search_term(&self) -> Option<&str> {
        self.search_term.as_deref()
    }

    /// Folded search term used for matching
    pub fn folded_term(&self) -> Option<&str> {
        self.folded_term.as_deref()
    }

    /// Level subset, `None` when levels are not filtered
    pub fn levels(&self) -> Option<&BTreeSet<Level>> {
        self.levels.as_ref()
    }

    /// True when the query filters nothing
    pub fn is_unfiltered(&self) -> bool {
        self.folded_term.is_none() && self.levels.is_none()
    }

    /// Evaluate the query against a record in memory
    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(levels) = &self.levels {
            if !levels.contains(&record.level) {
                return false;
            }
        }
        match &self.folded_term {
            None => true,
            Some(term) => {
                contains_folded(&record.label, term)
                    || contains_folded(&record.message, term)
                    || record
                        .metadata_search_text
                        .as_deref()
                        .is_some_and(|text| contains_folded(text, term))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Metadata, MetadataValue};
    use crate::record::{NewRecord, RecordId};
    use chrono::Utc;

    fn record(label: &str, level: Level, message: &str) -> LogRecord {
        NewRecord::new(label, level, message).into_record(RecordId(1), Utc::now())
    }

    #[test]
    fn test_blank_term_is_no_term() {
        let query = Query::all().with_search_term("   ");
        assert!(query.search_term().is_none());
        assert!(query.is_unfiltered());
    }

    #[test]
    fn test_term_is_trimmed() {
        let query = Query::all().with_search_term("  Label ");
        assert_eq!(query.search_term(), Some("Label"));
        assert_eq!(query.folded_term(), Some("label"));
    }

    #[test]
    fn test_full_level_set_is_no_filter() {
        let query = Query::all().with_levels(Level::ALL);
        assert!(query.levels().is_none());
        assert_eq!(query, Query::all());
    }

    #[test]
    fn test_empty_level_set_matches_nothing() {
        let query = Query::all().with_levels(Vec::<Level>::new());
        assert!(!query.matches(&record("a", Level::Info, "b")));
    }

    #[test]
    fn test_minimum_level() {
        let query = Query::all().with_minimum_level(Level::Error);
        assert!(query.matches(&record("a", Level::Fault, "b")));
        assert!(!query.matches(&record("a", Level::Default, "b")));
    }

    #[test]
    fn test_matches_label_message_and_metadata() {
        let metadata: Metadata = [("key".to_string(), MetadataValue::from("Métadata"))]
            .into_iter()
            .collect();
        let with_metadata = NewRecord::new("label2", Level::Info, "message2")
            .with_metadata(metadata)
            .into_record(RecordId(2), Utc::now());
        let plain = record("label1", Level::Info, "message1");

        let by_label = Query::all().with_search_term("LABEL");
        assert!(by_label.matches(&plain) && by_label.matches(&with_metadata));

        let by_metadata = Query::all().with_search_term("metadata");
        assert!(by_metadata.matches(&with_metadata));
        assert!(!by_metadata.matches(&plain));

        let by_digit = Query::all().with_search_term("1");
        assert!(by_digit.matches(&plain));
        assert!(!by_digit.matches(&with_metadata));
    }

    #[test]
    fn test_keys_are_not_searched() {
        let metadata: Metadata = [("secret-key".to_string(), MetadataValue::from("v"))]
            .into_iter()
            .collect();
        let rec = NewRecord::new("l", Level::Info, "m")
            .with_metadata(metadata)
            .into_record(RecordId(3), Utc::now());
        assert!(!Query::all().with_search_term("secret").matches(&rec));
    }
}
