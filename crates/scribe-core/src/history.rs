//! Mutation history
//!
//! Each committed write transaction leaves one history entry. Entries are
//! identified by a [`HistoryToken`], a cursor issued by the database that
//! only ever grows. A handle remembers the newest token it has merged and
//! asks only for entries after it.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::OriginId;
use crate::record::RecordId;

/// Totally ordered history cursor
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct HistoryToken(pub i64);

impl HistoryToken {
    /// Token preceding every entry
    pub const ZERO: HistoryToken = HistoryToken(0);

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for HistoryToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Record identities touched by one write transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryChanges {
    pub inserted: Vec<RecordId>,
    pub deleted: Vec<RecordId>,
}

impl HistoryChanges {
    pub fn inserted(ids: Vec<RecordId>) -> Self {
        Self {
            inserted: ids,
            deleted: Vec::new(),
        }
    }

    pub fn deleted(ids: Vec<RecordId>) -> Self {
        Self {
            inserted: Vec::new(),
            deleted: ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty()
    }
}

/// One persisted history entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub token: HistoryToken,
    pub origin: OriginId,
    pub changes: HistoryChanges,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_ordered() {
        assert!(HistoryToken::ZERO < HistoryToken(1));
        assert_eq!(HistoryToken::default(), HistoryToken::ZERO);
    }

    #[test]
    fn test_changes_constructors() {
        let inserted = HistoryChanges::inserted(vec![RecordId(1)]);
        assert_eq!(inserted.inserted.len(), 1);
        assert!(inserted.deleted.is_empty());
        assert!(HistoryChanges::default().is_empty());
    }
}
