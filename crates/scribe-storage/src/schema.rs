//! SQLite schema and row mapping
//!
//! Every connection a handle opens goes through [`open_connection`], which
//! applies the pragmas and registers the `scribe_fold` search function. The
//! helpers below are the only place SQL text lives.
//!
//! Relations:
//!
//! | table             | contents                                            |
//! |-------------------|-----------------------------------------------------|
//! | `messages`        | one row per log record                              |
//! | `history`         | one row per committed write transaction             |
//! | `history_cursors` | newest merged token of each live handle             |

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, Transaction, params, params_from_iter};
use tracing::warn;

use scribe_core::metadata;
use scribe_core::search::fold;
use scribe_core::{
    HistoryChanges, HistoryEntry, HistoryToken, Level, LogRecord, OriginId, Query, RecordId,
};

use crate::error::StorageError;

/// Name of the SQL function that folds text for searching
pub const FOLD_FUNCTION: &str = "scribe_fold";

/// Upper bound on bound parameters in one `IN (...)` list
const ID_CHUNK: usize = 500;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    label                TEXT    NOT NULL,
    level                TEXT    NOT NULL,
    message              TEXT    NOT NULL,
    metadata             BLOB,
    metadata_search_text TEXT,
    source               TEXT    NOT NULL,
    file                 TEXT    NOT NULL,
    function             TEXT    NOT NULL,
    line                 INTEGER NOT NULL,
    date                 INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_by_date ON messages(date DESC);

CREATE TABLE IF NOT EXISTS history (
    token      INTEGER PRIMARY KEY AUTOINCREMENT,
    origin     TEXT    NOT NULL,
    changes    BLOB    NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS history_cursors (
    handle     TEXT PRIMARY KEY,
    token      INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
";

const RECORD_COLUMNS: &str = "id, label, level, message, metadata, metadata_search_text, \
                              source, file, function, line, date";

/// Open a connection to the store file with pragmas and functions applied
pub fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, StorageError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
    register_functions(&conn)?;
    Ok(conn)
}

/// Create the relations if they do not exist yet
pub fn initialize(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

fn register_functions(conn: &Connection) -> Result<(), StorageError> {
    conn.create_scalar_function(
        FOLD_FUNCTION,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: Option<String> = ctx.get(0)?;
            Ok(text.map(|t| fold(&t)))
        },
    )?;
    Ok(())
}

/// Counter that changes whenever another connection commits
pub fn data_version(conn: &Connection) -> Result<i64, StorageError> {
    Ok(conn.query_row("PRAGMA data_version", [], |row| row.get(0))?)
}

/// Newest history token ever issued, including trimmed ones
pub fn high_water_mark(conn: &Connection) -> Result<HistoryToken, StorageError> {
    let seq: Option<i64> = conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = 'history'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(HistoryToken(seq.unwrap_or(0)))
}

pub fn to_micros(date: DateTime<Utc>) -> i64 {
    date.timestamp_micros()
}

pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

// ---------------------------------------------------------------------------
// messages
// ---------------------------------------------------------------------------

/// A record ready to be written, with metadata already encoded
#[derive(Debug, Clone)]
pub struct EncodedRecord {
    pub record: scribe_core::NewRecord,
    pub metadata: Option<Vec<u8>>,
    pub search_text: Option<String>,
    pub date: DateTime<Utc>,
}

impl EncodedRecord {
    /// Encode metadata and pin the date to the stored precision
    ///
    /// The record keeps the decoded metadata so that what observers receive
    /// equals what a later fetch returns.
    pub fn new(mut record: scribe_core::NewRecord, now: DateTime<Utc>) -> Result<Self, StorageError> {
        let metadata = match record.metadata.take().filter(|m| !m.is_empty()) {
            Some(m) => {
                let bytes = metadata::encode(&m)?;
                record.metadata = Some(metadata::decode(&bytes)?);
                Some(bytes)
            }
            None => None,
        };
        let search_text = record.metadata_search_text();
        let date = record.date.unwrap_or(now);
        let date = from_micros(to_micros(date)).unwrap_or(date);
        record.date = Some(date);
        Ok(Self {
            record,
            metadata,
            search_text,
            date,
        })
    }

    /// Stored form once the row id is known
    pub fn into_record(self, id: RecordId) -> LogRecord {
        self.record.into_record(id, self.date)
    }
}

/// SQLite integers are signed; lines are stored as the same 64 bits
fn line_to_sql(line: u64) -> i64 {
    i64::from_ne_bytes(line.to_ne_bytes())
}

fn line_from_sql(value: i64) -> u64 {
    u64::from_ne_bytes(value.to_ne_bytes())
}

pub fn insert_record(tx: &Transaction<'_>, encoded: &EncodedRecord) -> Result<RecordId, StorageError> {
    let record = &encoded.record;
    tx.execute(
        "INSERT INTO messages (label, level, message, metadata, metadata_search_text, \
                               source, file, function, line, date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.label,
            record.level.as_str(),
            record.message,
            encoded.metadata,
            encoded.search_text,
            record.source,
            record.file,
            record.function,
            line_to_sql(record.line),
            to_micros(encoded.date),
        ],
    )?;
    Ok(RecordId(tx.last_insert_rowid()))
}

/// Delete every record dated at or before `before`, returning their ids
pub fn delete_before(
    tx: &Transaction<'_>,
    before: DateTime<Utc>,
) -> Result<Vec<RecordId>, StorageError> {
    let cutoff = to_micros(before);
    let ids = {
        let mut stmt = tx.prepare("SELECT id FROM messages WHERE date <= ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![cutoff], |row| row.get::<_, i64>(0).map(RecordId))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };
    if !ids.is_empty() {
        tx.execute("DELETE FROM messages WHERE date <= ?1", params![cutoff])?;
    }
    Ok(ids)
}

/// Run a query in read order
pub fn select_records(conn: &Connection, query: &Query) -> Result<Vec<LogRecord>, StorageError> {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(levels) = query.levels() {
        if levels.is_empty() {
            clauses.push("1 = 0".to_string());
        } else {
            let marks = (1..=levels.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            clauses.push(format!("level IN ({marks})"));
            values.extend(levels.iter().map(|l| Value::Text(l.as_str().to_string())));
        }
    }

    if let Some(term) = query.folded_term() {
        values.push(Value::Text(term.to_string()));
        let n = values.len();
        clauses.push(format!(
            "(instr({FOLD_FUNCTION}(label), ?{n}) > 0 \
              OR instr({FOLD_FUNCTION}(message), ?{n}) > 0 \
              OR instr({FOLD_FUNCTION}(metadata_search_text), ?{n}) > 0)"
        ));
    }

    let mut sql = format!("SELECT {RECORD_COLUMNS} FROM messages");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY date DESC, id DESC");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StorageError::query(e.to_string()))?;
    let records = stmt
        .query_map(params_from_iter(values), row_to_record)
        .map_err(|e| StorageError::query(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::query(e.to_string()))?;
    Ok(records)
}

/// Load the records that still exist among `ids`, in read order
pub fn load_records(conn: &Connection, ids: &[RecordId]) -> Result<Vec<LogRecord>, StorageError> {
    let mut records = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(ID_CHUNK) {
        let marks = vec!["?"; chunk.len()].join(", ");
        let sql = format!("SELECT {RECORD_COLUMNS} FROM messages WHERE id IN ({marks})");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter().map(|id| id.get())), row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        records.extend(rows);
    }
    records.sort_by(LogRecord::read_order);
    Ok(records)
}

pub fn count_records(conn: &Connection) -> Result<u64, StorageError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
    Ok(u64::try_from(count).unwrap_or(0))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<LogRecord> {
    let id = RecordId(row.get(0)?);
    let level_text: String = row.get(2)?;
    let level: Level = level_text
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let blob: Option<Vec<u8>> = row.get(4)?;
    let metadata = match blob {
        Some(bytes) => match metadata::decode(&bytes) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(record = %id, error = %e, "Dropping corrupted metadata");
                None
            }
        },
        None => None,
    };
    let line: i64 = row.get(9)?;
    let micros: i64 = row.get(10)?;
    let date = from_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            10,
            Type::Integer,
            format!("date out of range: {micros}").into(),
        )
    })?;

    Ok(LogRecord {
        id,
        label: row.get(1)?,
        level,
        message: row.get(3)?,
        metadata,
        metadata_search_text: row.get(5)?,
        source: row.get(6)?,
        file: row.get(7)?,
        function: row.get(8)?,
        line: line_from_sql(line),
        date,
    })
}

// ---------------------------------------------------------------------------
// history
// ---------------------------------------------------------------------------

/// Record one committed transaction, returning its token
pub fn insert_history(
    tx: &Transaction<'_>,
    origin: &OriginId,
    changes: &HistoryChanges,
    now: DateTime<Utc>,
) -> Result<HistoryToken, StorageError> {
    let payload =
        postcard::to_allocvec(changes).map_err(|e| StorageError::serialization(e.to_string()))?;
    tx.execute(
        "INSERT INTO history (origin, changes, created_at) VALUES (?1, ?2, ?3)",
        params![origin.as_str(), payload, to_micros(now)],
    )?;
    Ok(HistoryToken(tx.last_insert_rowid()))
}

/// Entries strictly after `after`, oldest first
pub fn history_after(
    conn: &Connection,
    after: HistoryToken,
    limit: usize,
) -> Result<Vec<HistoryEntry>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT token, origin, changes, created_at FROM history
         WHERE token > ?1 ORDER BY token ASC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(
            params![after.get(), i64::try_from(limit).unwrap_or(i64::MAX)],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(token, origin, payload, created_at)| {
            let origin = OriginId::new(&origin).unwrap_or_else(|_| {
                warn!(token, origin = %origin, "History entry has an invalid origin; replaying it");
                OriginId::unknown()
            });
            let changes: HistoryChanges = postcard::from_bytes(&payload)?;
            Ok(HistoryEntry {
                token: HistoryToken(token),
                origin,
                changes,
                created_at: from_micros(created_at).unwrap_or_default(),
            })
        })
        .collect()
}

pub fn count_history(conn: &Connection) -> Result<u64, StorageError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?;
    Ok(u64::try_from(count).unwrap_or(0))
}

pub fn upsert_cursor(
    conn: &Connection,
    handle: &str,
    token: HistoryToken,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO history_cursors (handle, token, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(handle) DO UPDATE SET token = excluded.token, updated_at = excluded.updated_at",
        params![handle, token.get(), to_micros(now)],
    )?;
    Ok(())
}

pub fn remove_cursor(conn: &Connection, handle: &str) -> Result<(), StorageError> {
    conn.execute("DELETE FROM history_cursors WHERE handle = ?1", params![handle])?;
    Ok(())
}

/// Forget cursors not refreshed since `stale_before`, then delete history
/// every remaining cursor has moved past. Returns the number of entries
/// removed.
pub fn trim_history(conn: &Connection, stale_before: DateTime<Utc>) -> Result<usize, StorageError> {
    conn.execute(
        "DELETE FROM history_cursors WHERE updated_at < ?1",
        params![to_micros(stale_before)],
    )?;
    let floor: Option<i64> =
        conn.query_row("SELECT MIN(token) FROM history_cursors", [], |row| row.get(0))?;
    match floor {
        Some(floor) => Ok(conn.execute("DELETE FROM history WHERE token < ?1", params![floor])?),
        None => Ok(0),
    }
}
