//! The store handle
//!
//! A [`MessageStore`] ties the three execution contexts of a handle
//! together: the writer thread, the reader connection used by fetches and
//! observation baselines, and the history tracker task.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use scribe_core::{HistoryToken, LogRecord, NewRecord, OriginId, Query, RecordId};

use crate::config::StoreConfig;
use crate::error::StorageError;
use crate::history::{HistoryStats, HistoryTracker, MergeEvent, MergeReport, TrackerHandle};
use crate::observation::{Observation, ObservationHub};
use crate::schema;
use crate::writer::{Completion, Writer, WriterHandle};

/// A handle to one store file
///
/// Several handles, in this process or others, may open the same file.
/// Writes made through one become visible to the others' observations
/// through history replay.
///
/// Must be opened inside a tokio runtime; observation and history tasks are
/// spawned on it.
pub struct MessageStore {
    config: StoreConfig,
    origin: OriginId,
    reader: Arc<Mutex<Connection>>,
    hub: Arc<ObservationHub>,
    writer: WriterHandle,
    writer_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    tracker: Option<TrackerHandle>,
    runtime: tokio::runtime::Handle,
    closed: AtomicBool,
}

impl MessageStore {
    /// Open or create the store described by `config`
    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub async fn open(config: StoreConfig) -> Result<Self, StorageError> {
        config.validate()?;
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let runtime = tokio::runtime::Handle::current();
        let origin = config.origin.clone().unwrap_or_else(OriginId::random);
        let path = config.path.clone();
        let busy_timeout = config.busy_timeout;

        let (writer_conn, reader_conn, tracker_conn, token) =
            tokio::task::spawn_blocking(move || -> Result<_, StorageError> {
                let writer = schema::open_connection(&path, busy_timeout)?;
                schema::initialize(&writer)?;
                let reader = schema::open_connection(&path, busy_timeout)?;
                let tracker = schema::open_connection(&path, busy_timeout)?;
                let token = schema::high_water_mark(&tracker)?;
                Ok((writer, reader, tracker, token))
            })
            .await
            .map_err(|e| StorageError::Io(format!("open task failed: {e}")))??;

        let cursor = if config.history.enabled {
            let cursor = Uuid::new_v4().to_string();
            schema::upsert_cursor(&writer_conn, &cursor, token, Utc::now())?;
            Some(cursor)
        } else {
            None
        };

        let hub = Arc::new(ObservationHub::new());
        let (writer, writer_thread) = Writer::spawn(
            writer_conn,
            Arc::clone(&hub),
            origin.clone(),
            cursor,
            config.history.cursor_ttl,
            config.max_write_batch,
        )?;

        let tracker = config.history.enabled.then(|| {
            HistoryTracker::spawn(
                &runtime,
                tracker_conn,
                config.history.clone(),
                &origin,
                token,
                Arc::clone(&hub),
                writer.clone(),
            )
        });

        info!(
            %origin,
            %token,
            history = config.history.enabled,
            "Message store opened"
        );

        Ok(Self {
            config,
            origin,
            reader: Arc::new(Mutex::new(reader_conn)),
            hub,
            writer,
            writer_thread: Mutex::new(Some(writer_thread)),
            tracker,
            runtime,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Origin tag written on this handle's history entries
    pub fn origin(&self) -> &OriginId {
        &self.origin
    }

    /// Queue an append and return its completion immediately
    pub fn enqueue_append(&self, record: NewRecord) -> Completion<RecordId> {
        self.writer.append(record)
    }

    /// Append a record and wait until it is durable
    pub async fn append(&self, record: NewRecord) -> Result<RecordId, StorageError> {
        self.enqueue_append(record).await
    }

    /// Queue a delete of every record dated at or before `before`
    ///
    /// `None` means now. The completion yields the number of records removed.
    pub fn enqueue_delete(&self, before: Option<DateTime<Utc>>) -> Completion<usize> {
        self.writer.delete(before.unwrap_or_else(Utc::now))
    }

    /// Delete every record dated at or before `before` and wait for it
    pub async fn delete(&self, before: Option<DateTime<Utc>>) -> Result<usize, StorageError> {
        self.enqueue_delete(before).await
    }

    /// Records matching `query`, newest first
    ///
    /// Reads the latest committed state. Fails as a whole; never returns a
    /// partial result.
    pub fn fetch(&self, query: &Query) -> Result<Vec<LogRecord>, StorageError> {
        let records = schema::select_records(&self.reader.lock(), query)?;
        debug!(count = records.len(), term = ?query.search_term(), "Fetched records");
        Ok(records)
    }

    /// Number of stored records
    pub fn count(&self) -> Result<u64, StorageError> {
        schema::count_records(&self.reader.lock())
    }

    /// Number of history entries not yet trimmed
    pub fn history_len(&self) -> Result<u64, StorageError> {
        schema::count_history(&self.reader.lock())
    }

    /// Deliver the complete result of `query` after each change to it
    ///
    /// No delivery is made for the current state. Deliveries run on the
    /// runtime the store was opened on.
    pub fn observe<F>(&self, query: Query, deliver: F) -> Result<Observation, StorageError>
    where
        F: Fn(Vec<LogRecord>) + Send + Sync + 'static,
    {
        let subscription = Observation::subscribe(&self.hub);
        let baseline = self.fetch(&query)?;
        let reader = Arc::clone(&self.reader);
        Ok(Observation::start(
            &self.runtime,
            Arc::clone(&self.hub),
            subscription,
            query,
            baseline,
            Arc::new(deliver),
            Arc::new(move |query: &Query| schema::select_records(&reader.lock(), query)),
        ))
    }

    /// Like [`observe`](Self::observe), delivering result sets on a channel
    pub fn observe_channel(
        &self,
        query: Query,
    ) -> Result<(Observation, mpsc::UnboundedReceiver<Vec<LogRecord>>), StorageError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let observation = self.observe(query, move |records| {
            let _ = tx.send(records);
        })?;
        Ok((observation, rx))
    }

    /// Replay history written by other handles now
    pub async fn sync_history(&self) -> Result<MergeReport, StorageError> {
        self.tracker()?.sync().await
    }

    /// Subscribe to merge cycle outcomes
    pub fn merge_events(&self) -> Result<broadcast::Receiver<MergeEvent>, StorageError> {
        Ok(self.tracker()?.shared().subscribe())
    }

    /// Counters of the history tracker, `None` when history is disabled
    pub fn history_stats(&self) -> Option<HistoryStats> {
        self.tracker.as_ref().map(|t| t.shared().stats())
    }

    /// Newest history token merged by this handle
    pub fn history_token(&self) -> Option<HistoryToken> {
        self.history_stats().map(|s| s.token)
    }

    fn tracker(&self) -> Result<&TrackerHandle, StorageError> {
        self.tracker.as_ref().ok_or(StorageError::HistoryDisabled)
    }

    /// Stop history replay, finish queued writes and release the file
    ///
    /// Writes queued after this call fail with [`StorageError::WriterClosed`].
    pub async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(tracker) = &self.tracker {
            tracker.stop().await;
        }
        let _ = self.writer.shutdown().await;

        let thread = self.writer_thread.lock().take();
        if let Some(thread) = thread {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?
                .map_err(|_| StorageError::Io("writer thread panicked".to_string()))?;
        }
        self.hub.close();
        info!(origin = %self.origin, "Message store closed");
        Ok(())
    }
}

impl Drop for MessageStore {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(origin = %self.origin, "Message store dropped without close");
        if let Some(tracker) = &self.tracker {
            tracker.stop_detached();
        }
        self.writer.shutdown_detached();
        self.hub.close();
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("path", &self.config.path)
            .field("origin", &self.origin)
            .field("history", &self.config.history.enabled)
            .finish()
    }
}
