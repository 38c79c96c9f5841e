//! History synchronization
//!
//! Every committed write leaves a history entry. A [`HistoryTracker`]
//! replays the entries other handles wrote after its token into the local
//! observations, then advances the token and lets the writer trim history
//! that every live handle has consumed.
//!
//! Handles:
//! - Detection of commits by other connections (`PRAGMA data_version`)
//! - Explicit merge requests from [`MessageStore::sync_history`](crate::MessageStore::sync_history)
//! - Cursor heartbeats so idle handles keep their place
//!
//! At most one merge cycle runs at a time. Requests that arrive while a
//! cycle runs are answered by the next one. A failed cycle leaves the token
//! untouched so the same entries are retried.
//!
//! Tokens are contiguous, so a missing entry after the token means history
//! was trimmed past it. The cycle then jumps to the newest token and every
//! observation re-reads its query instead of replaying entries.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use scribe_core::{HistoryEntry, HistoryToken, OriginId};

use crate::config::HistoryConfig;
use crate::error::StorageError;
use crate::observation::{ChangeSet, ObservationHub};
use crate::schema;
use crate::writer::WriterHandle;

/// Capacity of the merge event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Outcome of one merge cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Token before the cycle
    pub from: HistoryToken,
    /// Token after the cycle
    pub to: HistoryToken,
    /// Entries replayed into observations
    pub entries_merged: usize,
    /// Entries skipped by the origin filter
    pub entries_skipped: usize,
    /// Record rows read from the store while merging
    pub rows_loaded: usize,
    /// Entries were missing; observations were told to re-read
    pub resynced: bool,
}

impl MergeReport {
    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }
}

/// Notification emitted after each merge cycle that did work or failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeEvent {
    Merged(MergeReport),
    /// History after the token had been trimmed
    Resynced(MergeReport),
    Failed(String),
}

/// Cumulative counters of a handle's tracker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryStats {
    pub cycles: u64,
    pub entries_merged: u64,
    pub entries_skipped: u64,
    pub rows_loaded: u64,
    pub failures: u64,
    pub resyncs: u64,
    pub token: HistoryToken,
}

impl HistoryStats {
    fn record(&mut self, report: &MergeReport) {
        self.cycles += 1;
        self.entries_merged += report.entries_merged as u64;
        self.entries_skipped += report.entries_skipped as u64;
        self.rows_loaded += report.rows_loaded as u64;
        self.resyncs += u64::from(report.resynced);
        self.token = report.to;
    }
}

/// State shared between the tracker task and the store handle
pub(crate) struct TrackerShared {
    stats: Mutex<HistoryStats>,
    events: broadcast::Sender<MergeEvent>,
}

impl TrackerShared {
    fn new(token: HistoryToken) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            stats: Mutex::new(HistoryStats {
                token,
                ..Default::default()
            }),
            events,
        }
    }

    pub fn stats(&self) -> HistoryStats {
        *self.stats.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MergeEvent> {
        self.events.subscribe()
    }
}

type SyncReply = oneshot::Sender<Result<MergeReport, StorageError>>;

/// Store-side handle to a running tracker
pub(crate) struct TrackerHandle {
    requests: mpsc::Sender<SyncReply>,
    shutdown: broadcast::Sender<()>,
    shared: Arc<TrackerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TrackerHandle {
    /// Run a merge cycle now, or join the one about to run
    pub async fn sync(&self) -> Result<MergeReport, StorageError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(reply)
            .await
            .map_err(|_| StorageError::WriterClosed)?;
        rx.await.map_err(|_| StorageError::WriterClosed)?
    }

    pub fn shared(&self) -> &Arc<TrackerShared> {
        &self.shared
    }

    /// Stop the tracker and wait for it to exit
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "History tracker task failed");
            }
        }
    }

    /// Stop the tracker without waiting
    pub fn stop_detached(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Background merge loop of one handle
pub(crate) struct HistoryTracker {
    conn: Arc<Mutex<Connection>>,
    config: HistoryConfig,
    excluded: Arc<HashSet<OriginId>>,
    token: HistoryToken,
    data_version: Option<i64>,
    hub: Arc<ObservationHub>,
    writer: WriterHandle,
    shared: Arc<TrackerShared>,
    requests: mpsc::Receiver<SyncReply>,
    shutdown_rx: broadcast::Receiver<()>,
    last_heartbeat: Instant,
}

impl HistoryTracker {
    /// Spawn the tracker on `runtime`, starting from `token`
    pub fn spawn(
        runtime: &tokio::runtime::Handle,
        conn: Connection,
        config: HistoryConfig,
        origin: &OriginId,
        token: HistoryToken,
        hub: Arc<ObservationHub>,
        writer: WriterHandle,
    ) -> TrackerHandle {
        let mut excluded: HashSet<OriginId> = config.exclude_origins.iter().cloned().collect();
        excluded.insert(origin.clone());

        let (requests_tx, requests) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let shared = Arc::new(TrackerShared::new(token));

        let tracker = Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
            excluded: Arc::new(excluded),
            token,
            data_version: None,
            hub,
            writer,
            shared: Arc::clone(&shared),
            requests,
            shutdown_rx,
            last_heartbeat: Instant::now(),
        };
        let task = runtime.spawn(tracker.run());

        TrackerHandle {
            requests: requests_tx,
            shutdown,
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self) {
        info!(
            token = %self.token,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "History tracker started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("History tracker shutting down");
                    break;
                }
                request = self.requests.recv() => {
                    let Some(reply) = request else {
                        break;
                    };
                    let mut replies = vec![reply];
                    while let Ok(reply) = self.requests.try_recv() {
                        replies.push(reply);
                    }
                    let result = self.cycle().await;
                    for reply in replies {
                        let _ = reply.send(result.clone());
                    }
                }
                _ = interval.tick() => {
                    if self.changed_externally().await {
                        let _ = self.cycle().await;
                    }
                    self.heartbeat();
                }
            }
        }
    }

    /// Whether another connection committed since the last check
    async fn changed_externally(&mut self) -> bool {
        let conn = Arc::clone(&self.conn);
        let version =
            tokio::task::spawn_blocking(move || schema::data_version(&conn.lock())).await;
        match version {
            Ok(Ok(version)) => {
                let changed = self.data_version != Some(version);
                self.data_version = Some(version);
                changed
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to read data version");
                true
            }
            Err(e) => {
                warn!(error = %e, "Data version check panicked");
                false
            }
        }
    }

    fn heartbeat(&mut self) {
        if self.last_heartbeat.elapsed() >= self.config.cursor_ttl / 4 {
            self.writer.checkpoint(self.token);
            self.last_heartbeat = Instant::now();
        }
    }

    /// Run one merge cycle
    #[instrument(skip(self), fields(from = %self.token))]
    async fn cycle(&mut self) -> Result<MergeReport, StorageError> {
        let conn = Arc::clone(&self.conn);
        let hub = Arc::clone(&self.hub);
        let excluded = Arc::clone(&self.excluded);
        let from = self.token;
        let batch_size = self.config.batch_size;

        let result = tokio::task::spawn_blocking(move || {
            merge(&conn.lock(), &hub, &excluded, from, batch_size)
        })
        .await
        .unwrap_or_else(|e| Err(StorageError::Database(format!("merge task failed: {e}"))));

        match result {
            Ok(report) => {
                self.shared.stats.lock().record(&report);
                if !report.is_empty() {
                    self.token = report.to;
                    let event = if report.resynced {
                        warn!(
                            from = %report.from,
                            to = %report.to,
                            "History was trimmed past this handle; observations re-read"
                        );
                        MergeEvent::Resynced(report)
                    } else {
                        debug!(
                            to = %report.to,
                            merged = report.entries_merged,
                            skipped = report.entries_skipped,
                            rows = report.rows_loaded,
                            "Merged history"
                        );
                        MergeEvent::Merged(report)
                    };
                    let _ = self.shared.events.send(event);
                    self.writer.checkpoint(self.token);
                    self.last_heartbeat = Instant::now();
                }
                Ok(report)
            }
            Err(e) => {
                self.shared.stats.lock().failures += 1;
                warn!(error = %e, token = %self.token, "History merge failed; will retry");
                let _ = self.shared.events.send(MergeEvent::Failed(e.to_string()));
                Err(e)
            }
        }
    }
}

/// Read every entry after `from`, load the rows it inserted and publish
///
/// Nothing is published unless every entry was read and loaded. When
/// entries after `from` are gone, a single resync change set is published
/// instead.
fn merge(
    conn: &Connection,
    hub: &ObservationHub,
    excluded: &HashSet<OriginId>,
    from: HistoryToken,
    batch_size: usize,
) -> Result<MergeReport, StorageError> {
    let mut report = MergeReport {
        from,
        to: from,
        ..Default::default()
    };

    // One read snapshot for the entries, the rows and the high-water mark
    let snapshot = conn.unchecked_transaction()?;

    let mut pending: Vec<HistoryEntry> = Vec::new();
    loop {
        let entries = schema::history_after(&snapshot, report.to, batch_size)?;
        let exhausted = entries.len() < batch_size;
        for entry in entries {
            if entry.token.get() != report.to.get() + 1 {
                report.resynced = true;
            }
            report.to = entry.token;
            if excluded.contains(&entry.origin) {
                report.entries_skipped += 1;
            } else {
                pending.push(entry);
            }
        }
        if exhausted {
            break;
        }
    }

    let high_water = schema::high_water_mark(&snapshot)?;
    if high_water > report.to {
        report.resynced = true;
        report.to = high_water;
    }

    if report.resynced {
        report.entries_merged = pending.len();
        let _publication = hub.lock_publication();
        hub.publish(Arc::new(ChangeSet::resync(report.to)));
        return Ok(report);
    }

    if pending.is_empty() {
        return Ok(report);
    }

    let _publication = hub.lock_publication();
    let mut change_sets = Vec::with_capacity(pending.len());
    for entry in pending {
        let inserted = if entry.changes.inserted.is_empty() {
            Vec::new()
        } else {
            schema::load_records(&snapshot, &entry.changes.inserted)?
        };
        report.rows_loaded += inserted.len();
        change_sets.push(ChangeSet {
            token: Some(entry.token),
            inserted,
            deleted: entry.changes.deleted,
            resync: false,
        });
        report.entries_merged += 1;
    }
    for changes in change_sets {
        hub.publish(Arc::new(changes));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use scribe_core::{HistoryChanges, Level, NewRecord};

    use crate::schema::EncodedRecord;

    fn open_temp() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn =
            schema::open_connection(&dir.path().join("h.sqlite"), Duration::from_secs(1)).unwrap();
        schema::initialize(&conn).unwrap();
        (dir, conn)
    }

    fn write(conn: &mut Connection, origin: &OriginId, label: &str) -> HistoryToken {
        let tx = conn.transaction().unwrap();
        let encoded = EncodedRecord::new(NewRecord::new(label, Level::Info, "m"), Utc::now()).unwrap();
        let id = schema::insert_record(&tx, &encoded).unwrap();
        let token =
            schema::insert_history(&tx, origin, &HistoryChanges::inserted(vec![id]), Utc::now())
                .unwrap();
        tx.commit().unwrap();
        token
    }

    #[test]
    fn test_merge_skips_excluded_origins_but_advances() {
        let (_dir, mut conn) = open_temp();
        let me = OriginId::new("me").unwrap();
        let other = OriginId::new("other").unwrap();
        write(&mut conn, &me, "mine");
        let last = write(&mut conn, &other, "theirs");

        let hub = ObservationHub::new();
        let excluded: HashSet<OriginId> = [me].into_iter().collect();
        let report = merge(&conn, &hub, &excluded, HistoryToken::ZERO, 10).unwrap();
        assert_eq!(report.to, last);
        assert_eq!(report.entries_skipped, 1);
        assert_eq!(report.entries_merged, 1);
        assert_eq!(report.rows_loaded, 1);
    }

    #[test]
    fn test_merge_reads_in_batches() {
        let (_dir, mut conn) = open_temp();
        let other = OriginId::new("other").unwrap();
        let mut last = HistoryToken::ZERO;
        for i in 0..7 {
            last = write(&mut conn, &other, &format!("r{i}"));
        }
        let hub = ObservationHub::new();
        let report = merge(&conn, &hub, &HashSet::new(), HistoryToken::ZERO, 3).unwrap();
        assert_eq!(report.to, last);
        assert_eq!(report.entries_merged, 7);
    }

    #[test]
    fn test_merge_from_current_token_is_empty() {
        let (_dir, mut conn) = open_temp();
        let other = OriginId::new("other").unwrap();
        let last = write(&mut conn, &other, "r");
        let hub = ObservationHub::new();
        let report = merge(&conn, &hub, &HashSet::new(), last, 10).unwrap();
        assert!(report.is_empty());
        assert_eq!(report.rows_loaded, 0);
    }

    #[tokio::test]
    async fn test_merge_detects_trimmed_history() {
        let (_dir, mut conn) = open_temp();
        let other = OriginId::new("other").unwrap();
        let first = write(&mut conn, &other, "r0");
        write(&mut conn, &other, "r1");
        conn.execute("DELETE FROM history WHERE token <= ?1", [first.get() + 1])
            .unwrap();
        let last = write(&mut conn, &other, "r2");

        let hub = ObservationHub::new();
        let (_id, mut rx) = hub.subscribe();
        let report = merge(&conn, &hub, &HashSet::new(), first, 10).unwrap();
        assert!(report.resynced);
        assert_eq!(report.to, last);
        assert_eq!(report.rows_loaded, 0);

        let changes = rx.recv().await.unwrap();
        assert!(changes.resync);
        assert_eq!(changes.token, Some(last));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_merge_detects_fully_trimmed_history() {
        let (_dir, mut conn) = open_temp();
        let other = OriginId::new("other").unwrap();
        write(&mut conn, &other, "r0");
        let last = write(&mut conn, &other, "r1");
        conn.execute("DELETE FROM history", []).unwrap();

        let hub = ObservationHub::new();
        let report = merge(&conn, &hub, &HashSet::new(), HistoryToken::ZERO, 10).unwrap();
        assert!(report.resynced);
        assert_eq!(report.to, last);

        let current = merge(&conn, &hub, &HashSet::new(), last, 10).unwrap();
        assert!(!current.resynced);
        assert!(current.is_empty());
    }

    #[test]
    fn test_stats_accumulate() {
        let mut stats = HistoryStats::default();
        stats.record(&MergeReport {
            from: HistoryToken(0),
            to: HistoryToken(3),
            entries_merged: 2,
            entries_skipped: 1,
            rows_loaded: 5,
            resynced: true,
        });
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.resyncs, 1);
        assert_eq!(stats.rows_loaded, 5);
        assert_eq!(stats.token, HistoryToken(3));
    }
}
