//! Live queries over the store
//!
//! The writer and the history tracker publish a [`ChangeSet`] for every
//! committed unit of work. Each [`Observation`] owns a task that folds
//! change sets into its materialized result and hands the complete result
//! to the subscriber whenever it actually changed.
//!
//! ## Delivery rules
//!
//! - Whole result sets are delivered, never diffs.
//! - Change sets queued while a delivery runs are coalesced into the next
//!   one, which carries the post-state of all of them.
//! - A change set that leaves the result untouched causes no delivery.
//! - Nothing is delivered for the baseline; the first delivery follows the
//!   first relevant change.
//! - Once [`Observation::invalidate`] returns, no delivery starts.
//! - A resync change set makes the observation re-read its query and
//!   deliver if the re-read result differs from what it held.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, ReentrantMutex};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use scribe_core::{HistoryToken, LogRecord, Query, RecordId};

use crate::error::StorageError;

/// Callback receiving the complete result set of an observation
pub type DeliverFn = Arc<dyn Fn(Vec<LogRecord>) + Send + Sync>;

/// Re-reads the current result of a query from the store
pub type ReloadFn = Arc<dyn Fn(&Query) -> Result<Vec<LogRecord>, StorageError> + Send + Sync>;

/// Rows touched by one committed unit of work
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// History entry that recorded the change, when one was written
    pub token: Option<HistoryToken>,
    /// Records as stored, in read order
    pub inserted: Vec<LogRecord>,
    /// Identities of removed records
    pub deleted: Vec<RecordId>,
    /// Changes were lost; every observation must re-read its query
    pub resync: bool,
}

impl ChangeSet {
    /// Change set telling observations to re-read from the store
    pub fn resync(token: HistoryToken) -> Self {
        Self {
            token: Some(token),
            resync: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.resync && self.inserted.is_empty() && self.deleted.is_empty()
    }
}

/// Fan-out point between committers and observations
#[derive(Default)]
pub struct ObservationHub {
    next_id: AtomicU64,
    subscribers: DashMap<u64, mpsc::UnboundedSender<Arc<ChangeSet>>>,
    publication: Mutex<()>,
}

impl ObservationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize a read-then-publish or commit-then-publish sequence
    ///
    /// Holding the guard across both steps keeps publication order equal to
    /// commit order between the writer and the history tracker.
    pub fn lock_publication(&self) -> MutexGuard<'_, ()> {
        self.publication.lock()
    }

    /// Send a change set to every live observation
    pub fn publish(&self, changes: Arc<ChangeSet>) {
        if changes.is_empty() {
            return;
        }
        trace!(
            inserted = changes.inserted.len(),
            deleted = changes.deleted.len(),
            resync = changes.resync,
            subscribers = self.subscribers.len(),
            "Publishing change set"
        );
        self.subscribers
            .retain(|_, tx| tx.send(Arc::clone(&changes)).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub(crate) fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<Arc<ChangeSet>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// Drop every subscription, ending all observation tasks
    pub fn close(&self) {
        self.subscribers.clear();
    }
}

/// Materialized result of one query
#[derive(Debug)]
struct LiveResult {
    query: Query,
    records: Vec<LogRecord>,
    ids: HashSet<RecordId>,
}

impl LiveResult {
    fn new(query: Query, baseline: Vec<LogRecord>) -> Self {
        let ids = baseline.iter().map(|r| r.id).collect();
        Self {
            query,
            records: baseline,
            ids,
        }
    }

    /// Fold one change set in, reporting whether the result changed
    fn apply(&mut self, changes: &ChangeSet) -> bool {
        let mut changed = false;

        if !changes.deleted.is_empty() {
            let mut removed = false;
            for id in &changes.deleted {
                removed |= self.ids.remove(id);
            }
            if removed {
                self.records.retain(|r| self.ids.contains(&r.id));
                changed = true;
            }
        }

        let mut inserted = false;
        for record in &changes.inserted {
            if self.query.matches(record) && self.ids.insert(record.id) {
                self.records.push(record.clone());
                inserted = true;
            }
        }
        if inserted {
            self.records.sort_by(LogRecord::read_order);
            changed = true;
        }

        changed
    }

    /// Swap in a freshly read result, reporting whether it differs
    fn replace(&mut self, records: Vec<LogRecord>) -> bool {
        if records == self.records {
            return false;
        }
        self.ids = records.iter().map(|r| r.id).collect();
        self.records = records;
        true
    }
}

/// Gate checked by every delivery and closed by invalidation
///
/// Reentrant so that a subscriber may invalidate from inside its callback.
type Gate = Arc<ReentrantMutex<Cell<bool>>>;

/// Handle to a live subscription
///
/// Dropping the handle invalidates the subscription.
pub struct Observation {
    id: u64,
    query: Query,
    gate: Gate,
    hub: Arc<ObservationHub>,
}

impl Observation {
    /// Register `deliver` for `query`, starting from `baseline`
    ///
    /// `subscription` must come from [`Observation::subscribe`] called
    /// before the baseline was read. `reload` is used on resync.
    pub(crate) fn start(
        runtime: &tokio::runtime::Handle,
        hub: Arc<ObservationHub>,
        subscription: Subscription,
        query: Query,
        baseline: Vec<LogRecord>,
        deliver: DeliverFn,
        reload: ReloadFn,
    ) -> Self {
        let gate: Gate = Arc::new(ReentrantMutex::new(Cell::new(true)));
        let Subscription { id, rx } = subscription;
        let live = LiveResult::new(query.clone(), baseline);
        runtime.spawn(run_observation(
            id,
            live,
            rx,
            Arc::clone(&gate),
            deliver,
            reload,
        ));
        debug!(observation = id, "Observation started");
        Self {
            id,
            query,
            gate,
            hub,
        }
    }

    /// Subscribe to change sets ahead of the baseline read
    pub(crate) fn subscribe(hub: &ObservationHub) -> Subscription {
        let (id, rx) = hub.subscribe();
        Subscription { id, rx }
    }

    /// Stop all further delivery
    ///
    /// Idempotent. Waits for a delivery already in progress on another
    /// thread to return; must not be called from a thread that such a
    /// delivery is itself blocked on.
    pub fn invalidate(&self) {
        let guard = self.gate.lock();
        if guard.replace(false) {
            debug!(observation = self.id, "Observation invalidated");
        }
        drop(guard);
        self.hub.unsubscribe(self.id);
    }

    pub fn is_active(&self) -> bool {
        self.gate.lock().get()
    }

    pub fn query(&self) -> &Query {
        &self.query
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl std::fmt::Debug for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observation")
            .field("id", &self.id)
            .field("query", &self.query)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A registered but not yet started subscription
pub(crate) struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Arc<ChangeSet>>,
}

async fn run_observation(
    id: u64,
    mut live: LiveResult,
    mut rx: mpsc::UnboundedReceiver<Arc<ChangeSet>>,
    gate: Gate,
    deliver: DeliverFn,
    reload: ReloadFn,
) {
    while let Some(first) = rx.recv().await {
        let mut changed = live.apply(&first);
        let mut resync = first.resync;
        while let Ok(next) = rx.try_recv() {
            changed |= live.apply(&next);
            resync |= next.resync;
        }
        if resync {
            changed |= reload_into(id, &mut live, &reload).await;
        }
        if !changed {
            continue;
        }
        trace!(observation = id, records = live.records.len(), "Delivering result set");
        if !deliver_if_active(&gate, &deliver, &live.records) {
            break;
        }
    }
    debug!(observation = id, "Observation task finished");
}

/// Re-read the query; later change sets already folded in are part of the read
async fn reload_into(id: u64, live: &mut LiveResult, reload: &ReloadFn) -> bool {
    let reload = Arc::clone(reload);
    let query = live.query.clone();
    match tokio::task::spawn_blocking(move || reload(&query)).await {
        Ok(Ok(records)) => {
            debug!(observation = id, records = records.len(), "Observation resynced");
            live.replace(records)
        }
        Ok(Err(e)) => {
            warn!(observation = id, error = %e, "Failed to re-read observation after resync");
            false
        }
        Err(e) => {
            warn!(observation = id, error = %e, "Observation re-read panicked");
            false
        }
    }
}

fn deliver_if_active(gate: &Gate, deliver: &DeliverFn, records: &[LogRecord]) -> bool {
    let guard = gate.lock();
    if !guard.get() {
        return false;
    }
    deliver(records.to_vec());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use scribe_core::{Level, NewRecord};

    fn record(id: i64, label: &str, secs: i64) -> LogRecord {
        let date = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        NewRecord::new(label, Level::Info, "m").into_record(RecordId(id), date)
    }

    fn inserted(records: Vec<LogRecord>) -> ChangeSet {
        ChangeSet {
            inserted: records,
            ..Default::default()
        }
    }

    fn no_reload() -> ReloadFn {
        Arc::new(|_: &Query| Ok::<_, StorageError>(Vec::new()))
    }

    #[test]
    fn test_live_result_inserts_in_read_order() {
        let mut live = LiveResult::new(Query::all(), vec![record(1, "a", 10)]);
        assert!(live.apply(&inserted(vec![record(2, "b", 20), record(3, "c", 0)])));
        let ids: Vec<i64> = live.records.iter().map(|r| r.id.get()).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn test_live_result_ignores_non_matching_and_duplicates() {
        let query = Query::all().with_search_term("keep");
        let mut live = LiveResult::new(query, vec![record(1, "keep", 0)]);
        assert!(!live.apply(&inserted(vec![record(2, "drop", 0)])));
        assert!(!live.apply(&inserted(vec![record(1, "keep", 0)])));
        assert_eq!(live.records.len(), 1);
    }

    #[test]
    fn test_live_result_deletes() {
        let mut live = LiveResult::new(Query::all(), vec![record(1, "a", 0), record(2, "b", 1)]);
        let delete = ChangeSet {
            deleted: vec![RecordId(1), RecordId(9)],
            ..Default::default()
        };
        assert!(live.apply(&delete));
        assert_eq!(live.records.len(), 1);
        assert!(!live.apply(&delete));
    }

    #[test]
    fn test_hub_drops_closed_subscribers() {
        let hub = ObservationHub::new();
        let (_id, rx) = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(rx);
        hub.publish(Arc::new(inserted(vec![record(1, "a", 0)])));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent_and_unsubscribes() {
        let hub = Arc::new(ObservationHub::new());
        let subscription = Observation::subscribe(&hub);
        let observation = Observation::start(
            &tokio::runtime::Handle::current(),
            Arc::clone(&hub),
            subscription,
            Query::all(),
            Vec::new(),
            Arc::new(|_| {}),
            no_reload(),
        );
        assert!(observation.is_active());
        observation.invalidate();
        observation.invalidate();
        assert!(!observation.is_active());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_delivery_after_change() {
        let hub = Arc::new(ObservationHub::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = Observation::subscribe(&hub);
        let _observation = Observation::start(
            &tokio::runtime::Handle::current(),
            Arc::clone(&hub),
            subscription,
            Query::all(),
            Vec::new(),
            Arc::new(move |records| {
                let _ = tx.send(records);
            }),
            no_reload(),
        );
        hub.publish(Arc::new(inserted(vec![record(1, "a", 0)])));
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.len(), 1);
    }

    #[test]
    fn test_resync_change_set_is_published() {
        assert!(!ChangeSet::resync(HistoryToken(4)).is_empty());
        assert!(ChangeSet::default().is_empty());
    }

    #[test]
    fn test_live_result_replace() {
        let mut live = LiveResult::new(Query::all(), vec![record(1, "a", 0)]);
        assert!(!live.replace(vec![record(1, "a", 0)]));
        assert!(live.replace(vec![record(2, "b", 1), record(1, "a", 0)]));
        assert!(!live.apply(&inserted(vec![record(2, "b", 1)])));
        assert_eq!(live.records.len(), 2);
    }

    #[tokio::test]
    async fn test_resync_rereads_and_delivers() {
        let hub = Arc::new(ObservationHub::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stored = Arc::new(Mutex::new(vec![record(3, "lost", 5), record(1, "a", 0)]));
        let reload: ReloadFn = {
            let stored = Arc::clone(&stored);
            Arc::new(move |query: &Query| {
                let records: Vec<LogRecord> =
                    stored.lock().iter().filter(|r| query.matches(r)).cloned().collect();
                Ok::<_, StorageError>(records)
            })
        };
        let subscription = Observation::subscribe(&hub);
        let _observation = Observation::start(
            &tokio::runtime::Handle::current(),
            Arc::clone(&hub),
            subscription,
            Query::all(),
            vec![record(1, "a", 0)],
            Arc::new(move |records| {
                let _ = tx.send(records);
            }),
            reload,
        );

        hub.publish(Arc::new(ChangeSet::resync(HistoryToken(9))));
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered, *stored.lock());

        // The re-read and the change set agree, so only one delivery follows
        stored.lock().insert(0, record(4, "b", 9));
        hub.publish(Arc::new(ChangeSet::resync(HistoryToken(10))));
        hub.publish(Arc::new(inserted(vec![record(4, "b", 9)])));
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.len(), 3);
        assert_eq!(delivered[0].id, RecordId(4));
    }
}
