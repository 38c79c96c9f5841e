//! Single-writer context
//!
//! One OS thread per handle owns the write connection and drains a command
//! queue in order. Consecutive appends are committed together (group
//! commit) with a single history entry; deletes and checkpoints are applied
//! one at a time so write order is preserved. Each committed unit of work is
//! published to the [`ObservationHub`] before its callers are answered.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use scribe_core::{HistoryChanges, HistoryToken, NewRecord, OriginId, RecordId};

use crate::error::StorageError;
use crate::observation::{ChangeSet, ObservationHub};
use crate::schema::{self, EncodedRecord};

type Reply<T> = oneshot::Sender<Result<T, StorageError>>;

/// Work queued for the writer thread
pub(crate) enum WriteCommand {
    Append {
        record: NewRecord,
        reply: Reply<RecordId>,
    },
    Delete {
        before: DateTime<Utc>,
        reply: Reply<usize>,
    },
    /// Persist this handle's merged token and trim consumed history
    Checkpoint { token: HistoryToken },
    /// Finish queued work, drop the cursor and exit
    Shutdown { done: Option<oneshot::Sender<()>> },
}

/// Future resolving once a queued write is durable or has failed
///
/// Resolves exactly once. Dropping it does not cancel the write.
#[must_use = "dropping a completion discards the write result, not the write"]
pub struct Completion<T> {
    state: CompletionState<T>,
}

enum CompletionState<T> {
    Pending(oneshot::Receiver<Result<T, StorageError>>),
    Ready(Option<Result<T, StorageError>>),
}

impl<T> Completion<T> {
    fn pending(rx: oneshot::Receiver<Result<T, StorageError>>) -> Self {
        Self {
            state: CompletionState::Pending(rx),
        }
    }

    fn failed(err: StorageError) -> Self {
        Self {
            state: CompletionState::Ready(Some(Err(err))),
        }
    }
}

impl<T> Unpin for Completion<T> {}

impl<T> Future for Completion<T> {
    type Output = Result<T, StorageError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            CompletionState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(StorageError::WriterClosed))),
            CompletionState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(StorageError::WriterClosed)))
            }
        }
    }
}

/// Sending side of the writer queue
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::UnboundedSender<WriteCommand>,
}

impl WriterHandle {
    pub fn append(&self, record: NewRecord) -> Completion<RecordId> {
        let (reply, rx) = oneshot::channel();
        match self.tx.send(WriteCommand::Append { record, reply }) {
            Ok(()) => Completion::pending(rx),
            Err(_) => Completion::failed(StorageError::WriterClosed),
        }
    }

    pub fn delete(&self, before: DateTime<Utc>) -> Completion<usize> {
        let (reply, rx) = oneshot::channel();
        match self.tx.send(WriteCommand::Delete { before, reply }) {
            Ok(()) => Completion::pending(rx),
            Err(_) => Completion::failed(StorageError::WriterClosed),
        }
    }

    pub fn checkpoint(&self, token: HistoryToken) {
        if self.tx.send(WriteCommand::Checkpoint { token }).is_err() {
            debug!(%token, "Writer closed, checkpoint dropped");
        }
    }

    /// Ask the writer to exit after queued work; resolves once it has
    pub fn shutdown(&self) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        let _ = self.tx.send(WriteCommand::Shutdown { done: Some(done) });
        rx
    }

    /// Ask the writer to exit without waiting
    pub fn shutdown_detached(&self) {
        let _ = self.tx.send(WriteCommand::Shutdown { done: None });
    }
}

/// Writer thread state
pub(crate) struct Writer {
    conn: Connection,
    rx: mpsc::UnboundedReceiver<WriteCommand>,
    hub: Arc<ObservationHub>,
    origin: OriginId,
    /// Cursor row of this handle; `None` when history is disabled
    cursor: Option<String>,
    cursor_ttl: Duration,
    max_batch: usize,
}

impl Writer {
    /// Spawn the writer thread
    pub fn spawn(
        conn: Connection,
        hub: Arc<ObservationHub>,
        origin: OriginId,
        cursor: Option<String>,
        cursor_ttl: Duration,
        max_batch: usize,
    ) -> Result<(WriterHandle, JoinHandle<()>), StorageError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = Self {
            conn,
            rx,
            hub,
            origin,
            cursor,
            cursor_ttl,
            max_batch: max_batch.max(1),
        };
        let thread = std::thread::Builder::new()
            .name("scribe-writer".to_string())
            .spawn(move || writer.run())?;
        Ok((WriterHandle { tx }, thread))
    }

    fn run(mut self) {
        info!(origin = %self.origin, "Writer started");
        let mut carried: Option<WriteCommand> = None;
        let mut done = None;

        loop {
            let command = match carried.take() {
                Some(command) => command,
                None => match self.rx.blocking_recv() {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                WriteCommand::Append { record, reply } => {
                    let mut batch = vec![(record, reply)];
                    while batch.len() < self.max_batch {
                        match self.rx.try_recv() {
                            Ok(WriteCommand::Append { record, reply }) => {
                                batch.push((record, reply))
                            }
                            Ok(other) => {
                                carried = Some(other);
                                break;
                            }
                            Err(_) => break,
                        }
                    }
                    self.commit_appends(batch);
                }
                WriteCommand::Delete { before, reply } => {
                    let _ = reply.send(self.commit_delete(before));
                }
                WriteCommand::Checkpoint { token } => self.checkpoint(token),
                WriteCommand::Shutdown { done: signal } => {
                    done = signal;
                    break;
                }
            }
        }

        if let Some(cursor) = &self.cursor {
            let result = schema::remove_cursor(&self.conn, cursor)
                .and_then(|()| schema::trim_history(&self.conn, self.stale_before()));
            if let Err(e) = result {
                warn!(error = %e, "Failed to release history cursor");
            }
        }
        info!(origin = %self.origin, "Writer stopped");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn commit_appends(&mut self, batch: Vec<(NewRecord, Reply<RecordId>)>) {
        let now = Utc::now();
        let mut prepared = Vec::with_capacity(batch.len());
        for (record, reply) in batch {
            match EncodedRecord::new(record, now) {
                Ok(encoded) => prepared.push((encoded, reply)),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }
        if prepared.is_empty() {
            return;
        }

        let _publication = self.hub.lock_publication();
        let encoded: Vec<&EncodedRecord> = prepared.iter().map(|(e, _)| e).collect();
        match insert_batch(&mut self.conn, &self.origin, &encoded, now) {
            Ok((ids, token)) => {
                debug!(count = ids.len(), %token, "Committed appends");
                let mut inserted = Vec::with_capacity(ids.len());
                let mut replies = Vec::with_capacity(ids.len());
                for ((encoded, reply), id) in prepared.into_iter().zip(ids) {
                    inserted.push(encoded.into_record(id));
                    replies.push((reply, id));
                }
                inserted.sort_by(scribe_core::LogRecord::read_order);
                self.hub.publish(Arc::new(ChangeSet {
                    token: Some(token),
                    inserted,
                    ..Default::default()
                }));
                for (reply, id) in replies {
                    let _ = reply.send(Ok(id));
                }
            }
            Err(e) => {
                error!(error = %e, count = prepared.len(), "Append transaction failed");
                for (_, reply) in prepared {
                    let _ = reply.send(Err(e.clone()));
                }
            }
        }
    }

    fn commit_delete(&mut self, before: DateTime<Utc>) -> Result<usize, StorageError> {
        let _publication = self.hub.lock_publication();
        let now = Utc::now();
        let tx = self.conn.transaction()?;
        let deleted = schema::delete_before(&tx, before)?;
        if deleted.is_empty() {
            tx.commit()?;
            return Ok(0);
        }
        let token = schema::insert_history(
            &tx,
            &self.origin,
            &HistoryChanges::deleted(deleted.clone()),
            now,
        )?;
        tx.commit()?;

        let count = deleted.len();
        info!(count, %before, %token, "Deleted records");
        self.hub.publish(Arc::new(ChangeSet {
            token: Some(token),
            deleted,
            ..Default::default()
        }));
        Ok(count)
    }

    /// Cursors last refreshed before this instant no longer hold back trimming
    fn stale_before(&self) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::from_std(self.cursor_ttl).unwrap_or(chrono::Duration::hours(1))
    }

    fn checkpoint(&mut self, token: HistoryToken) {
        let Some(cursor) = &self.cursor else {
            return;
        };
        let result = schema::upsert_cursor(&self.conn, cursor, token, Utc::now())
            .and_then(|()| schema::trim_history(&self.conn, self.stale_before()));
        match result {
            Ok(0) => {}
            Ok(trimmed) => debug!(trimmed, %token, "Trimmed history"),
            Err(e) => warn!(error = %e, %token, "History trim failed"),
        }
    }
}

fn insert_batch(
    conn: &mut Connection,
    origin: &OriginId,
    records: &[&EncodedRecord],
    now: DateTime<Utc>,
) -> Result<(Vec<RecordId>, HistoryToken), StorageError> {
    let tx = conn.transaction()?;
    let mut ids = Vec::with_capacity(records.len());
    for record in records {
        ids.push(schema::insert_record(&tx, record)?);
    }
    let token = schema::insert_history(&tx, origin, &HistoryChanges::inserted(ids.clone()), now)?;
    tx.commit()?;
    Ok((ids, token))
}
