//! Stress tests for scribe-storage
//!
//! These tests verify store behavior under many concurrent emitters and
//! with several handles writing to one file at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use scribe_core::{Level, NewRecord, OriginId, Query};
use scribe_storage::{HistoryConfig, LogSink, MessageStore, StoreConfig};
use tempfile::TempDir;
use tokio::time::timeout;

// ============================================================================
// Throughput Tests
// ============================================================================

/// Many tasks appending through one handle
///
/// Every append must land exactly once and reads must stay in date order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appenders() {
    scribe_logging::init_testing();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        MessageStore::open(StoreConfig::new(dir.path().join("stress.sqlite")))
            .await
            .unwrap(),
    );
    let tasks = 8;
    let per_task = 250;

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..tasks {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let sink: &dyn LogSink = store.as_ref();
            for i in 0..per_task {
                let level = Level::ALL[i % Level::ALL.len()];
                sink.append(
                    NewRecord::new(format!("task{t}"), level, format!("message {i}"))
                        .with_source("stress"),
                )
                .await
                .expect("append failed");
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Appended {} records in {:?} ({:.2} records/sec)",
        tasks * per_task,
        duration,
        (tasks * per_task) as f64 / duration.as_secs_f64()
    );

    let records = store.fetch(&Query::all()).unwrap();
    assert_eq!(records.len(), tasks * per_task);
    assert!(
        records
            .windows(2)
            .all(|w| (w[0].date, w[0].id) >= (w[1].date, w[1].id))
    );
    store.close().await.unwrap();
}

/// Observation keeps up with a burst of appends
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_observation_converges_under_burst() {
    scribe_logging::init_testing();
    let dir = TempDir::new().unwrap();
    let store = MessageStore::open(StoreConfig::new(dir.path().join("burst.sqlite")))
        .await
        .unwrap();
    let query = Query::all().with_minimum_level(Level::Error);
    let (_observation, mut rx) = store.observe_channel(query.clone()).unwrap();

    let completions: Vec<_> = (0..1_000)
        .map(|i| {
            let level = if i % 2 == 0 { Level::Error } else { Level::Info };
            store.enqueue_append(NewRecord::new("burst", level, format!("{i}")))
        })
        .collect();
    for completion in completions {
        completion.await.unwrap();
    }

    let expected = store.fetch(&query).unwrap();
    assert_eq!(expected.len(), 500);
    let last = timeout(Duration::from_secs(10), async {
        loop {
            let records = rx.recv().await.expect("observation ended");
            if records.len() == expected.len() {
                return records;
            }
        }
    })
    .await
    .expect("observation did not converge");
    assert_eq!(last, expected);
    store.close().await.unwrap();
}

/// Two handles writing concurrently to one file converge
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_handles_converge() {
    scribe_logging::init_testing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.sqlite");
    let history = HistoryConfig::default().with_poll_interval(Duration::from_millis(10));
    let open = |origin: &str| {
        MessageStore::open(
            StoreConfig::new(&path)
                .with_origin(OriginId::new(origin).unwrap())
                .with_history(history.clone()),
        )
    };
    let a = Arc::new(open("a").await.unwrap());
    let b = Arc::new(open("b").await.unwrap());

    let (_observation, mut rx) = b.observe_channel(Query::all()).unwrap();

    let per_handle = 200;
    let writers: Vec<_> = [Arc::clone(&a), Arc::clone(&b)]
        .into_iter()
        .map(|store| {
            tokio::spawn(async move {
                for i in 0..per_handle {
                    store
                        .append(NewRecord::new(store.origin().to_string(), Level::Info, format!("{i}")))
                        .await
                        .expect("append failed");
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    assert_eq!(a.count().unwrap(), 2 * per_handle as u64);
    b.sync_history().await.unwrap();

    let converged = timeout(Duration::from_secs(10), async {
        loop {
            let records = rx.recv().await.expect("observation ended");
            if records.len() == 2 * per_handle {
                return records;
            }
        }
    })
    .await
    .expect("handles did not converge");
    assert_eq!(converged, b.fetch(&Query::all()).unwrap());

    let stats = b.history_stats().unwrap();
    assert_eq!(stats.rows_loaded, per_handle as u64);

    a.close().await.unwrap();
    b.close().await.unwrap();
}
