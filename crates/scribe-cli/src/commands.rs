//! Subcommand implementations
//!
//! Every command opens the store named by the global arguments, writes its
//! output to the supplied writer and closes the store before returning.

use std::collections::HashSet;
use std::io::Write;

use anyhow::Context;
use tracing::debug;

use scribe_core::{LogRecord, NewRecord, Query, RecordId};
use scribe_storage::MessageStore;

use crate::cli::{metadata_from, Cli, Command};

/// Run a parsed command line
pub async fn run<W: Write + Send>(cli: Cli, out: &mut W) -> anyhow::Result<()> {
    let config = cli
        .global
        .store_config()
        .context("Failed to load store configuration")?;
    let path = config.path.clone();
    let store = MessageStore::open(config)
        .await
        .with_context(|| format!("Failed to open store at {}", path.display()))?;

    let result = execute(&store, cli.command, out).await;
    let closed = store.close().await;
    result?;
    closed.context("Failed to close store")?;
    Ok(())
}

async fn execute<W: Write + Send>(
    store: &MessageStore,
    command: Command,
    out: &mut W,
) -> anyhow::Result<()> {
    match command {
        Command::Append {
            message,
            label,
            level,
            metadata,
            source,
        } => {
            let mut record = NewRecord::new(label, level, message).with_source(source);
            if let Some(metadata) = metadata_from(metadata) {
                record = record.with_metadata(metadata);
            }
            let id = store.append(record).await?;
            writeln!(out, "{id}")?;
        }

        Command::Search {
            filter,
            limit,
            json,
        } => {
            let records = store.fetch(&filter.to_query())?;
            let shown = limit.unwrap_or(records.len());
            for record in records.iter().take(shown) {
                print_record(out, record, json)?;
            }
        }

        Command::Watch {
            filter,
            count,
            json,
        } => watch(store, filter.to_query(), count, json, out).await?,

        Command::Purge { before } => {
            let removed = store.delete(before).await?;
            writeln!(out, "Removed {removed} records")?;
        }

        Command::Stats => print_stats(store, out)?,
    }
    Ok(())
}

async fn watch<W: Write + Send>(
    store: &MessageStore,
    query: Query,
    count: Option<usize>,
    json: bool,
    out: &mut W,
) -> anyhow::Result<()> {
    let (observation, mut rx) = store.observe_channel(query.clone())?;

    // Existing records first, oldest at the top
    let mut seen: HashSet<RecordId> = HashSet::new();
    for record in store.fetch(&query)?.iter().rev() {
        print_record(out, record, json)?;
        seen.insert(record.id);
    }
    out.flush()?;

    let mut printed = 0;
    while count.is_none_or(|count| printed < count) {
        tokio::select! {
            delivery = rx.recv() => {
                let Some(records) = delivery else { break };
                for record in records.iter().rev().filter(|r| !seen.contains(&r.id)) {
                    print_record(out, record, json)?;
                    printed += 1;
                }
                out.flush()?;
                seen = records.iter().map(|r| r.id).collect();
            }
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted");
                break;
            }
        }
    }

    observation.invalidate();
    Ok(())
}

fn print_record<W: Write>(out: &mut W, record: &LogRecord, json: bool) -> anyhow::Result<()> {
    if json {
        serde_json::to_writer(&mut *out, record)?;
        writeln!(out)?;
        return Ok(());
    }

    write!(
        out,
        "{} {:<7} {} [{}] {}",
        record.date.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level.as_str(),
        record.source,
        record.label,
        record.message
    )?;
    if let Some(text) = &record.metadata_search_text {
        write!(out, " {{{text}}}")?;
    }
    writeln!(out)?;
    Ok(())
}

fn print_stats<W: Write>(store: &MessageStore, out: &mut W) -> anyhow::Result<()> {
    writeln!(out, "Store:           {}", store.path().display())?;
    writeln!(out, "Origin:          {}", store.origin())?;
    writeln!(out, "Records:         {}", store.count()?)?;
    writeln!(out, "History entries: {}", store.history_len()?)?;
    match store.history_stats() {
        Some(stats) => {
            writeln!(out, "History token:   {}", stats.token)?;
            writeln!(out, "Merge cycles:    {}", stats.cycles)?;
            writeln!(out, "Entries merged:  {}", stats.entries_merged)?;
            writeln!(out, "Entries skipped: {}", stats.entries_skipped)?;
            writeln!(out, "Rows loaded:     {}", stats.rows_loaded)?;
            writeln!(out, "Merge failures:  {}", stats.failures)?;
            writeln!(out, "Resyncs:         {}", stats.resyncs)?;
        }
        None => writeln!(out, "History sync:    disabled")?,
    }
    Ok(())
}
