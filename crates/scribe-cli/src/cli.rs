use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

use scribe_core::{Level, Metadata, MetadataValue, OriginId, Query};
use scribe_storage::{StorageError, StoreConfig};

#[derive(Parser, Debug)]
#[command(name = "scribe", about = "Inspect and write Scribe log stores")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Store file (overrides the path in --config)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// TOML store configuration
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Origin tag for entries written by this process
    #[arg(long, global = true)]
    pub origin: Option<OriginId>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,
}

impl GlobalArgs {
    /// Store configuration from --config, then --db and --origin on top
    pub fn store_config(&self) -> Result<StoreConfig, StorageError> {
        let mut config = match &self.config {
            Some(path) => StoreConfig::load(path)?,
            None => StoreConfig::default(),
        };
        if let Some(db) = &self.db {
            config = config.with_path(db.clone());
        }
        if let Some(origin) = &self.origin {
            config = config.with_origin(origin.clone());
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Append one record
    Append {
        /// Record message
        message: String,
        /// Record label
        #[arg(long, default_value = "scribe")]
        label: String,
        /// Record level
        #[arg(long, default_value = "default")]
        level: Level,
        /// Metadata entry as key=value; JSON lists and maps are kept structured
        #[arg(long = "meta", value_parser = parse_metadata_entry)]
        metadata: Vec<(String, MetadataValue)>,
        /// Emitting subsystem
        #[arg(long, default_value = "cli")]
        source: String,
    },
    /// Print records matching a filter, newest first
    Search {
        #[command(flatten)]
        filter: FilterArgs,
        /// Maximum number of records to print
        #[arg(long)]
        limit: Option<usize>,
        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Print matching records as they are written, by this or any other process
    Watch {
        #[command(flatten)]
        filter: FilterArgs,
        /// Exit after this many new records
        #[arg(long)]
        count: Option<usize>,
        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Delete records dated at or before a point in time
    Purge {
        /// RFC 3339 timestamp; defaults to now
        #[arg(long)]
        before: Option<DateTime<Utc>>,
    },
    /// Show store and history statistics
    Stats,
}

#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Case- and diacritic-insensitive search term
    pub term: Option<String>,
    /// Only these levels (repeatable)
    #[arg(long = "level", conflicts_with = "min_level")]
    pub levels: Vec<Level>,
    /// Only this level and more severe ones
    #[arg(long)]
    pub min_level: Option<Level>,
}

impl FilterArgs {
    pub fn to_query(&self) -> Query {
        let mut query = Query::all();
        if let Some(term) = &self.term {
            query = query.with_search_term(term);
        }
        if !self.levels.is_empty() {
            query = query.with_levels(self.levels.iter().copied());
        }
        if let Some(minimum) = self.min_level {
            query = query.with_minimum_level(minimum);
        }
        query
    }
}

/// Parse `key=value`; values that are JSON strings, lists or maps keep their shape
pub fn parse_metadata_entry(entry: &str) -> Result<(String, MetadataValue), String> {
    let (key, value) = entry
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{entry}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty metadata key in `{entry}`"));
    }
    let value = MetadataValue::decode(value.as_bytes()).unwrap_or_else(|_| value.into());
    Ok((key.to_string(), value))
}

/// Collect parsed entries; later keys win
pub fn metadata_from(entries: Vec<(String, MetadataValue)>) -> Option<Metadata> {
    if entries.is_empty() {
        return None;
    }
    Some(entries.into_iter().collect())
}
