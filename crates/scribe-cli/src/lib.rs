//! `scribe` command line tool
//!
//! A diagnostics front-end over one store file: append records, search
//! them, follow new writes from any process sharing the file, purge old
//! records and inspect history replay statistics.

pub mod cli;
pub mod commands;

pub use cli::{Cli, Command, FilterArgs, GlobalArgs};
pub use commands::run;
