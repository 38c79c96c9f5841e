//! Log levels
//!
//! Levels are totally ordered from least to most severe:
//! `Debug < Info < Default < Error < Fault`.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Severity of a log record
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Verbose diagnostics (trace equivalent)
    Debug,
    /// Informational messages
    Info,
    /// Messages without a more specific severity
    #[default]
    Default,
    /// Recoverable errors
    Error,
    /// Unrecoverable faults
    Fault,
}

impl Level {
    /// Every level, in ascending severity
    pub const ALL: [Level; 5] = [
        Level::Debug,
        Level::Info,
        Level::Default,
        Level::Error,
        Level::Fault,
    ];

    /// Stable lower-case name, also used as the persisted representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Default => "default",
            Level::Error => "error",
            Level::Fault => "fault",
        }
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "default" | "notice" => Ok(Level::Default),
            "error" | "warning" | "warn" => Ok(Level::Error),
            "fault" | "critical" => Ok(Level::Fault),
            _ => Err(ParseError::UnknownLevel(s.to_string())),
        }
    }
}
