// src/logging.rs

//! Logging setup for hosts embedding the scheduler, using `tracing` +
//! `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. the level passed by the host (e.g. from its settings file)
//! 2. `REALISER_LOG` environment variable (e.g. "info", "debug")
//! 3. default to `info`
//!
//! Logs go to STDERR. Builder output is logged at `trace` under the
//! `realiser::build_log` target.

use std::str::FromStr;

use serde::Deserialize;
use tracing_subscriber::fmt;

use crate::errors::{RealiserError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("invalid log level: {other}")),
        }
    }
}

/// Install the global logging subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_logging(level: Option<LogLevel>) -> Result<()> {
    let level = effective_level(level, std::env::var("REALISER_LOG").ok().as_deref());

    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| RealiserError::Other(anyhow::anyhow!("installing log subscriber: {e}")))
}

fn effective_level(explicit: Option<LogLevel>, env: Option<&str>) -> tracing::Level {
    explicit
        .or_else(|| env.and_then(|s| s.parse().ok()))
        .map(level_from_log_level)
        .unwrap_or(tracing::Level::INFO)
}

fn level_from_log_level(lvl: LogLevel) -> tracing::Level {
    match lvl {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Trace => tracing::Level::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_level_beats_environment() {
        assert_eq!(
            effective_level(Some(LogLevel::Warn), Some("trace")),
            tracing::Level::WARN
        );
        assert_eq!(effective_level(None, Some("Debug")), tracing::Level::DEBUG);
        assert_eq!(effective_level(None, Some("bogus")), tracing::Level::INFO);
        assert_eq!(effective_level(None, None), tracing::Level::INFO);
    }
}
