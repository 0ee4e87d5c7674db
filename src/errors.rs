// src/errors.rs

//! Crate-wide error aliases and helpers.

use std::sync::Arc;

use thiserror::Error;

use crate::substituter::SubstituterError;
use crate::types::StorePath;

#[derive(Error, Debug)]
pub enum RealiserError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("path '{0}' is not valid")]
    InvalidPath(StorePath),

    #[error("derivation '{0}' is not known to the store")]
    MissingDerivation(StorePath),

    #[error("cannot resolve '{0}': no realisation is known")]
    MissingRealisation(String),

    #[error("substituter '{uri}': {source}")]
    Substituter {
        uri: String,
        #[source]
        source: SubstituterError,
    },

    /// A build went wrong in a way attributable to the derivation itself.
    #[error("{0}")]
    Build(String),

    /// Representative error for a whole run, carrying the process exit status
    /// a host should use.
    #[error("{msg}")]
    BuildFailed { msg: String, exit_status: u32 },

    #[error("goal scheduler stalled: {0}")]
    Deadlock(String),

    #[error("helper task failed: {0}")]
    Helper(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RealiserError {
    pub fn build(msg: impl Into<String>) -> Self {
        RealiserError::Build(msg.into())
    }
}

/// Error captured on a goal. Shared so composite goals can forward a
/// sub-goal's error without copying it.
pub type GoalError = Arc<RealiserError>;

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, RealiserError>;
