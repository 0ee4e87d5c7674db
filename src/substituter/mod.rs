// src/substituter/mod.rs

//! Binary caches the scheduler can fetch store objects from.
//!
//! Every call may block on network or disk IO; the worker only invokes
//! substituters from helper threads.

use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;

use crate::store::Store;
use crate::types::{DrvOutput, PathInfo, StorePath, UnkeyedRealisation};

pub mod memory;

pub use memory::MemorySubstituter;

#[derive(Error, Debug)]
pub enum SubstituterError {
    /// The substituter was turned off, e.g. after repeated failures.
    #[error("substituter is disabled")]
    Disabled,

    #[error("transport error: {0}")]
    Transport(String),

    /// The object was advertised but disappeared before it could be fetched.
    #[error("substitute for '{0}' is gone")]
    Gone(StorePath),

    #[error("cannot add '{path}' to the store: {reason}")]
    Rejected { path: StorePath, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SubstituterResult<T> = std::result::Result<T, SubstituterError>;

pub trait Substituter: Send + Sync + Debug {
    fn uri(&self) -> &str;

    /// Trusted substituters are exempt from signature checks.
    fn is_trusted(&self) -> bool {
        false
    }

    /// `Ok(None)` means the substituter does not have the path.
    fn query_path_info(&self, path: &StorePath) -> SubstituterResult<Option<PathInfo>>;

    fn query_realisation(&self, id: &DrvOutput) -> SubstituterResult<Option<UnkeyedRealisation>>;

    /// Transfer `info.path` into `dest` and register it valid there.
    fn copy_path(&self, info: &PathInfo, dest: &dyn Store) -> SubstituterResult<()>;
}

pub type SubstituterRef = Arc<dyn Substituter>;
