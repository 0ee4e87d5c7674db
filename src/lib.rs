// src/lib.rs

//! Goal-based realisation of store paths.
//!
//! A host builds a [`Worker`] over a [`Store`], a [`LocalExecutor`] and a
//! list of substituters, then asks it to realise paths through the
//! functions in [`build`]. The worker decomposes each request into goals
//! (substitutions, build-trace lookups, derivation resolutions and builds),
//! deduplicates them, and drives them on one task until every requested
//! goal has finished.

pub mod build;
pub mod build_result;
pub mod config;
pub mod derivation;
pub mod errors;
pub mod exec;
pub mod goal;
pub mod logging;
pub mod store;
pub mod substituter;
pub mod types;
pub mod worker;

pub use build::{
    build_derivation, build_paths, build_paths_with_results, ensure_path, repair_path,
    worker_from_config,
};
pub use build_result::{BuildResult, BuildStatus, FailureStatus, KeyedBuildResult, SuccessStatus};
pub use derivation::{Derivation, DerivationOutput};
pub use errors::{RealiserError, Result};
pub use exec::{BuildHook, BuildOutcome, BuildRequest, HookReply, LocalExecutor, ProcessExecutor};
pub use goal::{ExitCode, GoalId};
pub use store::{MemoryStore, Store};
pub use substituter::{MemorySubstituter, Substituter, SubstituterError, SubstituterRef};
pub use types::{
    BuildMode, DerivedPath, DrvOutput, OutputsSpec, PathInfo, Realisation, SingleDerivedPath,
    StorePath, UnkeyedRealisation,
};
pub use worker::{Worker, WorkerStats};
