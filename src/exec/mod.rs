// src/exec/mod.rs

//! Build execution layer.
//!
//! - [`backend`] defines the seams the derivation goal builds through:
//!   [`LocalExecutor`], the optional [`BuildHook`], and the [`LogSink`]
//!   builders report output to.
//! - [`process`] is a `LocalExecutor` running builders with
//!   `tokio::process::Command`.

pub mod backend;
pub mod process;

pub use backend::{
    BuildHook, BuildJob, BuildOutcome, BuildRequest, HookReply, LocalExecutor, LogSink,
};
pub use process::ProcessExecutor;
