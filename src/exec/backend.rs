// src/exec/backend.rs

//! Pluggable build backends.
//!
//! The worker never runs builders itself. A derivation goal hands a fully
//! resolved derivation and its realised input closure either to the optional
//! [`BuildHook`] (remote dispatch) or to the [`LocalExecutor`], and gets back
//! a [`BuildJob`] future which the worker drives as a child.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug};
use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::build_result::FailureStatus;
use crate::derivation::Derivation;
use crate::errors::Result;
use crate::goal::GoalId;
use crate::types::{BuildMode, OutputName, PathInfo, StorePath};
use crate::worker::ChildEvent;

/// A running build. Resolves once the builder has exited.
pub type BuildJob = Pin<Box<dyn Future<Output = Result<BuildOutcome>> + Send + 'static>>;

/// What a backend needs to build one derivation.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub drv_path: StorePath,
    pub drv: Derivation,
    /// Closure of all inputs, already valid in the store.
    pub input_paths: BTreeSet<StorePath>,
    pub mode: BuildMode,
    pub log: LogSink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Path info for every output the builder produced.
    Success {
        outputs: BTreeMap<OutputName, PathInfo>,
    },
    Failure {
        status: FailureStatus,
        message: String,
    },
}

/// Runs builders on this machine.
pub trait LocalExecutor: Send + Sync + Debug {
    /// Start building. An `Err` means the build could not even be started
    /// (the inputs were rejected).
    fn start_build(&self, request: BuildRequest) -> Result<BuildJob>;
}

pub enum HookReply {
    /// The hook took the build; the job finishes when the remote build does.
    Accept(BuildJob),
    Decline,
    /// Decline, and never offer this hook anything again during the run.
    DeclinePermanently,
    /// No machine is free right now; ask again later.
    Postpone,
}

impl Debug for HookReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookReply::Accept(_) => f.write_str("Accept(..)"),
            HookReply::Decline => f.write_str("Decline"),
            HookReply::DeclinePermanently => f.write_str("DeclinePermanently"),
            HookReply::Postpone => f.write_str("Postpone"),
        }
    }
}

/// Optional remote build dispatcher.
pub trait BuildHook: Send + Debug {
    fn offer(&mut self, request: &BuildRequest) -> HookReply;
}

/// Where a builder sends its log lines.
///
/// Every line counts as activity for the silence timeout of the build it
/// belongs to.
#[derive(Debug, Clone)]
pub struct LogSink {
    target: Option<(GoalId, mpsc::UnboundedSender<ChildEvent>)>,
}

impl LogSink {
    pub(crate) fn new(goal: GoalId, tx: mpsc::UnboundedSender<ChildEvent>) -> Self {
        LogSink {
            target: Some((goal, tx)),
        }
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        LogSink { target: None }
    }

    pub fn line(&self, line: impl Into<String>) {
        if let Some((goal, tx)) = &self.target {
            let _ = tx.send(ChildEvent::Output {
                goal: *goal,
                line: line.into(),
            });
        }
    }
}
