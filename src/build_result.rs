// src/build_result.rs

//! Outcome of realising one goal, as reported back to hosts.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use crate::types::{DerivedPath, OutputName, Realisation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessStatus {
    Built,
    Substituted,
    AlreadyValid,
    /// The derivation resolved to one whose outputs were already valid.
    ResolvesToAlreadyValid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStatus {
    PermanentFailure,
    InputRejected,
    OutputRejected,
    /// Possibly fixed by retrying, e.g. a substituter had a network problem.
    TransientFailure,
    TimedOut,
    MiscFailure,
    DependencyFailed,
    LogLimitExceeded,
    NotDeterministic,
    NoSubstituters,
    HashMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success(SuccessStatus),
    Failure(FailureStatus),
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Success(SuccessStatus::Built) => "Built",
            BuildStatus::Success(SuccessStatus::Substituted) => "Substituted",
            BuildStatus::Success(SuccessStatus::AlreadyValid) => "AlreadyValid",
            BuildStatus::Success(SuccessStatus::ResolvesToAlreadyValid) => {
                "ResolvesToAlreadyValid"
            }
            BuildStatus::Failure(FailureStatus::PermanentFailure) => "PermanentFailure",
            BuildStatus::Failure(FailureStatus::InputRejected) => "InputRejected",
            BuildStatus::Failure(FailureStatus::OutputRejected) => "OutputRejected",
            BuildStatus::Failure(FailureStatus::TransientFailure) => "TransientFailure",
            BuildStatus::Failure(FailureStatus::TimedOut) => "TimedOut",
            BuildStatus::Failure(FailureStatus::MiscFailure) => "MiscFailure",
            BuildStatus::Failure(FailureStatus::DependencyFailed) => "DependencyFailed",
            BuildStatus::Failure(FailureStatus::LogLimitExceeded) => "LogLimitExceeded",
            BuildStatus::Failure(FailureStatus::NotDeterministic) => "NotDeterministic",
            BuildStatus::Failure(FailureStatus::NoSubstituters) => "NoSubstituters",
            BuildStatus::Failure(FailureStatus::HashMismatch) => "HashMismatch",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub error_msg: Option<String>,
    /// Realisations of the outputs this goal was asked for.
    pub built_outputs: BTreeMap<OutputName, Realisation>,
    /// How many times the derivation was built in this run.
    pub times_built: u32,
    pub start_time: Option<SystemTime>,
    pub stop_time: Option<SystemTime>,
}

impl Default for BuildResult {
    fn default() -> Self {
        BuildResult {
            status: BuildStatus::Failure(FailureStatus::MiscFailure),
            error_msg: None,
            built_outputs: BTreeMap::new(),
            times_built: 0,
            start_time: None,
            stop_time: None,
        }
    }
}

impl BuildResult {
    pub fn success(status: SuccessStatus) -> Self {
        BuildResult {
            status: BuildStatus::Success(status),
            ..Default::default()
        }
    }

    pub fn failure(status: FailureStatus, msg: impl Into<String>) -> Self {
        BuildResult {
            status: BuildStatus::Failure(status),
            error_msg: Some(msg.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, BuildStatus::Success(_))
    }

    pub fn failure_status(&self) -> Option<FailureStatus> {
        match self.status {
            BuildStatus::Failure(s) => Some(s),
            BuildStatus::Success(_) => None,
        }
    }
}

/// A result tagged with the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedBuildResult {
    pub path: DerivedPath,
    pub result: BuildResult,
}
