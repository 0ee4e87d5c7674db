// src/goal/mod.rs

//! Goals: resumable units of work driven by the [`Worker`](crate::worker::Worker).
//!
//! Each goal is an explicit state machine. The worker calls `work` whenever
//! the goal is awake; the goal advances through as many states as it can
//! and then either suspends, saying what it is waiting for, or finishes with
//! an exit code. A goal never runs again after finishing.
//!
//! Goals depend on each other through waitees. When a waitee finishes, the
//! worker bumps the waiter's failure counters and wakes the waiter once all
//! of its waitees are done. What a failed waitee means is decided by the
//! waiter, by inspecting those counters.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::build_result::BuildResult;
use crate::errors::{GoalError, RealiserError, Result};
use crate::types::OutputsSpec;
use crate::worker::GoalCx;

pub(crate) mod arena;
mod build_trace;
mod create_derivation;
mod derivation;
mod derivation_resolution;
mod drv_output_substitution;
mod path_substitution;

pub use arena::GoalId;
pub use build_trace::BuildTraceGoal;
pub use create_derivation::CreateDerivationAndRealiseGoal;
pub use derivation::DerivationGoal;
pub use derivation_resolution::DerivationResolutionGoal;
pub use drv_output_substitution::DrvOutputSubstitutionGoal;
pub use path_substitution::PathSubstitutionGoal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCode {
    Busy,
    Success,
    Failed,
    /// Nothing could even be attempted: no substituter had the path.
    NoSubstituters,
    /// A substitutable path had references that could not be substituted.
    IncompleteClosure,
}

impl ExitCode {
    pub fn is_terminal(self) -> bool {
        self != ExitCode::Busy
    }
}

/// Which admission counter a goal's children count against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobCategory {
    Build,
    Substitution,
    /// Bookkeeping goals, never limited.
    Administration,
}

/// Why a goal suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOn {
    /// All current waitees must finish.
    Waitees,
    /// The goal's child (build or helper) must produce output or finish.
    Child,
    /// A slot of the goal's job category must free up.
    BuildSlot,
    /// Any other goal must finish.
    AnyGoal,
    /// Nothing to wait on; poll again after the poll interval.
    AWhile,
}

#[derive(Debug)]
pub enum Step {
    Suspend(WaitOn),
    Done(ExitCode, Option<GoalError>),
}

impl Step {
    pub fn done(exit: ExitCode) -> Step {
        Step::Done(exit, None)
    }

    pub fn failed(exit: ExitCode, err: impl Into<RealiserError>) -> Step {
        Step::Done(exit, Some(Arc::new(err.into())))
    }

    /// Finish with a sub-goal's exit code and error.
    pub fn forward(exit: ExitCode, err: Option<GoalError>) -> Step {
        Step::Done(exit, err)
    }
}

/// State every goal has, owned by the worker.
#[derive(Debug)]
pub struct GoalCommon {
    pub(crate) key: String,
    pub(crate) name: String,
    pub(crate) category: JobCategory,
    /// Waitees that have not finished yet.
    pub(crate) waitees: BTreeSet<GoalId>,
    /// Every waitee ever added; released when this goal finishes.
    pub(crate) retained: Vec<GoalId>,
    pub(crate) waiters: BTreeSet<GoalId>,
    pub(crate) nr_failed: usize,
    pub(crate) nr_no_substituters: usize,
    pub(crate) nr_incomplete_closure: usize,
    pub(crate) exit_code: ExitCode,
    pub(crate) error: Option<GoalError>,
    pub(crate) build_result: BuildResult,
    /// Strong references: top-level membership plus waiters retaining us.
    pub(crate) refs: usize,
    /// The worker run this goal was created for.
    pub(crate) run: u64,
}

impl GoalCommon {
    pub(crate) fn new(key: String, name: String, category: JobCategory) -> Self {
        GoalCommon {
            key,
            name,
            category,
            waitees: BTreeSet::new(),
            retained: Vec::new(),
            waiters: BTreeSet::new(),
            nr_failed: 0,
            nr_no_substituters: 0,
            nr_incomplete_closure: 0,
            exit_code: ExitCode::Busy,
            error: None,
            build_result: BuildResult::default(),
            refs: 0,
            run: 0,
        }
    }

    /// Sort key; also the goal's identity for logging.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> JobCategory {
        self.category
    }

    pub fn exit_code(&self) -> ExitCode {
        self.exit_code
    }

    pub fn error(&self) -> Option<&GoalError> {
        self.error.as_ref()
    }

    pub fn build_result(&self) -> &BuildResult {
        &self.build_result
    }

    pub fn nr_failed(&self) -> usize {
        self.nr_failed
    }

    pub fn nr_no_substituters(&self) -> usize {
        self.nr_no_substituters
    }

    pub fn nr_incomplete_closure(&self) -> usize {
        self.nr_incomplete_closure
    }

    /// Record that a waitee finished with `exit`.
    pub(crate) fn count_waitee_exit(&mut self, exit: ExitCode) {
        match exit {
            ExitCode::Failed => self.nr_failed += 1,
            ExitCode::NoSubstituters => {
                self.nr_failed += 1;
                self.nr_no_substituters += 1;
            }
            ExitCode::IncompleteClosure => {
                self.nr_failed += 1;
                self.nr_incomplete_closure += 1;
            }
            ExitCode::Success | ExitCode::Busy => {}
        }
    }

    pub(crate) fn reset_failure_counters(&mut self) {
        self.nr_failed = 0;
        self.nr_no_substituters = 0;
        self.nr_incomplete_closure = 0;
    }

    /// Exit code of a goal giving up because part of a closure it needed
    /// failed: incomplete if any failure was substitution-only.
    pub(crate) fn closure_failure(&self) -> ExitCode {
        if self.nr_no_substituters > 0 || self.nr_incomplete_closure > 0 {
            ExitCode::IncompleteClosure
        } else {
            ExitCode::Failed
        }
    }
}

/// The concrete goal types.
#[derive(Debug)]
pub enum GoalKind {
    PathSubstitution(PathSubstitutionGoal),
    DrvOutputSubstitution(DrvOutputSubstitutionGoal),
    BuildTrace(BuildTraceGoal),
    DerivationResolution(DerivationResolutionGoal),
    Derivation(Box<DerivationGoal>),
    CreateDerivationAndRealise(CreateDerivationAndRealiseGoal),
}

impl GoalKind {
    pub(crate) fn key(&self) -> String {
        match self {
            GoalKind::PathSubstitution(g) => g.key(),
            GoalKind::DrvOutputSubstitution(g) => g.key(),
            GoalKind::BuildTrace(g) => g.key(),
            GoalKind::DerivationResolution(g) => g.key(),
            GoalKind::Derivation(g) => g.key(),
            GoalKind::CreateDerivationAndRealise(g) => g.key(),
        }
    }

    pub(crate) fn name(&self) -> String {
        match self {
            GoalKind::PathSubstitution(g) => g.name(),
            GoalKind::DrvOutputSubstitution(g) => g.name(),
            GoalKind::BuildTrace(g) => g.name(),
            GoalKind::DerivationResolution(g) => g.name(),
            GoalKind::Derivation(g) => g.name(),
            GoalKind::CreateDerivationAndRealise(g) => g.name(),
        }
    }

    pub(crate) fn category(&self) -> JobCategory {
        match self {
            GoalKind::PathSubstitution(_) | GoalKind::DrvOutputSubstitution(_) => {
                JobCategory::Substitution
            }
            GoalKind::Derivation(_) => JobCategory::Build,
            GoalKind::BuildTrace(_)
            | GoalKind::DerivationResolution(_)
            | GoalKind::CreateDerivationAndRealise(_) => JobCategory::Administration,
        }
    }

    pub(crate) fn work(&mut self, cx: &mut GoalCx<'_>) -> Result<Step> {
        match self {
            GoalKind::PathSubstitution(g) => g.work(cx),
            GoalKind::DrvOutputSubstitution(g) => g.work(cx),
            GoalKind::BuildTrace(g) => g.work(cx),
            GoalKind::DerivationResolution(g) => g.work(cx),
            GoalKind::Derivation(g) => g.work(cx),
            GoalKind::CreateDerivationAndRealise(g) => g.work(cx),
        }
    }

    /// Kill whatever the goal is running and fail it.
    pub(crate) fn timed_out(&mut self, cx: &mut GoalCx<'_>, err: RealiserError) -> Step {
        match self {
            GoalKind::Derivation(g) => g.timed_out(cx, err),
            _ => {
                cx.kill_child();
                Step::failed(ExitCode::Failed, err)
            }
        }
    }

    pub(crate) fn handle_child_output(&mut self, line: &str) {
        if let GoalKind::Derivation(g) = self {
            g.handle_child_output(line);
        }
    }

    /// Widen the outputs a busy goal produces. Returns a derivation goal
    /// the request must be forwarded to, if any.
    pub(crate) fn add_wanted_outputs(&mut self, outputs: &OutputsSpec) -> Option<GoalId> {
        match self {
            GoalKind::Derivation(g) => g.add_wanted_outputs(outputs),
            GoalKind::CreateDerivationAndRealise(g) => g.add_wanted_outputs(outputs),
            _ => None,
        }
    }

    /// Whether a finished goal's result already answers a request for
    /// `outputs`.
    pub(crate) fn satisfies(&self, outputs: &OutputsSpec, result: &BuildResult) -> bool {
        match self {
            GoalKind::Derivation(g) => g.satisfies(outputs, result),
            GoalKind::CreateDerivationAndRealise(g) => g.satisfies(outputs, result),
            _ => result.is_success(),
        }
    }
}
