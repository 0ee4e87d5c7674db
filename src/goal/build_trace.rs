// src/goal/build_trace.rs

//! Find out, and make valid, the path one derivation output refers to.
//!
//! The derivation may itself be the output of another derivation, in which
//! case that reference is traced first by a nested goal. Every nesting step
//! removes one `^output` from the reference, so the recursion ends.
//!
//! Sources, in order: the local build trace or a statically known output
//! path, the substituters, and finally building. A derivation that still
//! has input derivations is resolved first and the resolved one traced.

use std::sync::Arc;

use tracing::debug;

use super::{ExitCode, GoalId, GoalKind, Step, WaitOn};
use crate::build_result::{BuildResult, BuildStatus, FailureStatus, SuccessStatus};
use crate::derivation::Derivation;
use crate::errors::{RealiserError, Result};
use crate::types::{
    BuildMode, DrvOutput, OutputName, OutputsSpec, Realisation, SingleDerivedPath, StorePath,
    UnkeyedRealisation,
};
use crate::worker::GoalCx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    DrvPathKnown,
    CheckTrace,
    SubstitutionTried,
    Resolved,
    ResolvedTraced,
    Built,
}

#[derive(Debug)]
pub struct BuildTraceGoal {
    drv_req: SingleDerivedPath,
    output: OutputName,
    state: State,
    drv_path: Option<StorePath>,
    /// The goal currently waited on, whichever kind it is.
    sub_goal: Option<GoalId>,
    output_info: Option<UnkeyedRealisation>,
}

impl BuildTraceGoal {
    pub(crate) fn new(drv_req: SingleDerivedPath, output: OutputName) -> Self {
        BuildTraceGoal {
            drv_req,
            output,
            state: State::Init,
            drv_path: None,
            sub_goal: None,
            output_info: None,
        }
    }

    pub fn reference(&self) -> SingleDerivedPath {
        SingleDerivedPath::built(self.drv_req.clone(), self.output.clone())
    }

    /// The realisation found for the output.
    pub fn output_info(&self) -> Option<&UnkeyedRealisation> {
        self.output_info.as_ref()
    }

    pub(crate) fn key(&self) -> String {
        format!("a${}$trace${}", self.drv_req.base_path().name(), self.reference())
    }

    pub(crate) fn name(&self) -> String {
        format!("build trace of '{}'", self.reference())
    }

    pub(crate) fn work(&mut self, cx: &mut GoalCx<'_>) -> Result<Step> {
        loop {
            match self.state {
                State::Init => match &self.drv_req {
                    SingleDerivedPath::Opaque(path) => {
                        self.drv_path = Some(path.clone());
                        self.state = State::CheckTrace;
                    }
                    SingleDerivedPath::Built { drv_path, output } => {
                        let goal = cx
                            .worker
                            .make_build_trace_goal((**drv_path).clone(), output.clone());
                        return Ok(self.wait_on(cx, goal, State::DrvPathKnown));
                    }
                },

                State::DrvPathKnown => {
                    let Some(goal) = self.sub_goal.take() else {
                        return Err(RealiserError::build("derivation trace goal went missing"));
                    };
                    let found = match cx.kind_of(goal) {
                        Some(GoalKind::BuildTrace(g)) => g.output_info().cloned(),
                        _ => None,
                    };
                    let Some(found) = found.filter(|_| cx.exit_code_of(goal) == ExitCode::Success)
                    else {
                        return Ok(self.forward_failure(cx, goal));
                    };
                    self.drv_path = Some(found.out_path);
                    self.state = State::CheckTrace;
                }

                State::CheckTrace => {
                    let id = self.drv_output()?;
                    let store = cx.store();

                    if let Some(known) = store.query_realisation(&id) {
                        if store.is_valid_path(&known.out_path) {
                            return Ok(self.found(cx, known.unkeyed(), SuccessStatus::AlreadyValid));
                        }
                    }
                    let drv = self.read_drv(cx);
                    if let Some(path) = drv
                        .as_ref()
                        .and_then(|d| d.outputs.get(&self.output))
                        .and_then(|o| o.path())
                    {
                        if store.is_valid_path(path) {
                            let info = UnkeyedRealisation::new(path.clone());
                            return Ok(self.found(cx, info, SuccessStatus::AlreadyValid));
                        }
                    }

                    if cx.substituters().is_empty() {
                        self.state = State::SubstitutionTried;
                        continue;
                    }
                    let goal = cx.worker.make_drv_output_substitution_goal(id);
                    return Ok(self.wait_on(cx, goal, State::SubstitutionTried));
                }

                State::SubstitutionTried => {
                    if let Some(goal) = self.sub_goal.take() {
                        let found = match cx.kind_of(goal) {
                            Some(GoalKind::DrvOutputSubstitution(g)) => g.realisation().cloned(),
                            _ => None,
                        };
                        if let Some(found) = found.filter(|_| cx.exit_code_of(goal) == ExitCode::Success)
                        {
                            return Ok(self.found(cx, found, SuccessStatus::Substituted));
                        }
                    }
                    cx.reset_failure_counters();

                    let drv_path = self.drv_path()?;
                    let unresolved = self.read_drv(cx).is_some_and(|d| !d.is_resolved());
                    if unresolved {
                        let goal = cx.worker.make_derivation_resolution_goal(drv_path);
                        return Ok(self.wait_on(cx, goal, State::Resolved));
                    }
                    debug!(reference = %self.reference(), "building to learn output path");
                    let goal = cx.worker.make_derivation_goal(
                        drv_path,
                        OutputsSpec::names([self.output.clone()]),
                        BuildMode::Normal,
                    );
                    return Ok(self.wait_on(cx, goal, State::Built));
                }

                State::Resolved => {
                    let Some(goal) = self.sub_goal.take() else {
                        return Err(RealiserError::build("resolution goal went missing"));
                    };
                    let resolved = match cx.kind_of(goal) {
                        Some(GoalKind::DerivationResolution(g)) => g.resolved_drv_path().cloned(),
                        _ => None,
                    };
                    let Some(resolved) = resolved.filter(|_| cx.exit_code_of(goal) == ExitCode::Success)
                    else {
                        return Ok(self.forward_failure(cx, goal));
                    };
                    let nested = cx
                        .worker
                        .make_build_trace_goal(SingleDerivedPath::Opaque(resolved), self.output.clone());
                    return Ok(self.wait_on(cx, nested, State::ResolvedTraced));
                }

                State::ResolvedTraced => {
                    let Some(goal) = self.sub_goal.take() else {
                        return Err(RealiserError::build("resolved trace goal went missing"));
                    };
                    let found = match cx.kind_of(goal) {
                        Some(GoalKind::BuildTrace(g)) => g.output_info().cloned(),
                        _ => None,
                    };
                    let Some(found) = found.filter(|_| cx.exit_code_of(goal) == ExitCode::Success)
                    else {
                        return Ok(self.forward_failure(cx, goal));
                    };
                    // Record the trace for the unresolved derivation too.
                    let id = self.drv_output()?;
                    cx.store()
                        .register_realisation(Realisation::keyed(id, found.clone()))?;
                    let status = cx
                        .build_result_of(goal)
                        .map(|r| r.status)
                        .and_then(|s| match s {
                            BuildStatus::Success(s) => Some(s),
                            _ => None,
                        })
                        .unwrap_or(SuccessStatus::ResolvesToAlreadyValid);
                    return Ok(self.found(cx, found, status));
                }

                State::Built => {
                    let Some(goal) = self.sub_goal.take() else {
                        return Err(RealiserError::build("build goal went missing"));
                    };
                    let built = cx
                        .build_result_of(goal)
                        .filter(|r| r.is_success())
                        .and_then(|r| r.built_outputs.get(&self.output))
                        .map(Realisation::unkeyed);
                    let Some(found) = built else {
                        return Ok(self.forward_failure(cx, goal));
                    };
                    return Ok(self.found(cx, found, SuccessStatus::Built));
                }
            }
        }
    }

    fn wait_on(&mut self, cx: &mut GoalCx<'_>, goal: GoalId, next: State) -> Step {
        cx.add_waitee(goal);
        self.sub_goal = Some(goal);
        self.state = next;
        Step::Suspend(WaitOn::Waitees)
    }

    fn found(&mut self, cx: &mut GoalCx<'_>, info: UnkeyedRealisation, status: SuccessStatus) -> Step {
        debug!(reference = %self.reference(), path = %info.out_path, "traced output");
        let mut result = BuildResult::success(status);
        if let Ok(id) = self.drv_output() {
            result
                .built_outputs
                .insert(self.output.clone(), Realisation::keyed(id, info.clone()));
        }
        cx.set_build_result(result);
        self.output_info = Some(info);
        Step::done(ExitCode::Success)
    }

    /// Fail with the sub-goal's exit code and error.
    fn forward_failure(&mut self, cx: &mut GoalCx<'_>, goal: GoalId) -> Step {
        let exit = match cx.exit_code_of(goal) {
            ExitCode::Success | ExitCode::Busy => ExitCode::Failed,
            other => other,
        };
        let mut result = cx.build_result_of(goal).cloned().unwrap_or_default();
        if result.is_success() || result.error_msg.is_none() {
            result = BuildResult::failure(
                FailureStatus::MiscFailure,
                format!("no output path known for '{}'", self.reference()),
            );
        }
        let err = cx.error_of(goal).unwrap_or_else(|| {
            Arc::new(RealiserError::MissingRealisation(self.reference().to_string()))
        });
        cx.set_build_result(result);
        Step::forward(exit, Some(err))
    }

    fn drv_path(&self) -> Result<StorePath> {
        self.drv_path
            .clone()
            .ok_or_else(|| RealiserError::MissingRealisation(self.drv_req.to_string()))
    }

    fn drv_output(&self) -> Result<DrvOutput> {
        Ok(DrvOutput::new(self.drv_path()?, self.output.clone()))
    }

    fn read_drv(&self, cx: &GoalCx<'_>) -> Option<Derivation> {
        let path = self.drv_path.as_ref()?;
        let store = cx.store();
        if !store.is_valid_path(path) {
            return None;
        }
        store.read_derivation(path).ok()
    }
}
