// src/goal/derivation_resolution.rs

//! Turn a derivation with input derivations into one that only refers to
//! concrete store paths, realising those inputs first.

use std::collections::BTreeMap;

use tracing::debug;

use super::{ExitCode, GoalId, GoalKind, Step, WaitOn};
use crate::build_result::{BuildResult, FailureStatus, SuccessStatus};
use crate::derivation::Derivation;
use crate::errors::{RealiserError, Result};
use crate::types::{OutputName, SingleDerivedPath, StorePath};
use crate::worker::GoalCx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    DrvAvailable,
    InputsTraced,
}

#[derive(Debug)]
pub struct DerivationResolutionGoal {
    drv_path: StorePath,
    state: State,
    /// One build-trace goal per input derivation output.
    inputs: BTreeMap<(StorePath, OutputName), GoalId>,
    resolved: Option<(StorePath, Derivation)>,
}

impl DerivationResolutionGoal {
    pub(crate) fn new(drv_path: StorePath) -> Self {
        DerivationResolutionGoal {
            drv_path,
            state: State::Init,
            inputs: BTreeMap::new(),
            resolved: None,
        }
    }

    pub fn drv_path(&self) -> &StorePath {
        &self.drv_path
    }

    /// Path of the resolved derivation. Equal to the input path when there
    /// was nothing to resolve.
    pub fn resolved_drv_path(&self) -> Option<&StorePath> {
        self.resolved.as_ref().map(|(path, _)| path)
    }

    pub fn resolved_drv(&self) -> Option<&Derivation> {
        self.resolved.as_ref().map(|(_, drv)| drv)
    }

    pub(crate) fn key(&self) -> String {
        format!("a${}$resolve${}", self.drv_path.name(), self.drv_path)
    }

    pub(crate) fn name(&self) -> String {
        format!("resolution of '{}'", self.drv_path)
    }

    pub(crate) fn work(&mut self, cx: &mut GoalCx<'_>) -> Result<Step> {
        loop {
            match self.state {
                State::Init => {
                    self.state = State::DrvAvailable;
                    if !cx.store().is_valid_path(&self.drv_path) {
                        let goal = cx
                            .worker
                            .make_path_substitution_goal(self.drv_path.clone(), false, None);
                        cx.add_waitee(goal);
                        return Ok(Step::Suspend(WaitOn::Waitees));
                    }
                }

                State::DrvAvailable => {
                    if cx.common().nr_failed > 0 {
                        let msg = format!("cannot resolve missing derivation '{}'", self.drv_path);
                        cx.set_build_result(BuildResult::failure(FailureStatus::DependencyFailed, msg.clone()));
                        return Ok(Step::failed(cx.common().closure_failure(), RealiserError::build(msg)));
                    }

                    let drv = cx.store().read_derivation(&self.drv_path)?;
                    if drv.is_resolved() {
                        debug!(drv = %self.drv_path, "derivation is already resolved");
                        self.resolved = Some((self.drv_path.clone(), drv));
                        cx.set_build_result(BuildResult::success(SuccessStatus::AlreadyValid));
                        return Ok(Step::done(ExitCode::Success));
                    }

                    for (input, outputs) in &drv.input_drvs {
                        for output in outputs {
                            let goal = cx.worker.make_build_trace_goal(
                                SingleDerivedPath::Opaque(input.clone()),
                                output.clone(),
                            );
                            cx.add_waitee(goal);
                            self.inputs.insert((input.clone(), output.clone()), goal);
                        }
                    }
                    self.state = State::InputsTraced;
                    return Ok(Step::Suspend(WaitOn::Waitees));
                }

                State::InputsTraced => {
                    let nr_failed = cx.common().nr_failed;
                    if nr_failed > 0 {
                        let msg = format!(
                            "{nr_failed} dependencies of derivation '{}' could not be resolved",
                            self.drv_path
                        );
                        cx.set_build_result(BuildResult::failure(FailureStatus::DependencyFailed, msg.clone()));
                        return Ok(Step::failed(cx.common().closure_failure(), RealiserError::build(msg)));
                    }

                    let drv = cx.store().read_derivation(&self.drv_path)?;
                    let inputs = &self.inputs;
                    let resolved = drv
                        .try_resolve(|input, output| {
                            let goal = inputs.get(&(input.clone(), output.to_string()))?;
                            match cx.kind_of(*goal)? {
                                GoalKind::BuildTrace(trace) => {
                                    trace.output_info().map(|r| r.out_path.clone())
                                }
                                _ => None,
                            }
                        })
                        .ok_or_else(|| {
                            RealiserError::build(format!(
                                "some inputs of derivation '{}' have no known output paths",
                                self.drv_path
                            ))
                        })?;

                    let resolved_path = cx.store().write_derivation(&resolved)?;
                    debug!(drv = %self.drv_path, resolved = %resolved_path, "resolved derivation");
                    self.resolved = Some((resolved_path, resolved));
                    cx.set_build_result(BuildResult::success(SuccessStatus::AlreadyValid));
                    return Ok(Step::done(ExitCode::Success));
                }
            }
        }
    }
}
