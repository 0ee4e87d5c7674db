// src/goal/create_derivation.rs

//! Realise outputs of a derivation that may itself still have to be built.

use tracing::debug;

use super::{ExitCode, GoalId, Step, WaitOn};
use crate::build_result::{BuildResult, FailureStatus};
use crate::errors::{RealiserError, Result};
use crate::store::resolve_derived_path;
use crate::types::{BuildMode, DerivedPath, OutputsSpec, SingleDerivedPath};
use crate::worker::GoalCx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    DrvObtained,
    Realise,
    Finished,
}

#[derive(Debug)]
pub struct CreateDerivationAndRealiseGoal {
    drv_req: SingleDerivedPath,
    wanted_outputs: OutputsSpec,
    mode: BuildMode,
    state: State,
    /// The derivation goal doing the actual work, once the derivation is known.
    concrete: Option<GoalId>,
}

impl CreateDerivationAndRealiseGoal {
    pub(crate) fn new(drv_req: SingleDerivedPath, wanted_outputs: OutputsSpec, mode: BuildMode) -> Self {
        CreateDerivationAndRealiseGoal {
            drv_req,
            wanted_outputs,
            mode,
            state: State::Init,
            concrete: None,
        }
    }

    pub fn drv_req(&self) -> &SingleDerivedPath {
        &self.drv_req
    }

    pub fn wanted_outputs(&self) -> &OutputsSpec {
        &self.wanted_outputs
    }

    /// The derivation goal, once the derivation path is known.
    pub fn concrete_goal(&self) -> Option<GoalId> {
        self.concrete
    }

    pub(crate) fn key(&self) -> String {
        format!("c${}${}", self.drv_req.base_path().name(), self.drv_req)
    }

    pub(crate) fn name(&self) -> String {
        format!("realisation of '{}^{}'", self.drv_req, self.wanted_outputs)
    }

    /// Returns the derivation goal the widened request must reach too.
    pub(crate) fn add_wanted_outputs(&mut self, outputs: &OutputsSpec) -> Option<GoalId> {
        self.wanted_outputs = self.wanted_outputs.union(outputs);
        self.concrete
    }

    pub(crate) fn satisfies(&self, outputs: &OutputsSpec, result: &BuildResult) -> bool {
        result.is_success() && outputs.is_subset_of(&self.wanted_outputs)
    }

    pub(crate) fn work(&mut self, cx: &mut GoalCx<'_>) -> Result<Step> {
        loop {
            match self.state {
                State::Init => {
                    let store = cx.store();
                    let known = match &self.drv_req {
                        SingleDerivedPath::Opaque(_) => true,
                        // A derivation built earlier can be used directly,
                        // unless it has to be repaired or checked as well.
                        SingleDerivedPath::Built { .. } => {
                            self.mode == BuildMode::Normal
                                && resolve_derived_path(&*store, &self.drv_req)
                                    .is_ok_and(|p| store.is_valid_path(&p))
                        }
                    };
                    if known {
                        self.state = State::Realise;
                        continue;
                    }

                    let goal = cx
                        .worker
                        .make_goal(&DerivedPath::from_single(self.drv_req.clone()), BuildMode::Normal);
                    cx.add_waitee(goal);
                    self.state = State::DrvObtained;
                    return Ok(Step::Suspend(WaitOn::Waitees));
                }

                State::DrvObtained => {
                    if cx.common().nr_failed > 0 {
                        let msg = format!("cannot build missing derivation '{}'", self.drv_req);
                        debug!("{msg}");
                        cx.set_build_result(BuildResult::failure(FailureStatus::DependencyFailed, msg.clone()));
                        return Ok(Step::failed(ExitCode::Failed, RealiserError::build(msg)));
                    }
                    self.state = State::Realise;
                }

                State::Realise => {
                    let drv_path = resolve_derived_path(&*cx.store(), &self.drv_req)?;
                    let goal = cx.worker.make_derivation_goal(
                        drv_path,
                        self.wanted_outputs.clone(),
                        self.mode,
                    );
                    cx.add_waitee(goal);
                    self.concrete = Some(goal);
                    self.state = State::Finished;
                    return Ok(Step::Suspend(WaitOn::Waitees));
                }

                State::Finished => {
                    let Some(goal) = self.concrete else {
                        return Err(RealiserError::build("derivation goal went missing"));
                    };
                    let result = cx.build_result_of(goal).cloned().unwrap_or_default();
                    let exit = match cx.exit_code_of(goal) {
                        ExitCode::Busy => ExitCode::Failed,
                        exit => exit,
                    };
                    let err = cx.error_of(goal);
                    cx.set_build_result(result);
                    return Ok(Step::forward(exit, err));
                }
            }
        }
    }
}
