// src/goal/drv_output_substitution.rs

//! Fetch the realisation of one derivation output from the substituters,
//! substitute the path it points at, then record it in the build trace.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error};

use super::{ExitCode, Step, WaitOn};
use crate::build_result::{BuildResult, FailureStatus, SuccessStatus};
use crate::errors::{RealiserError, Result};
use crate::substituter::{SubstituterError, SubstituterRef};
use crate::types::{DrvOutput, Realisation, UnkeyedRealisation};
use crate::worker::{GoalCx, Pending};

type QueryResult = std::result::Result<Option<UnkeyedRealisation>, SubstituterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    TryNext,
    RealisationFetched,
    OutputValid,
}

#[derive(Debug)]
pub struct DrvOutputSubstitutionGoal {
    id: DrvOutput,
    state: State,
    subs: VecDeque<SubstituterRef>,
    sub: Option<SubstituterRef>,
    query: Option<Pending<QueryResult>>,
    realisation: Option<UnkeyedRealisation>,
    substituter_failed: bool,
}

impl DrvOutputSubstitutionGoal {
    pub(crate) fn new(id: DrvOutput) -> Self {
        DrvOutputSubstitutionGoal {
            id,
            state: State::Init,
            subs: VecDeque::new(),
            sub: None,
            query: None,
            realisation: None,
            substituter_failed: false,
        }
    }

    pub fn id(&self) -> &DrvOutput {
        &self.id
    }

    /// The realisation, once fetched.
    pub fn realisation(&self) -> Option<&UnkeyedRealisation> {
        self.realisation.as_ref()
    }

    pub(crate) fn key(&self) -> String {
        format!("a${}${}", self.id.drv_path.name(), self.id)
    }

    pub(crate) fn name(&self) -> String {
        format!("substitution of '{}'", self.id)
    }

    pub(crate) fn work(&mut self, cx: &mut GoalCx<'_>) -> Result<Step> {
        loop {
            match self.state {
                State::Init => {
                    if let Some(known) = cx.store().query_realisation(&self.id) {
                        if cx.store().is_valid_path(&known.out_path) {
                            self.realisation = Some(known.unkeyed());
                            cx.set_build_result(BuildResult::success(SuccessStatus::AlreadyValid));
                            return Ok(Step::done(ExitCode::Success));
                        }
                    }
                    self.subs = cx.substituters().into();
                    self.state = State::TryNext;
                }

                State::TryNext => {
                    let Some(sub) = self.subs.pop_front() else {
                        return Ok(self.exhausted(cx));
                    };
                    let id = self.id.clone();
                    let queried = Arc::clone(&sub);
                    self.query = Some(cx.spawn_helper(false, move || Ok(queried.query_realisation(&id))));
                    self.sub = Some(sub);
                    self.state = State::RealisationFetched;
                    return Ok(Step::Suspend(WaitOn::Child));
                }

                State::RealisationFetched => {
                    let Some(result) = self.query.as_mut().and_then(Pending::poll) else {
                        return Ok(Step::Suspend(WaitOn::Child));
                    };
                    cx.child_terminated();
                    self.query = None;
                    let uri = self.sub.as_ref().map(|s| s.uri().to_string()).unwrap_or_default();

                    match result? {
                        Ok(Some(found)) => {
                            debug!(output = %self.id, path = %found.out_path, substituter = %uri, "found realisation");
                            let goal = cx
                                .worker
                                .make_path_substitution_goal(found.out_path.clone(), false, None);
                            cx.add_waitee(goal);
                            self.realisation = Some(found);
                            self.state = State::OutputValid;
                            return Ok(Step::Suspend(WaitOn::Waitees));
                        }
                        Ok(None) => {
                            debug!(output = %self.id, substituter = %uri, "realisation not found");
                            self.state = State::TryNext;
                        }
                        Err(e) => {
                            if !cx.settings().fallback {
                                return Err(RealiserError::Substituter { uri, source: e });
                            }
                            error!(output = %self.id, substituter = %uri, "{e}");
                            self.substituter_failed = true;
                            self.state = State::TryNext;
                        }
                    }
                }

                State::OutputValid => {
                    if cx.common().nr_failed > 0 {
                        let exit = cx.common().closure_failure();
                        let msg = format!("output of '{}' could not be substituted", self.id);
                        debug!("{msg}");
                        cx.set_build_result(BuildResult::failure(FailureStatus::DependencyFailed, msg));
                        return Ok(Step::done(exit));
                    }

                    let Some(value) = self.realisation.clone() else {
                        return Err(RealiserError::MissingRealisation(self.id.to_string()));
                    };
                    cx.store()
                        .register_realisation(Realisation::keyed(self.id.clone(), value))?;
                    cx.set_build_result(BuildResult::success(SuccessStatus::Substituted));
                    return Ok(Step::done(ExitCode::Success));
                }
            }
        }
    }

    fn exhausted(&mut self, cx: &mut GoalCx<'_>) -> Step {
        if self.substituter_failed {
            let msg = format!("substitution of '{}' failed", self.id);
            cx.set_build_result(BuildResult::failure(FailureStatus::TransientFailure, msg));
            Step::done(ExitCode::Failed)
        } else {
            let msg = format!("no substituter has a realisation for '{}'", self.id);
            debug!("{msg}");
            cx.set_build_result(BuildResult::failure(FailureStatus::NoSubstituters, msg));
            Step::done(ExitCode::NoSubstituters)
        }
    }
}
