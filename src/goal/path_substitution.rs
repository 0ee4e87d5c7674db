// src/goal/path_substitution.rs

//! Fetch one store path from the configured substituters.
//!
//! Substituters are tried in order. For each, the path info is queried on a
//! helper thread; the path's references are then substituted first so the
//! path never becomes valid before its closure; finally the transfer runs
//! on a helper thread holding a substitution slot. A failed transfer moves
//! on to the next substituter.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{ExitCode, Step, WaitOn};
use crate::build_result::{BuildResult, FailureStatus, SuccessStatus};
use crate::errors::{RealiserError, Result};
use crate::substituter::{SubstituterError, SubstituterRef};
use crate::types::{PathInfo, StorePath};
use crate::worker::{GoalCx, Pending};

type QueryResult = std::result::Result<Option<PathInfo>, SubstituterError>;
type CopyResult = std::result::Result<(), SubstituterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    TryNext,
    InfoQueried,
    ReferencesValid,
    TryToRun,
    Finished,
}

#[derive(Debug)]
pub struct PathSubstitutionGoal {
    store_path: StorePath,
    repair: bool,
    /// Content address, if the caller knows the path is content-addressed.
    ca: Option<String>,
    state: State,
    subs: VecDeque<SubstituterRef>,
    sub: Option<SubstituterRef>,
    info: Option<PathInfo>,
    /// A substituter had the path but something went wrong.
    substituter_failed: bool,
    query: Option<Pending<QueryResult>>,
    transfer: Option<Pending<CopyResult>>,
}

impl PathSubstitutionGoal {
    pub(crate) fn new(store_path: StorePath, repair: bool, ca: Option<String>) -> Self {
        PathSubstitutionGoal {
            store_path,
            repair,
            ca,
            state: State::Init,
            subs: VecDeque::new(),
            sub: None,
            info: None,
            substituter_failed: false,
            query: None,
            transfer: None,
        }
    }

    pub fn store_path(&self) -> &StorePath {
        &self.store_path
    }

    pub(crate) fn key(&self) -> String {
        format!("a${}${}", self.store_path.name(), self.store_path)
    }

    pub(crate) fn name(&self) -> String {
        format!("substitution of '{}'", self.store_path)
    }

    pub(crate) fn work(&mut self, cx: &mut GoalCx<'_>) -> Result<Step> {
        loop {
            match self.state {
                State::Init => {
                    if !self.repair && cx.store().is_valid_path(&self.store_path) {
                        cx.set_build_result(BuildResult::success(SuccessStatus::AlreadyValid));
                        return Ok(Step::done(ExitCode::Success));
                    }
                    self.subs = cx.substituters().into();
                    cx.stats_mut().expected_substitutions += 1;
                    self.state = State::TryNext;
                }

                State::TryNext => {
                    let Some(sub) = self.subs.pop_front() else {
                        return Ok(self.exhausted(cx));
                    };
                    let path = self.store_path.clone();
                    let queried = Arc::clone(&sub);
                    self.query = Some(cx.spawn_helper(false, move || Ok(queried.query_path_info(&path))));
                    self.sub = Some(sub);
                    self.state = State::InfoQueried;
                    return Ok(Step::Suspend(WaitOn::Child));
                }

                State::InfoQueried => {
                    let Some(result) = self.query.as_mut().and_then(Pending::poll) else {
                        return Ok(Step::Suspend(WaitOn::Child));
                    };
                    cx.child_terminated();
                    self.query = None;
                    if let Some(step) = self.info_queried(cx, result?)? {
                        return Ok(step);
                    }
                }

                State::ReferencesValid => {
                    if cx.common().nr_failed > 0 {
                        let exit = cx.common().closure_failure();
                        let msg = format!(
                            "some references of path '{}' could not be realised",
                            self.store_path
                        );
                        debug!(path = %self.store_path, "{msg}");
                        cx.set_build_result(BuildResult::failure(
                            FailureStatus::DependencyFailed,
                            msg,
                        ));
                        return Ok(Step::done(exit));
                    }

                    let store = cx.store();
                    if let Some(missing) = self
                        .info
                        .iter()
                        .flat_map(|i| i.references_excluding_self())
                        .find(|r| !store.is_valid_path(r))
                    {
                        return Err(RealiserError::InvalidPath(missing.clone()));
                    }
                    self.state = State::TryToRun;
                }

                State::TryToRun => {
                    if !cx.substitution_slot_available() {
                        return Ok(Step::Suspend(WaitOn::BuildSlot));
                    }
                    let (Some(sub), Some(info)) = (self.sub.clone(), self.info.clone()) else {
                        self.state = State::TryNext;
                        continue;
                    };

                    cx.stats_mut().running_substitutions += 1;
                    info!(path = %self.store_path, substituter = %sub.uri(), "copying path");

                    let store = cx.store();
                    self.transfer = Some(cx.spawn_helper(true, move || Ok(sub.copy_path(&info, &*store))));
                    self.state = State::Finished;
                    return Ok(Step::Suspend(WaitOn::Child));
                }

                State::Finished => {
                    let Some(result) = self.transfer.as_mut().and_then(Pending::poll) else {
                        return Ok(Step::Suspend(WaitOn::Child));
                    };
                    cx.child_terminated();
                    self.transfer = None;
                    let stats = cx.stats_mut();
                    stats.running_substitutions = stats.running_substitutions.saturating_sub(1);

                    match result.and_then(|r| r.map_err(|e| self.substituter_error(e))) {
                        Ok(()) => return Ok(self.done_copying(cx)),
                        Err(err) => {
                            let uri = self.sub.as_ref().map(|s| s.uri().to_string()).unwrap_or_default();
                            error!(path = %self.store_path, substituter = %uri, "{err}");
                            let gone = matches!(
                                &err,
                                RealiserError::Substituter { source: SubstituterError::Gone(_), .. }
                            );
                            if !gone {
                                self.substituter_failed = true;
                            }
                            self.state = State::TryNext;
                        }
                    }
                }
            }
        }
    }

    /// Decide what to do with one substituter's answer. `Ok(None)` means
    /// keep stepping.
    fn info_queried(&mut self, cx: &mut GoalCx<'_>, result: QueryResult) -> Result<Option<Step>> {
        let Some(sub) = self.sub.clone() else {
            self.state = State::TryNext;
            return Ok(None);
        };

        let mut info = match result {
            Ok(Some(info)) => info,
            Ok(None) => {
                debug!(path = %self.store_path, substituter = %sub.uri(), "path not found");
                self.state = State::TryNext;
                return Ok(None);
            }
            Err(e) => {
                if !cx.settings().fallback {
                    return Err(RealiserError::Substituter {
                        uri: sub.uri().to_string(),
                        source: e,
                    });
                }
                error!(path = %self.store_path, substituter = %sub.uri(), "{e}");
                self.state = State::TryNext;
                return Ok(None);
            }
        };

        if info.path != self.store_path {
            if info.is_content_addressed() && info.references.is_empty() {
                info.path = self.store_path.clone();
            } else {
                error!(
                    substituter = %sub.uri(),
                    "asked for '{}' but got '{}'",
                    self.store_path,
                    info.path
                );
                self.state = State::TryNext;
                return Ok(None);
            }
        }
        if info.ca.is_none() {
            info.ca = self.ca.clone();
        }

        // Unsigned paths from untrusted substituters are only accepted if
        // they are content-addressed.
        let settings = cx.settings();
        if settings.require_sigs
            && !sub.is_trusted()
            && !info.is_content_addressed()
            && info.check_signatures(&settings.trusted_public_keys) == 0
        {
            warn!(
                path = %self.store_path,
                substituter = %sub.uri(),
                "ignoring substitute, since it is not signed by any of the keys in 'trusted_public_keys'"
            );
            self.state = State::TryNext;
            return Ok(None);
        }

        let stats = cx.stats_mut();
        stats.expected_download_size += info.download_size.unwrap_or(0);
        stats.expected_nar_size += info.nar_size;

        for reference in info.references_excluding_self() {
            let goal = cx
                .worker
                .make_path_substitution_goal(reference.clone(), false, None);
            cx.add_waitee(goal);
        }

        self.info = Some(info);
        self.state = State::ReferencesValid;
        Ok(Some(Step::Suspend(WaitOn::Waitees)))
    }

    fn substituter_error(&self, source: SubstituterError) -> RealiserError {
        RealiserError::Substituter {
            uri: self.sub.as_ref().map(|s| s.uri().to_string()).unwrap_or_default(),
            source,
        }
    }

    fn exhausted(&mut self, cx: &mut GoalCx<'_>) -> Step {
        if self.substituter_failed {
            cx.stats_mut().failed_substitutions += 1;
            let msg = format!("substitution of path '{}' failed", self.store_path);
            cx.set_build_result(BuildResult::failure(FailureStatus::TransientFailure, msg));
            Step::done(ExitCode::Failed)
        } else {
            let msg = format!(
                "path '{}' is required, but there is no substituter that can build it",
                self.store_path
            );
            debug!("{msg}");
            cx.set_build_result(BuildResult::failure(FailureStatus::NoSubstituters, msg));
            Step::done(ExitCode::NoSubstituters)
        }
    }

    fn done_copying(&mut self, cx: &mut GoalCx<'_>) -> Step {
        debug!(path = %self.store_path, "substitution finished");
        cx.mark_contents_good(&self.store_path);

        if let Some(info) = &self.info {
            let stats = cx.stats_mut();
            stats.done_substitutions += 1;
            stats.done_download_size += info.download_size.unwrap_or(0);
            stats.done_nar_size += info.nar_size;
        }
        cx.set_build_result(BuildResult::success(SuccessStatus::Substituted));
        Step::done(ExitCode::Success)
    }
}
