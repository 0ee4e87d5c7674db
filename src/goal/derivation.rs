// src/goal/derivation.rs

//! Realise the wanted outputs of one derivation.
//!
//! The goal first makes sure the derivation itself is available, then tries
//! to substitute the outputs. Failing that it realises every input, takes
//! the output locks and a build slot, and hands the build to the hook or
//! the local executor. Floating content-addressed derivations are resolved
//! against their realised inputs and the resolved derivation is built by a
//! nested goal instead.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::SystemTime;

use tracing::{debug, info, trace, warn};

use super::{ExitCode, GoalId, Step, WaitOn};
use crate::build_result::{BuildResult, BuildStatus, FailureStatus, SuccessStatus};
use crate::derivation::{Derivation, DerivationOutput};
use crate::errors::{RealiserError, Result};
use crate::exec::{BuildJob, BuildOutcome, BuildRequest, HookReply};
use crate::store::PathLock;
use crate::types::{
    BuildMode, DerivedPath, DrvOutput, OutputName, OutputsSpec, PathInfo, Realisation, StorePath,
};
use crate::worker::{GoalCx, Pending};

/// Realised outputs, or why the build's results were rejected.
type Registered = std::result::Result<BTreeMap<OutputName, Realisation>, (FailureStatus, String)>;

/// Target of builder log lines.
const BUILD_LOG_TARGET: &str = "realiser::build_log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    GetDerivation,
    LoadDerivation,
    HaveDerivation,
    OutputsSubstitutionTried,
    ClosureRepaired,
    InputsRealised,
    ResolvedFinished,
    TryToBuild,
    BuildDone,
}

/// Whether widening the wanted outputs sends the goal back to substitution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NeedRestart {
    OutputsUnmodified,
    OutputsAdded,
    /// Inputs are realised; the builder produces every output anyway.
    BuildInProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetrySubstitution {
    No,
    /// An output's closure was incomplete; try again once inputs are built.
    Needed,
    AlreadyRetried,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStatus {
    Absent,
    /// Valid, but its contents failed verification in repair mode.
    Corrupt,
    Valid,
}

#[derive(Debug)]
pub struct DerivationGoal {
    drv_path: StorePath,
    drv: Option<Derivation>,
    wanted_outputs: OutputsSpec,
    mode: BuildMode,
    state: State,
    need_restart: NeedRestart,
    retry_substitution: RetrySubstitution,
    counted: bool,

    /// Input derivation goals and the outputs taken from each.
    input_goals: BTreeMap<StorePath, (GoalId, BTreeSet<OutputName>)>,
    /// Concrete input paths of each input derivation output.
    input_outputs: BTreeMap<(StorePath, OutputName), StorePath>,
    input_paths: BTreeSet<StorePath>,
    resolved_goal: Option<GoalId>,

    lock: Option<PathLock>,
    build: Option<Pending<BuildOutcome>>,
    remote: bool,
    log_tail: VecDeque<String>,
    log_limit: usize,
}

impl DerivationGoal {
    pub(crate) fn new(
        drv_path: StorePath,
        drv: Option<Derivation>,
        wanted_outputs: OutputsSpec,
        mode: BuildMode,
    ) -> Self {
        DerivationGoal {
            drv_path,
            drv,
            wanted_outputs,
            mode,
            state: State::GetDerivation,
            need_restart: NeedRestart::OutputsUnmodified,
            retry_substitution: RetrySubstitution::No,
            counted: false,
            input_goals: BTreeMap::new(),
            input_outputs: BTreeMap::new(),
            input_paths: BTreeSet::new(),
            resolved_goal: None,
            lock: None,
            build: None,
            remote: false,
            log_tail: VecDeque::new(),
            log_limit: 0,
        }
    }

    pub fn drv_path(&self) -> &StorePath {
        &self.drv_path
    }

    pub fn wanted_outputs(&self) -> &OutputsSpec {
        &self.wanted_outputs
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    pub(crate) fn key(&self) -> String {
        format!("b${}${}", self.drv_path.name(), self.drv_path)
    }

    pub(crate) fn name(&self) -> String {
        format!(
            "building of '{}'",
            DerivedPath::built(self.drv_path.clone(), self.wanted_outputs.clone())
        )
    }

    /// Widen the wanted outputs. Returns the goal building the resolved
    /// derivation, which must be widened as well.
    pub(crate) fn add_wanted_outputs(&mut self, outputs: &OutputsSpec) -> Option<GoalId> {
        if outputs.is_subset_of(&self.wanted_outputs) {
            return None;
        }
        self.wanted_outputs = self.wanted_outputs.union(outputs);
        if self.need_restart == NeedRestart::OutputsUnmodified {
            self.need_restart = NeedRestart::OutputsAdded;
        }
        debug!(drv = %self.drv_path, wanted = %self.wanted_outputs, "widened wanted outputs");
        self.resolved_goal
    }

    pub(crate) fn satisfies(&self, outputs: &OutputsSpec, result: &BuildResult) -> bool {
        let Some(drv) = &self.drv else {
            return false;
        };
        result.is_success()
            && outputs
                .resolve(drv.output_names())
                .iter()
                .all(|name| result.built_outputs.contains_key(name))
    }

    pub(crate) fn handle_child_output(&mut self, line: &str) {
        trace!(target: BUILD_LOG_TARGET, drv = %self.drv_path, "{line}");
        if self.log_limit == 0 {
            return;
        }
        if self.log_tail.len() == self.log_limit {
            self.log_tail.pop_front();
        }
        self.log_tail.push_back(line.to_string());
    }

    pub(crate) fn timed_out(&mut self, cx: &mut GoalCx<'_>, err: RealiserError) -> Step {
        cx.kill_child();
        self.end_build(cx);
        let msg = err.to_string();
        self.finish_failure(cx, FailureStatus::TimedOut, msg, ExitCode::Failed)
    }

    pub(crate) fn work(&mut self, cx: &mut GoalCx<'_>) -> Result<Step> {
        loop {
            let step = match self.state {
                State::GetDerivation => self.get_derivation(cx)?,
                State::LoadDerivation => self.load_derivation(cx)?,
                State::HaveDerivation => self.have_derivation(cx)?,
                State::OutputsSubstitutionTried => self.outputs_substitution_tried(cx)?,
                State::ClosureRepaired => Some(self.closure_repaired(cx)),
                State::InputsRealised => self.inputs_realised(cx)?,
                State::ResolvedFinished => Some(self.resolved_finished(cx)?),
                State::TryToBuild => self.try_to_build(cx)?,
                State::BuildDone => self.build_done(cx)?,
            };
            if let Some(step) = step {
                return Ok(step);
            }
        }
    }

    // States return `None` to continue with the next state immediately.

    fn get_derivation(&mut self, cx: &mut GoalCx<'_>) -> Result<Option<Step>> {
        if self.drv.is_some() {
            self.state = State::HaveDerivation;
            return Ok(None);
        }
        self.state = State::LoadDerivation;
        if cx.store().is_valid_path(&self.drv_path) {
            return Ok(None);
        }
        // The derivation itself may be fetched from a substituter.
        let goal = cx
            .worker
            .make_path_substitution_goal(self.drv_path.clone(), false, None);
        cx.add_waitee(goal);
        Ok(Some(Step::Suspend(WaitOn::Waitees)))
    }

    fn load_derivation(&mut self, cx: &mut GoalCx<'_>) -> Result<Option<Step>> {
        if cx.common().nr_failed > 0 {
            let msg = format!("cannot build missing derivation '{}'", self.drv_path);
            return Ok(Some(self.finish_failure(cx, FailureStatus::MiscFailure, msg, ExitCode::Failed)));
        }
        self.drv = Some(cx.store().read_derivation(&self.drv_path)?);
        self.state = State::HaveDerivation;
        Ok(None)
    }

    fn have_derivation(&mut self, cx: &mut GoalCx<'_>) -> Result<Option<Step>> {
        if !self.counted {
            self.counted = true;
            cx.stats_mut().expected_builds += 1;
        }
        let drv = self.drv()?.clone();
        let statuses = self.output_statuses(cx, &drv);
        let wanted = self.wanted_outputs.resolve(drv.output_names());

        if self.mode == BuildMode::Normal && self.all_valid(&statuses, &wanted) {
            let outputs = self.valid_realisations(cx, &drv);
            return Ok(Some(self.finish_success(cx, SuccessStatus::AlreadyValid, outputs)));
        }

        if self.mode != BuildMode::Check
            && drv.allow_substitutes
            && !cx.substituters().is_empty()
        {
            for name in &wanted {
                let status = statuses.get(name).copied().unwrap_or(OutputStatus::Absent);
                if status == OutputStatus::Valid {
                    continue;
                }
                let known = self.known_output_path(cx, &drv, name);
                let goal = match known {
                    Some(path) => {
                        let ca = drv.outputs.get(name).and_then(DerivationOutput::ca);
                        cx.worker
                            .make_path_substitution_goal(path, self.mode == BuildMode::Repair, ca)
                    }
                    None => cx
                        .worker
                        .make_drv_output_substitution_goal(DrvOutput::new(self.drv_path.clone(), name.clone())),
                };
                cx.add_waitee(goal);
            }
        }

        self.state = State::OutputsSubstitutionTried;
        Ok(Some(Step::Suspend(WaitOn::Waitees)))
    }

    fn outputs_substitution_tried(&mut self, cx: &mut GoalCx<'_>) -> Result<Option<Step>> {
        let common = cx.common();
        let (nr_failed, nr_no_subs, nr_incomplete) = (
            common.nr_failed,
            common.nr_no_substituters,
            common.nr_incomplete_closure,
        );

        if nr_failed > 0 && nr_failed > nr_no_subs + nr_incomplete && !cx.settings().fallback {
            let msg = format!(
                "some substitutes for the outputs of derivation '{}' failed (usually happens due to networking issues); try 'fallback' to build derivation from source",
                self.drv_path
            );
            return Ok(Some(self.finish_failure(
                cx,
                FailureStatus::TransientFailure,
                msg,
                ExitCode::Failed,
            )));
        }

        // Substitution failed only because the closure could not be
        // completed; the missing inputs may be buildable.
        if nr_incomplete > 0
            && nr_incomplete == nr_failed
            && self.retry_substitution == RetrySubstitution::No
        {
            self.retry_substitution = RetrySubstitution::Needed;
        }
        cx.reset_failure_counters();

        if self.need_restart == NeedRestart::OutputsAdded {
            self.need_restart = NeedRestart::OutputsUnmodified;
            self.state = State::HaveDerivation;
            return Ok(None);
        }

        let drv = self.drv()?.clone();
        let statuses = self.output_statuses(cx, &drv);
        let wanted = self.wanted_outputs.resolve(drv.output_names());
        let all_valid = self.all_valid(&statuses, &wanted);

        match self.mode {
            BuildMode::Normal if all_valid => {
                let outputs = self.valid_realisations(cx, &drv);
                return Ok(Some(self.finish_success(cx, SuccessStatus::Substituted, outputs)));
            }
            BuildMode::Repair if all_valid => return Ok(Some(self.repair_closure(cx, &drv))),
            BuildMode::Check if !all_valid => {
                let msg = format!(
                    "some outputs of '{}' are not valid, so checking is not possible",
                    self.drv_path
                );
                return Ok(Some(self.finish_failure(cx, FailureStatus::MiscFailure, msg, ExitCode::Failed)));
            }
            _ => {}
        }

        Ok(Some(self.gave_up_on_substitution(cx, &drv)))
    }

    /// Realise every input instead.
    fn gave_up_on_substitution(&mut self, cx: &mut GoalCx<'_>, drv: &Derivation) -> Step {
        let input_mode = if self.mode == BuildMode::Repair {
            BuildMode::Repair
        } else {
            BuildMode::Normal
        };

        self.input_goals.clear();
        for (input, outputs) in &drv.input_drvs {
            let goal = cx.worker.make_derivation_goal(
                input.clone(),
                OutputsSpec::Names(outputs.clone()),
                input_mode,
            );
            cx.add_waitee(goal);
            self.input_goals.insert(input.clone(), (goal, outputs.clone()));
        }

        for src in &drv.input_srcs {
            let store = cx.store();
            if store.is_valid_path(src) && (self.mode != BuildMode::Repair || cx.path_contents_good(src)) {
                continue;
            }
            let goal = cx
                .worker
                .make_path_substitution_goal(src.clone(), self.mode == BuildMode::Repair, None);
            cx.add_waitee(goal);
        }

        self.state = State::InputsRealised;
        Step::Suspend(WaitOn::Waitees)
    }

    /// Re-fetch or rebuild every corrupt path in the output closure.
    fn repair_closure(&mut self, cx: &mut GoalCx<'_>, drv: &Derivation) -> Step {
        let store = cx.store();
        let outputs: BTreeSet<StorePath> = self
            .output_paths(cx, drv)
            .into_values()
            .filter(|p| store.is_valid_path(p))
            .collect();

        let mut waiting = 0usize;
        for path in store.compute_closure(&outputs) {
            if cx.path_contents_good(&path) {
                continue;
            }
            info!(%path, drv = %self.drv_path, "found corrupted or missing path in output closure");
            let deriver = store
                .query_path_info(&path)
                .and_then(|i| i.deriver)
                .filter(|d| *d != self.drv_path && store.is_valid_path(d));
            let goal = match deriver {
                Some(deriver) => cx
                    .worker
                    .make_derivation_goal(deriver, OutputsSpec::All, BuildMode::Repair),
                None => cx.worker.make_path_substitution_goal(path, true, None),
            };
            cx.add_waitee(goal);
            waiting += 1;
        }

        if waiting == 0 {
            let outputs = self.valid_realisations(cx, drv);
            return self.finish_success(cx, SuccessStatus::AlreadyValid, outputs);
        }
        self.state = State::ClosureRepaired;
        Step::Suspend(WaitOn::Waitees)
    }

    fn closure_repaired(&mut self, cx: &mut GoalCx<'_>) -> Step {
        if cx.common().nr_failed > 0 {
            let msg = format!(
                "some paths in the output closure of derivation '{}' could not be repaired",
                self.drv_path
            );
            return self.finish_failure(cx, FailureStatus::MiscFailure, msg, ExitCode::Failed);
        }
        let outputs = match self.drv.as_ref() {
            Some(drv) => self.valid_realisations(cx, drv),
            None => BTreeMap::new(),
        };
        self.finish_success(cx, SuccessStatus::AlreadyValid, outputs)
    }

    fn inputs_realised(&mut self, cx: &mut GoalCx<'_>) -> Result<Option<Step>> {
        let common = cx.common();
        let (nr_failed, nr_no_subs, nr_incomplete) = (
            common.nr_failed,
            common.nr_no_substituters,
            common.nr_incomplete_closure,
        );

        if nr_failed > 0 {
            let exit = if nr_incomplete == nr_failed {
                ExitCode::IncompleteClosure
            } else if nr_no_subs > 0 && nr_no_subs + nr_incomplete == nr_failed {
                ExitCode::NoSubstituters
            } else {
                ExitCode::Failed
            };
            let msg = format!(
                "{nr_failed} dependencies of derivation '{}' failed to build",
                self.drv_path
            );
            return Ok(Some(self.finish_failure(cx, FailureStatus::DependencyFailed, msg, exit)));
        }

        if self.retry_substitution == RetrySubstitution::Needed {
            self.retry_substitution = RetrySubstitution::AlreadyRetried;
            self.state = State::HaveDerivation;
            return Ok(None);
        }

        // From here on the builder produces every output.
        self.need_restart = NeedRestart::BuildInProgress;

        let drv = self.drv()?.clone();
        self.input_outputs.clear();
        let mut inputs: BTreeSet<StorePath> = drv.input_srcs.clone();
        for (input, (goal, outputs)) in &self.input_goals {
            let built = cx.build_result_of(*goal).map(|r| &r.built_outputs);
            for output in outputs {
                let Some(realisation) = built.and_then(|b| b.get(output)) else {
                    return Err(RealiserError::build(format!(
                        "derivation '{}' requires non-existent output '{output}' from input derivation '{input}'",
                        self.drv_path
                    )));
                };
                inputs.insert(realisation.out_path.clone());
                self.input_outputs
                    .insert((input.clone(), output.clone()), realisation.out_path.clone());
            }
        }

        if drv.has_floating_outputs() && !drv.is_resolved() {
            let known = &self.input_outputs;
            let Some(resolved) =
                drv.try_resolve(|input, output| known.get(&(input.clone(), output.to_string())).cloned())
            else {
                return Err(RealiserError::build(format!(
                    "derivation '{}' could not be resolved",
                    self.drv_path
                )));
            };
            let resolved_path = cx.store().write_derivation(&resolved)?;
            info!(drv = %self.drv_path, resolved = %resolved_path, "building resolved derivation");
            let goal = cx.worker.make_derivation_goal(
                resolved_path,
                self.wanted_outputs.clone(),
                self.mode,
            );
            cx.add_waitee(goal);
            self.resolved_goal = Some(goal);
            self.state = State::ResolvedFinished;
            return Ok(Some(Step::Suspend(WaitOn::Waitees)));
        }

        self.input_paths = cx.store().compute_closure(&inputs);
        self.state = State::TryToBuild;
        Ok(None)
    }

    /// Copy the result of building the resolved derivation back onto the
    /// unresolved one.
    fn resolved_finished(&mut self, cx: &mut GoalCx<'_>) -> Result<Step> {
        let Some(goal) = self.resolved_goal else {
            return Err(RealiserError::build("resolved derivation goal went missing"));
        };
        let exit = cx.exit_code_of(goal);
        let result = cx.build_result_of(goal).cloned().unwrap_or_default();
        if exit != ExitCode::Success || !result.is_success() {
            let err = cx.error_of(goal);
            cx.set_build_result(result);
            cx.stats_mut().failed_builds += 1;
            let exit = if exit == ExitCode::Success { ExitCode::Failed } else { exit };
            return Ok(Step::forward(exit, err));
        }

        let drv = self.drv()?.clone();
        let store = cx.store();
        let mut outputs = BTreeMap::new();
        for name in self.wanted_outputs.resolve(drv.output_names()) {
            let Some(built) = result.built_outputs.get(&name) else {
                return Err(RealiserError::build(format!(
                    "resolved derivation of '{}' did not produce expected output '{name}'",
                    self.drv_path
                )));
            };
            let realisation = Realisation::keyed(
                DrvOutput::new(self.drv_path.clone(), name.clone()),
                built.unkeyed(),
            );
            store.register_realisation(realisation.clone())?;
            outputs.insert(name, realisation);
        }

        let status = match result.status {
            BuildStatus::Success(SuccessStatus::Built) => SuccessStatus::Built,
            _ => SuccessStatus::ResolvesToAlreadyValid,
        };
        Ok(self.finish_success(cx, status, outputs))
    }

    fn try_to_build(&mut self, cx: &mut GoalCx<'_>) -> Result<Option<Step>> {
        let drv = self.drv()?.clone();

        if self.lock.is_none() {
            let paths: BTreeSet<StorePath> = self.output_paths(cx, &drv).into_values().collect();
            match cx.store().try_lock_paths(&paths)? {
                Some(lock) => self.lock = Some(lock),
                None => {
                    debug!(drv = %self.drv_path, "waiting for locks on the outputs");
                    return Ok(Some(Step::Suspend(WaitOn::AWhile)));
                }
            }
        }

        // Somebody else may have built the outputs while we waited.
        if self.mode == BuildMode::Normal {
            let statuses = self.output_statuses(cx, &drv);
            let wanted = self.wanted_outputs.resolve(drv.output_names());
            if self.all_valid(&statuses, &wanted) {
                debug!(drv = %self.drv_path, "outputs became valid while waiting; skipping build");
                let outputs = self.valid_realisations(cx, &drv);
                return Ok(Some(self.finish_success(cx, SuccessStatus::AlreadyValid, outputs)));
            }
        }

        let request = BuildRequest {
            drv_path: self.drv_path.clone(),
            drv: drv.clone(),
            input_paths: self.input_paths.clone(),
            mode: self.mode,
            log: cx.log_sink(),
        };

        if !drv.prefer_local_build {
            match cx.offer_to_hook(&request) {
                Some(HookReply::Accept(job)) => {
                    info!(drv = %self.drv_path, "building remotely");
                    self.remote = true;
                    self.start(cx, job, false);
                    return Ok(Some(Step::Suspend(WaitOn::Child)));
                }
                Some(HookReply::Postpone) => {
                    debug!(drv = %self.drv_path, "build hook postponed the build");
                    self.lock = None;
                    return Ok(Some(Step::Suspend(WaitOn::AWhile)));
                }
                Some(HookReply::Decline | HookReply::DeclinePermanently) | None => {}
            }
        }

        if cx.nr_local_builds() >= cx.settings().max_jobs {
            self.lock = None;
            return Ok(Some(Step::Suspend(WaitOn::BuildSlot)));
        }

        match cx.executor().start_build(request) {
            Ok(job) => {
                info!(drv = %self.drv_path, "building");
                self.remote = false;
                self.start(cx, job, true);
                Ok(Some(Step::Suspend(WaitOn::Child)))
            }
            Err(e) => {
                cx.failures_mut().permanent_failure = true;
                Ok(Some(self.finish_failure(
                    cx,
                    FailureStatus::InputRejected,
                    e.to_string(),
                    ExitCode::Failed,
                )))
            }
        }
    }

    fn start(&mut self, cx: &mut GoalCx<'_>, job: BuildJob, in_build_slot: bool) {
        self.log_limit = cx.settings().log_lines;
        self.log_tail.clear();
        cx.build_result_mut().start_time = Some(SystemTime::now());
        cx.stats_mut().running_builds += 1;
        self.build = Some(cx.spawn_build(job, in_build_slot));
        self.state = State::BuildDone;
    }

    fn end_build(&mut self, cx: &mut GoalCx<'_>) {
        if self.build.take().is_some() {
            let stats = cx.stats_mut();
            stats.running_builds = stats.running_builds.saturating_sub(1);
            let result = cx.build_result_mut();
            result.stop_time = Some(SystemTime::now());
            result.times_built += 1;
        }
    }

    fn build_done(&mut self, cx: &mut GoalCx<'_>) -> Result<Option<Step>> {
        let Some(outcome) = self.build.as_mut().and_then(Pending::poll) else {
            return Ok(Some(Step::Suspend(WaitOn::Child)));
        };
        cx.child_terminated();
        self.end_build(cx);
        debug!(drv = %self.drv_path, remote = self.remote, "builder finished");

        let outputs = match outcome {
            Ok(BuildOutcome::Success { outputs }) => outputs,
            Ok(BuildOutcome::Failure { status, message }) => {
                let msg = format!(
                    "builder for '{}' failed: {message}{}",
                    self.drv_path,
                    self.log_tail_message()
                );
                return Ok(Some(self.finish_failure(cx, status, msg, ExitCode::Failed)));
            }
            Err(e) => {
                let msg = format!("builder for '{}' failed: {e}", self.drv_path);
                return Ok(Some(self.finish_failure(cx, FailureStatus::MiscFailure, msg, ExitCode::Failed)));
            }
        };

        match self.register_outputs(cx, outputs)? {
            Ok(realisations) => {
                cx.stats_mut().done_builds += 1;
                Ok(Some(self.finish_success(cx, SuccessStatus::Built, realisations)))
            }
            Err((status, msg)) => Ok(Some(self.finish_failure(cx, status, msg, ExitCode::Failed))),
        }
    }

    /// Check what the builder produced against the derivation and make it
    /// valid. The inner `Err` is a build failure of this derivation.
    fn register_outputs(
        &mut self,
        cx: &mut GoalCx<'_>,
        mut produced: BTreeMap<OutputName, PathInfo>,
    ) -> Result<Registered> {
        let drv = self.drv()?.clone();
        let store = cx.store();

        for (name, output) in &drv.outputs {
            let Some(info) = produced.get_mut(name) else {
                return Ok(Err((
                    FailureStatus::OutputRejected,
                    format!("builder for '{}' did not produce output '{name}'", self.drv_path),
                )));
            };
            if let Some(expected) = output.path() {
                if info.path != *expected {
                    if let DerivationOutput::Fixed { hash, .. } = output {
                        cx.failures_mut().hash_mismatch = true;
                        return Ok(Err((
                            FailureStatus::HashMismatch,
                            format!(
                                "hash mismatch in fixed-output derivation '{}': output '{name}' should be '{expected}' (hash {hash}) but got '{}'",
                                self.drv_path, info.path
                            ),
                        )));
                    }
                    return Ok(Err((
                        FailureStatus::OutputRejected,
                        format!(
                            "output '{name}' of '{}' should be '{expected}' but the builder produced '{}'",
                            self.drv_path, info.path
                        ),
                    )));
                }
            }
            info.deriver = Some(self.drv_path.clone());
            if info.ca.is_none() {
                info.ca = output.ca();
            }
        }

        if self.mode == BuildMode::Check {
            for info in produced.values() {
                let previous = store.query_path_info(&info.path).and_then(|i| i.nar_hash);
                if previous.is_some() && info.nar_hash.is_some() && previous != info.nar_hash {
                    cx.failures_mut().check_mismatch = true;
                    return Ok(Err((
                        FailureStatus::NotDeterministic,
                        format!(
                            "derivation '{}' may not be deterministic: output '{}' differs",
                            self.drv_path, info.path
                        ),
                    )));
                }
            }
        }

        let wanted = self.wanted_outputs.resolve(drv.output_names());
        let mut realisations = BTreeMap::new();
        for (name, info) in produced {
            if !drv.outputs.contains_key(&name) {
                warn!(drv = %self.drv_path, output = %name, "ignoring undeclared output");
                continue;
            }
            let path = info.path.clone();
            if self.mode != BuildMode::Check && (self.mode == BuildMode::Repair || !store.is_valid_path(&path)) {
                store.register_valid_path(info)?;
            }
            cx.mark_contents_good(&path);

            let realisation = Realisation::new(DrvOutput::new(self.drv_path.clone(), name.clone()), path);
            store.register_realisation(realisation.clone())?;
            if wanted.contains(&name) {
                realisations.insert(name, realisation);
            }
        }
        Ok(Ok(realisations))
    }

    fn log_tail_message(&self) -> String {
        if self.log_tail.is_empty() {
            return String::new();
        }
        let mut msg = format!("\nlast {} log lines:", self.log_tail.len());
        for line in &self.log_tail {
            msg.push_str("\n> ");
            msg.push_str(line);
        }
        msg
    }

    fn finish_success(
        &mut self,
        cx: &mut GoalCx<'_>,
        status: SuccessStatus,
        outputs: BTreeMap<OutputName, Realisation>,
    ) -> Step {
        self.lock = None;
        let result = cx.build_result_mut();
        result.status = BuildStatus::Success(status);
        result.error_msg = None;
        result.built_outputs = outputs;
        debug!(drv = %self.drv_path, ?status, "derivation goal succeeded");
        Step::done(ExitCode::Success)
    }

    fn finish_failure(
        &mut self,
        cx: &mut GoalCx<'_>,
        status: FailureStatus,
        msg: String,
        exit: ExitCode,
    ) -> Step {
        self.lock = None;
        match status {
            FailureStatus::PermanentFailure => cx.failures_mut().permanent_failure = true,
            FailureStatus::TimedOut => cx.failures_mut().timed_out = true,
            FailureStatus::HashMismatch => cx.failures_mut().hash_mismatch = true,
            FailureStatus::NotDeterministic => cx.failures_mut().check_mismatch = true,
            _ => {}
        }
        if self.counted {
            cx.stats_mut().failed_builds += 1;
        }

        let result = cx.build_result_mut();
        result.status = BuildStatus::Failure(status);
        result.error_msg = Some(msg.clone());
        result.built_outputs.clear();
        Step::failed(exit, RealiserError::build(msg))
    }

    fn drv(&self) -> Result<&Derivation> {
        self.drv
            .as_ref()
            .ok_or_else(|| RealiserError::MissingDerivation(self.drv_path.clone()))
    }

    /// Output path, from the derivation or the build trace.
    fn known_output_path(&self, cx: &GoalCx<'_>, drv: &Derivation, name: &str) -> Option<StorePath> {
        drv.outputs.get(name).and_then(|o| o.path().cloned()).or_else(|| {
            cx.store()
                .query_realisation(&DrvOutput::new(self.drv_path.clone(), name))
                .map(|r| r.out_path)
        })
    }

    fn output_paths(&self, cx: &GoalCx<'_>, drv: &Derivation) -> BTreeMap<OutputName, StorePath> {
        drv.outputs
            .keys()
            .filter_map(|name| Some((name.clone(), self.known_output_path(cx, drv, name)?)))
            .collect()
    }

    fn output_statuses(&self, cx: &mut GoalCx<'_>, drv: &Derivation) -> BTreeMap<OutputName, OutputStatus> {
        let store = cx.store();
        let mut statuses = BTreeMap::new();
        for (name, path) in self.output_paths(cx, drv) {
            let status = if !store.is_valid_path(&path) {
                OutputStatus::Absent
            } else if self.mode == BuildMode::Repair && !cx.path_contents_good(&path) {
                OutputStatus::Corrupt
            } else {
                OutputStatus::Valid
            };
            statuses.insert(name, status);
        }
        statuses
    }

    fn all_valid(&self, statuses: &BTreeMap<OutputName, OutputStatus>, wanted: &BTreeSet<OutputName>) -> bool {
        wanted
            .iter()
            .all(|name| statuses.get(name) == Some(&OutputStatus::Valid))
    }

    /// Realisations of the wanted outputs that are valid now.
    fn valid_realisations(&self, cx: &GoalCx<'_>, drv: &Derivation) -> BTreeMap<OutputName, Realisation> {
        let store = cx.store();
        let wanted = self.wanted_outputs.resolve(drv.output_names());
        self.output_paths(cx, drv)
            .into_iter()
            .filter(|(name, path)| wanted.contains(name) && store.is_valid_path(path))
            .map(|(name, path)| {
                let id = DrvOutput::new(self.drv_path.clone(), name.clone());
                (name, Realisation::new(id, path))
            })
            .collect()
    }
}
