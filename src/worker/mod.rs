// src/worker/mod.rs

//! The goal scheduler.
//!
//! A `Worker` owns every goal of a run in an arena and steps the awake ones
//! in key order on a single task. Goals never run concurrently with each
//! other; concurrency with the outside world comes from children (builds
//! and substituter helper threads) that report over one event channel.
//!
//! Goals are only created through the `make_*` factories, which return the
//! existing live goal for an identity when there is one. A goal stays alive
//! while it is a top-level goal or a waiter retains it; when the last
//! holder lets go of a busy goal it is abandoned and its children killed.
//!
//! A worker may be run several times. Finished goals are only shared within
//! the run they were created for; the next run starts by dropping them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::build_result::BuildResult;
use crate::config::WorkerSettings;
use crate::derivation::Derivation;
use crate::errors::GoalError;
use crate::exec::{BuildHook, LocalExecutor};
use crate::goal::arena::Arena;
use crate::goal::{
    BuildTraceGoal, CreateDerivationAndRealiseGoal, DerivationGoal, DerivationResolutionGoal,
    DrvOutputSubstitutionGoal, ExitCode, GoalCommon, GoalId, GoalKind, PathSubstitutionGoal,
};
use crate::store::Store;
use crate::substituter::SubstituterRef;
use crate::types::{BuildMode, DerivedPath, DrvOutput, OutputName, OutputsSpec, SingleDerivedPath, StorePath};

mod children;
mod context;
mod run;

pub(crate) use children::ChildEvent;
use children::Child;
pub use children::Pending;
pub use context::GoalCx;

/// Progress counters, logged at `debug` and readable by hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub expected_builds: u64,
    pub done_builds: u64,
    pub failed_builds: u64,
    pub running_builds: u64,
    pub expected_substitutions: u64,
    pub done_substitutions: u64,
    pub failed_substitutions: u64,
    pub running_substitutions: u64,
    pub expected_download_size: u64,
    pub done_download_size: u64,
    pub expected_nar_size: u64,
    pub done_nar_size: u64,
}

/// Kinds of failure seen during the run, for the exit status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureFlags {
    pub permanent_failure: bool,
    pub timed_out: bool,
    pub hash_mismatch: bool,
    pub check_mismatch: bool,
}

#[derive(Debug)]
pub(crate) struct GoalSlot {
    pub(crate) common: GoalCommon,
    /// `None` while the goal is being stepped.
    pub(crate) kind: Option<GoalKind>,
}

pub struct Worker {
    goals: Arena<GoalSlot>,
    top_goals: BTreeSet<GoalId>,
    awake: BTreeSet<GoalId>,
    wanting_to_build: BTreeSet<GoalId>,
    waiting_for_any_goal: BTreeSet<GoalId>,
    waiting_for_a_while: BTreeSet<GoalId>,
    last_woken_up: Option<Instant>,

    children: Vec<Child>,
    child_serial: u64,
    nr_local_builds: usize,
    nr_substitutions: usize,
    events_tx: mpsc::UnboundedSender<ChildEvent>,
    events_rx: mpsc::UnboundedReceiver<ChildEvent>,

    derivation_goals: BTreeMap<StorePath, GoalId>,
    path_substitution_goals: BTreeMap<StorePath, GoalId>,
    drv_output_substitution_goals: BTreeMap<DrvOutput, GoalId>,
    build_trace_goals: BTreeMap<SingleDerivedPath, GoalId>,
    resolution_goals: BTreeMap<StorePath, GoalId>,
    create_goals: BTreeMap<SingleDerivedPath, GoalId>,

    store: Arc<dyn Store>,
    substituters: Vec<SubstituterRef>,
    executor: Arc<dyn LocalExecutor>,
    hook: Option<Box<dyn BuildHook>>,
    try_build_hook: bool,
    settings: WorkerSettings,

    contents_good: BTreeMap<StorePath, bool>,
    failures: FailureFlags,
    stats: WorkerStats,
    cancelled: bool,
    /// Number of the current run; goals made between runs belong to the next.
    run_no: u64,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Worker")
    }
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn LocalExecutor>,
        settings: WorkerSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Worker {
            goals: Arena::default(),
            top_goals: BTreeSet::new(),
            awake: BTreeSet::new(),
            wanting_to_build: BTreeSet::new(),
            waiting_for_any_goal: BTreeSet::new(),
            waiting_for_a_while: BTreeSet::new(),
            last_woken_up: None,
            children: Vec::new(),
            child_serial: 0,
            nr_local_builds: 0,
            nr_substitutions: 0,
            events_tx,
            events_rx,
            derivation_goals: BTreeMap::new(),
            path_substitution_goals: BTreeMap::new(),
            drv_output_substitution_goals: BTreeMap::new(),
            build_trace_goals: BTreeMap::new(),
            resolution_goals: BTreeMap::new(),
            create_goals: BTreeMap::new(),
            store,
            substituters: Vec::new(),
            executor,
            hook: None,
            try_build_hook: false,
            settings,
            contents_good: BTreeMap::new(),
            failures: FailureFlags::default(),
            stats: WorkerStats::default(),
            cancelled: false,
            run_no: 0,
        }
    }

    /// Substituters in order of preference.
    pub fn with_substituters(mut self, substituters: Vec<SubstituterRef>) -> Self {
        self.substituters = substituters;
        self
    }

    pub fn with_build_hook(mut self, hook: Box<dyn BuildHook>) -> Self {
        self.hook = Some(hook);
        self.try_build_hook = true;
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn failures(&self) -> FailureFlags {
        self.failures
    }

    // ---------------------------------------------------------------------
    // Factories
    // ---------------------------------------------------------------------

    pub fn make_derivation_goal(
        &mut self,
        drv_path: StorePath,
        wanted_outputs: OutputsSpec,
        mode: BuildMode,
    ) -> GoalId {
        self.make_derivation_goal_common(drv_path, None, wanted_outputs, mode)
    }

    /// Build a derivation the caller already has in memory, which need not
    /// be in the store.
    pub fn make_basic_derivation_goal(
        &mut self,
        drv_path: StorePath,
        drv: Derivation,
        wanted_outputs: OutputsSpec,
        mode: BuildMode,
    ) -> GoalId {
        self.make_derivation_goal_common(drv_path, Some(drv), wanted_outputs, mode)
    }

    fn make_derivation_goal_common(
        &mut self,
        drv_path: StorePath,
        drv: Option<Derivation>,
        wanted_outputs: OutputsSpec,
        mode: BuildMode,
    ) -> GoalId {
        let existing = self.live(self.derivation_goals.get(&drv_path).copied());
        if let Some(id) = existing.filter(|id| self.reuse_for_outputs(*id, &wanted_outputs)) {
            return id;
        }

        let goal = DerivationGoal::new(drv_path.clone(), drv, wanted_outputs, mode);
        let id = self.insert_goal(GoalKind::Derivation(Box::new(goal)));
        self.derivation_goals.insert(drv_path, id);
        id
    }

    /// Whether an existing goal can serve a request for `outputs`, widening
    /// it if it is still running.
    fn reuse_for_outputs(&mut self, id: GoalId, outputs: &OutputsSpec) -> bool {
        let Some(slot) = self.goals.get_mut(id) else {
            return false;
        };
        match (slot.common.exit_code, slot.kind.as_mut()) {
            (ExitCode::Busy, Some(kind)) => {
                if let Some(inner) = kind.add_wanted_outputs(outputs) {
                    self.widen_goal(inner, outputs);
                }
                true
            }
            // Being stepped: it is the caller itself.
            (ExitCode::Busy, None) => true,
            (ExitCode::Success, Some(kind)) => kind.satisfies(outputs, &slot.common.build_result),
            // A failure answers every later request of the run the same way.
            (_, _) => true,
        }
    }

    fn widen_goal(&mut self, id: GoalId, outputs: &OutputsSpec) {
        if let Some(slot) = self.goals.get_mut(id) {
            if slot.common.exit_code == ExitCode::Busy {
                if let Some(kind) = slot.kind.as_mut() {
                    kind.add_wanted_outputs(outputs);
                }
            }
        }
    }

    pub fn make_path_substitution_goal(
        &mut self,
        path: StorePath,
        repair: bool,
        ca: Option<String>,
    ) -> GoalId {
        if let Some(id) = self.live(self.path_substitution_goals.get(&path).copied()) {
            return id;
        }
        let goal = PathSubstitutionGoal::new(path.clone(), repair, ca);
        let id = self.insert_goal(GoalKind::PathSubstitution(goal));
        self.path_substitution_goals.insert(path, id);
        id
    }

    pub fn make_drv_output_substitution_goal(&mut self, id: DrvOutput) -> GoalId {
        if let Some(goal) = self.live(self.drv_output_substitution_goals.get(&id).copied()) {
            return goal;
        }
        let goal = DrvOutputSubstitutionGoal::new(id.clone());
        let goal_id = self.insert_goal(GoalKind::DrvOutputSubstitution(goal));
        self.drv_output_substitution_goals.insert(id, goal_id);
        goal_id
    }

    pub fn make_build_trace_goal(&mut self, drv_path: SingleDerivedPath, output: OutputName) -> GoalId {
        let key = SingleDerivedPath::built(drv_path.clone(), output.clone());
        if let Some(id) = self.live(self.build_trace_goals.get(&key).copied()) {
            return id;
        }
        let goal = BuildTraceGoal::new(drv_path, output);
        let id = self.insert_goal(GoalKind::BuildTrace(goal));
        self.build_trace_goals.insert(key, id);
        id
    }

    pub fn make_derivation_resolution_goal(&mut self, drv_path: StorePath) -> GoalId {
        if let Some(id) = self.live(self.resolution_goals.get(&drv_path).copied()) {
            return id;
        }
        let goal = DerivationResolutionGoal::new(drv_path.clone());
        let id = self.insert_goal(GoalKind::DerivationResolution(goal));
        self.resolution_goals.insert(drv_path, id);
        id
    }

    pub fn make_create_derivation_and_realise_goal(
        &mut self,
        drv_req: SingleDerivedPath,
        wanted_outputs: OutputsSpec,
        mode: BuildMode,
    ) -> GoalId {
        let existing = self.live(self.create_goals.get(&drv_req).copied());
        if let Some(id) = existing.filter(|id| self.reuse_for_outputs(*id, &wanted_outputs)) {
            return id;
        }
        let goal = CreateDerivationAndRealiseGoal::new(drv_req.clone(), wanted_outputs, mode);
        let id = self.insert_goal(GoalKind::CreateDerivationAndRealise(goal));
        self.create_goals.insert(drv_req, id);
        id
    }

    /// The goal realising a host request.
    pub fn make_goal(&mut self, req: &DerivedPath, mode: BuildMode) -> GoalId {
        match req {
            DerivedPath::Built { drv_path, outputs } => {
                self.make_create_derivation_and_realise_goal(drv_path.clone(), outputs.clone(), mode)
            }
            DerivedPath::Opaque(path) => {
                self.make_path_substitution_goal(path.clone(), mode == BuildMode::Repair, None)
            }
        }
    }

    /// A goal that may be shared: busy, or finished during this run.
    fn live(&self, id: Option<GoalId>) -> Option<GoalId> {
        id.filter(|id| {
            self.goals.get(*id).is_some_and(|slot| {
                slot.common.run == self.run_no || !slot.common.exit_code.is_terminal()
            })
        })
    }

    fn insert_goal(&mut self, kind: GoalKind) -> GoalId {
        let mut common = GoalCommon::new(kind.key(), kind.name(), kind.category());
        common.run = self.run_no;
        debug!(goal = %common.key, "created goal");
        let id = self.goals.insert(GoalSlot {
            common,
            kind: Some(kind),
        });
        self.wake_up(id);
        id
    }

    // ---------------------------------------------------------------------
    // Reading goals
    // ---------------------------------------------------------------------

    pub fn goal(&self, id: GoalId) -> Option<&GoalCommon> {
        self.goals.get(id).map(|slot| &slot.common)
    }

    pub fn goal_kind(&self, id: GoalId) -> Option<&GoalKind> {
        self.goals.get(id).and_then(|slot| slot.kind.as_ref())
    }

    pub fn exit_code(&self, id: GoalId) -> Option<ExitCode> {
        self.goal(id).map(|c| c.exit_code)
    }

    pub fn build_result(&self, id: GoalId) -> Option<&BuildResult> {
        self.goal(id).map(|c| &c.build_result)
    }

    pub fn goal_error(&self, id: GoalId) -> Option<GoalError> {
        self.goal(id).and_then(|c| c.error.clone())
    }

    pub fn live_goal_count(&self) -> usize {
        self.goals.len()
    }

    /// Process exit status a host should use after a failed run.
    ///
    /// Bits: 0x04 build failure, 0x01 timeout, 0x02 hash mismatch,
    /// 0x08 check mismatch. Any of them is reported as `0x60 | bits`;
    /// otherwise the status is 1.
    pub fn failing_exit_status(&self) -> u32 {
        let mut mask = 0;
        let f = self.failures;
        if f.permanent_failure {
            mask |= 0x04;
        }
        if f.timed_out {
            mask |= 0x01;
        }
        if f.hash_mismatch {
            mask |= 0x02;
        }
        if f.check_mismatch {
            mask |= 0x08;
        }
        if mask != 0 { 0x60 | mask } else { 1 }
    }

    /// Repair mode: whether a valid path's contents are intact. Cached per run.
    pub(crate) fn path_contents_good(&mut self, path: &StorePath) -> bool {
        if let Some(good) = self.contents_good.get(path) {
            return *good;
        }
        let good = self.store.is_valid_path(path) && self.store.verify_path_contents(path);
        if !good {
            info!(%path, "path is corrupted or missing");
        }
        self.contents_good.insert(path.clone(), good);
        good
    }

    // ---------------------------------------------------------------------
    // Waking, waiting, finishing
    // ---------------------------------------------------------------------

    pub(crate) fn wake_up(&mut self, id: GoalId) {
        if self
            .goals
            .get(id)
            .is_some_and(|slot| slot.common.exit_code == ExitCode::Busy)
        {
            self.awake.insert(id);
        }
    }

    pub(crate) fn add_waitee(&mut self, waiter: GoalId, waitee: GoalId) {
        let Some(waitee_exit) = self.exit_code(waitee) else {
            return;
        };
        self.retain(waitee);

        let Some(slot) = self.goals.get_mut(waiter) else {
            return;
        };
        slot.common.retained.push(waitee);
        if waitee_exit.is_terminal() {
            slot.common.count_waitee_exit(waitee_exit);
            return;
        }
        slot.common.waitees.insert(waitee);
        if let Some(w) = self.goals.get_mut(waitee) {
            w.common.waiters.insert(waiter);
        }
    }

    fn retain(&mut self, id: GoalId) {
        if let Some(slot) = self.goals.get_mut(id) {
            slot.common.refs += 1;
        }
    }

    fn release(&mut self, id: GoalId) {
        let Some(slot) = self.goals.get_mut(id) else {
            return;
        };
        slot.common.refs = slot.common.refs.saturating_sub(1);
        if slot.common.refs == 0 && !self.top_goals.contains(&id) && slot.kind.is_some() {
            self.drop_goal(id);
        }
    }

    /// Remove a goal nobody holds any more.
    fn drop_goal(&mut self, id: GoalId) {
        let Some(slot) = self.goals.remove(id) else {
            return;
        };
        if slot.common.exit_code == ExitCode::Busy {
            debug!(goal = %slot.common.key, "abandoning goal nobody waits for");
            self.kill_child(id);
        }
        for waitee in &slot.common.waitees {
            if let Some(w) = self.goals.get_mut(*waitee) {
                w.common.waiters.remove(&id);
            }
        }
        self.awake.remove(&id);
        self.wanting_to_build.remove(&id);
        self.waiting_for_any_goal.remove(&id);
        self.waiting_for_a_while.remove(&id);
        for held in slot.common.retained {
            self.release(held);
        }
    }

    /// Record a goal's terminal exit code and notify its waiters.
    pub(crate) fn am_done(&mut self, id: GoalId, exit: ExitCode, error: Option<GoalError>) {
        let Some(slot) = self.goals.get_mut(id) else {
            return;
        };
        debug_assert_eq!(slot.common.exit_code, ExitCode::Busy);
        slot.common.exit_code = exit;

        if let Some(err) = error {
            if !slot.common.waiters.is_empty() {
                error!(goal = %slot.common.key, "{err}");
            }
            slot.common.error = Some(err);
        }
        debug!(goal = %slot.common.key, ?exit, "goal finished");

        let waiters = std::mem::take(&mut slot.common.waiters);
        let pending = std::mem::take(&mut slot.common.waitees);
        let retained = std::mem::take(&mut slot.common.retained);

        for waitee in pending {
            if let Some(w) = self.goals.get_mut(waitee) {
                w.common.waiters.remove(&id);
            }
        }
        if self.has_child(id) {
            self.kill_child(id);
        }
        for waiter in waiters {
            self.waitee_done(waiter, id, exit);
        }
        for held in retained {
            self.release(held);
        }
        self.goal_finished(id, exit);
    }

    fn waitee_done(&mut self, waiter: GoalId, waitee: GoalId, exit: ExitCode) {
        let keep_going = self.settings.keep_going;
        let Some(slot) = self.goals.get_mut(waiter) else {
            return;
        };
        slot.common.waitees.remove(&waitee);
        slot.common.count_waitee_exit(exit);

        // Without keep-going, one failure is enough to wake the waiter.
        if slot.common.waitees.is_empty() || (exit == ExitCode::Failed && !keep_going) {
            let rest = std::mem::take(&mut slot.common.waitees);
            for other in rest {
                if let Some(g) = self.goals.get_mut(other) {
                    g.common.waiters.remove(&waiter);
                }
            }
            self.wake_up(waiter);
        }
    }

    fn goal_finished(&mut self, id: GoalId, exit: ExitCode) {
        if exit == ExitCode::Failed && !self.settings.keep_going && self.top_goals.contains(&id) {
            info!("a top-level goal failed; stopping the remaining goals");
            self.cancel_run();
        }
        for waiting in std::mem::take(&mut self.waiting_for_any_goal) {
            self.wake_up(waiting);
        }
    }

    /// Stop everything still running. Unfinished goals are failed when the
    /// run returns.
    fn cancel_run(&mut self) {
        self.cancelled = true;
        self.kill_all_children();
        self.awake.clear();
        self.wanting_to_build.clear();
        self.waiting_for_any_goal.clear();
        self.waiting_for_a_while.clear();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.kill_all_children();
    }
}
