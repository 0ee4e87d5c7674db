// src/worker/context.rs

//! What a goal sees of the worker while it is being stepped.

use std::sync::Arc;

use super::{FailureFlags, Pending, Worker, WorkerStats};
use crate::build_result::BuildResult;
use crate::config::WorkerSettings;
use crate::errors::{GoalError, Result};
use crate::exec::{BuildJob, BuildOutcome, BuildRequest, HookReply, LocalExecutor, LogSink};
use crate::goal::{ExitCode, GoalCommon, GoalId, GoalKind};
use crate::store::Store;
use crate::substituter::SubstituterRef;
use crate::types::StorePath;

pub struct GoalCx<'w> {
    id: GoalId,
    pub(crate) worker: &'w mut Worker,
}

impl<'w> GoalCx<'w> {
    pub(crate) fn new(id: GoalId, worker: &'w mut Worker) -> Self {
        GoalCx { id, worker }
    }

    pub fn id(&self) -> GoalId {
        self.id
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.worker.settings
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.worker.store)
    }

    pub fn substituters(&self) -> Vec<SubstituterRef> {
        if self.worker.settings.use_substitutes {
            self.worker.substituters.clone()
        } else {
            Vec::new()
        }
    }

    pub fn executor(&self) -> Arc<dyn LocalExecutor> {
        Arc::clone(&self.worker.executor)
    }

    pub fn common(&self) -> &GoalCommon {
        &self
            .worker
            .goals
            .get(self.id)
            .expect("a goal being stepped is live")
            .common
    }

    fn common_mut(&mut self) -> &mut GoalCommon {
        &mut self
            .worker
            .goals
            .get_mut(self.id)
            .expect("a goal being stepped is live")
            .common
    }

    pub fn build_result_mut(&mut self) -> &mut BuildResult {
        &mut self.common_mut().build_result
    }

    pub fn set_build_result(&mut self, result: BuildResult) {
        self.common_mut().build_result = result;
    }

    pub fn reset_failure_counters(&mut self) {
        self.common_mut().reset_failure_counters();
    }

    /// Depend on `waitee`. It is kept alive until this goal finishes; if it
    /// has already finished, only its exit code is counted.
    pub fn add_waitee(&mut self, waitee: GoalId) {
        self.worker.add_waitee(self.id, waitee);
    }

    pub fn exit_code_of(&self, goal: GoalId) -> ExitCode {
        self.worker.exit_code(goal).unwrap_or(ExitCode::Failed)
    }

    pub fn error_of(&self, goal: GoalId) -> Option<GoalError> {
        self.worker.goal_error(goal)
    }

    pub fn build_result_of(&self, goal: GoalId) -> Option<&BuildResult> {
        self.worker.build_result(goal)
    }

    pub fn kind_of(&self, goal: GoalId) -> Option<&GoalKind> {
        self.worker.goal_kind(goal)
    }

    pub fn spawn_helper<T, F>(&mut self, in_build_slot: bool, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.worker.spawn_helper(self.id, in_build_slot, f)
    }

    pub fn spawn_build(&mut self, job: BuildJob, in_build_slot: bool) -> Pending<BuildOutcome> {
        self.worker.spawn_build(self.id, job, in_build_slot)
    }

    /// The goal has collected its child's result.
    pub fn child_terminated(&mut self) {
        self.worker.child_terminated(self.id, true);
    }

    pub fn kill_child(&mut self) {
        self.worker.kill_child(self.id);
    }

    pub fn log_sink(&self) -> LogSink {
        LogSink::new(self.id, self.worker.events_tx.clone())
    }

    pub fn nr_local_builds(&self) -> usize {
        self.worker.nr_local_builds
    }

    pub fn substitution_slot_available(&self) -> bool {
        self.worker.nr_substitutions < self.worker.settings.max_substitution_jobs
    }

    /// Offer a build to the hook. `None` if there is no hook or it asked
    /// not to be bothered again.
    pub fn offer_to_hook(&mut self, request: &BuildRequest) -> Option<HookReply> {
        if !self.worker.try_build_hook {
            return None;
        }
        let reply = self.worker.hook.as_mut()?.offer(request);
        if matches!(reply, HookReply::DeclinePermanently) {
            self.worker.try_build_hook = false;
        }
        Some(reply)
    }

    pub fn stats_mut(&mut self) -> &mut WorkerStats {
        &mut self.worker.stats
    }

    pub fn failures_mut(&mut self) -> &mut FailureFlags {
        &mut self.worker.failures
    }

    pub fn path_contents_good(&mut self, path: &StorePath) -> bool {
        self.worker.path_contents_good(path)
    }

    pub fn mark_contents_good(&mut self, path: &StorePath) {
        self.worker.contents_good.insert(path.clone(), true);
    }
}
