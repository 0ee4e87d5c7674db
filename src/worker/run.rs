// src/worker/run.rs

//! The run loop.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, info, warn};

use super::{FailureFlags, GoalCx, Worker};
use crate::build_result::{BuildResult, FailureStatus};
use crate::errors::{RealiserError, Result};
use crate::goal::{ExitCode, GoalId, GoalKind, Step, WaitOn};

impl Worker {
    /// Run until every goal in `top_goals` has finished, or a top-level
    /// failure stops the run when `keep_going` is off.
    ///
    /// Goal failures are not errors of the run; read them from the goals.
    /// An `Err` means the scheduler itself cannot make progress. Either way
    /// every goal is terminal afterwards: goals the run did not finish are
    /// failed as cancelled. Results stay readable until the next run.
    pub async fn run(&mut self, top_goals: &[GoalId]) -> Result<()> {
        self.begin_run(top_goals);
        for &goal in top_goals {
            if self.goals.contains(goal) && self.top_goals.insert(goal) {
                self.retain(goal);
            }
        }
        info!(goals = top_goals.len(), "starting goal run");

        let result = self.run_until_done().await;
        self.finish_run();
        debug!(stats = ?self.stats, "goal run finished");
        result
    }

    /// Forget the goals of earlier runs, except those requested again.
    fn begin_run(&mut self, top_goals: &[GoalId]) {
        let keep: BTreeSet<GoalId> = top_goals.iter().copied().collect();
        let run_no = self.run_no;
        let stale: Vec<GoalId> = self
            .goals
            .iter()
            .filter(|(id, slot)| slot.common.run < run_no && !keep.contains(id))
            .map(|(id, _)| id)
            .collect();
        if !stale.is_empty() {
            debug!(goals = stale.len(), "dropping goals of earlier runs");
        }
        for id in stale {
            self.goals.remove(id);
        }
        self.top_goals.retain(|id| keep.contains(id));

        self.cancelled = false;
        self.failures = FailureFlags::default();
        self.contents_good.clear();
        self.try_build_hook = self.hook.is_some();
    }

    /// Fail whatever the run left unfinished and close the run.
    fn finish_run(&mut self) {
        self.kill_all_children();
        self.awake.clear();
        self.wanting_to_build.clear();
        self.waiting_for_any_goal.clear();
        self.waiting_for_a_while.clear();
        self.last_woken_up = None;

        let unfinished: Vec<GoalId> = self
            .goals
            .iter()
            .filter(|(_, slot)| !slot.common.exit_code.is_terminal())
            .map(|(id, _)| id)
            .collect();
        for id in unfinished {
            let Some(slot) = self.goals.get_mut(id) else {
                continue;
            };
            debug!(goal = %slot.common.key, "cancelling unfinished goal");
            let msg = format!("{} was cancelled", slot.common.name);
            slot.common.exit_code = ExitCode::Failed;
            slot.common.waitees.clear();
            slot.common.waiters.clear();
            slot.common.build_result = BuildResult::failure(FailureStatus::MiscFailure, "cancelled");
            slot.common.error = Some(Arc::new(RealiserError::build(msg)));
        }
        self.run_no += 1;
    }

    async fn run_until_done(&mut self) -> Result<()> {
        loop {
            self.run_awake_goals();

            if self.cancelled || self.top_goals_finished() {
                break;
            }

            if !self.children.is_empty() || !self.waiting_for_a_while.is_empty() {
                self.wait_for_input().await;
            } else if self.awake.is_empty() {
                if self.settings.max_jobs == 0 && !self.wanting_to_build.is_empty() {
                    return Err(RealiserError::ConfigError(
                        "unable to start any build; either increase 'max_jobs' or enable remote builds"
                            .to_string(),
                    ));
                }
                return Err(self.stall_error());
            }
        }
        Ok(())
    }

    fn top_goals_finished(&self) -> bool {
        self.top_goals.iter().all(|id| {
            self.goals
                .get(*id)
                .is_none_or(|slot| slot.common.exit_code.is_terminal())
        })
    }

    /// Step awake goals, lowest key first, until none are awake.
    fn run_awake_goals(&mut self) {
        while !self.awake.is_empty() && !self.cancelled {
            let mut batch: Vec<(String, GoalId)> = std::mem::take(&mut self.awake)
                .into_iter()
                .filter_map(|id| self.goals.get(id).map(|slot| (slot.common.key.clone(), id)))
                .collect();
            batch.sort();

            for (_, id) in batch {
                if self.cancelled {
                    break;
                }
                self.step_goal(id);
            }
        }
    }

    fn step_goal(&mut self, id: GoalId) {
        let Some(slot) = self.goals.get_mut(id) else {
            return;
        };
        // Only resumed once every waitee is done.
        if slot.common.exit_code.is_terminal() || !slot.common.waitees.is_empty() {
            return;
        }
        let Some(mut kind) = slot.kind.take() else {
            return;
        };

        let result = kind.work(&mut GoalCx::new(id, self));
        self.finish_step(id, kind, result);
    }

    fn finish_step(&mut self, id: GoalId, kind: GoalKind, result: Result<Step>) {
        let Some(slot) = self.goals.get_mut(id) else {
            return;
        };
        slot.kind = Some(kind);

        match result {
            Ok(Step::Suspend(on)) => self.suspend(id, on),
            Ok(Step::Done(exit, error)) => self.am_done(id, exit, error),
            Err(err) => {
                if slot.common.build_result.is_success() || slot.common.build_result.error_msg.is_none() {
                    slot.common.build_result =
                        BuildResult::failure(FailureStatus::MiscFailure, err.to_string());
                }
                self.am_done(id, ExitCode::Failed, Some(Arc::new(err)));
            }
        }
    }

    fn suspend(&mut self, id: GoalId, on: WaitOn) {
        match on {
            WaitOn::Waitees => {
                let idle = self
                    .goals
                    .get(id)
                    .is_some_and(|slot| slot.common.waitees.is_empty());
                if idle {
                    self.wake_up(id);
                }
            }
            WaitOn::Child => {
                if !self.has_child(id) {
                    self.wake_up(id);
                }
            }
            WaitOn::BuildSlot => self.wait_for_build_slot(id),
            WaitOn::AnyGoal => {
                self.waiting_for_any_goal.insert(id);
            }
            WaitOn::AWhile => {
                self.waiting_for_a_while.insert(id);
            }
        }
    }

    /// Block until a child reports, a timeout expires or pollers are due.
    async fn wait_for_input(&mut self) {
        let before = Instant::now();
        let mut deadline: Option<Instant> = None;
        let mut earliest = |t: Instant| {
            deadline = Some(deadline.map_or(t, |d| d.min(t)));
        };

        for child in self.children.iter().filter(|c| c.respect_timeouts && !c.eof) {
            if let Some(limit) = self.settings.max_silent_time {
                earliest(child.last_output + limit);
            }
            if let Some(limit) = self.settings.build_timeout {
                earliest(child.time_started + limit);
            }
        }

        if self.waiting_for_a_while.is_empty() {
            self.last_woken_up = None;
        } else {
            let last = match self.last_woken_up {
                Some(t) if t <= before => t,
                _ => before,
            };
            self.last_woken_up = Some(last);
            earliest(last + self.settings.poll_interval);
        }

        let event = match deadline {
            Some(at) => tokio::time::timeout_at(at.into(), self.events_rx.recv())
                .await
                .ok()
                .flatten(),
            None => self.events_rx.recv().await,
        };
        if let Some(event) = event {
            self.handle_child_event(event);
            while let Ok(event) = self.events_rx.try_recv() {
                self.handle_child_event(event);
            }
        }

        let after = Instant::now();
        self.check_timeouts(after);

        if let Some(last) = self.last_woken_up {
            if !self.waiting_for_a_while.is_empty() && last + self.settings.poll_interval <= after {
                self.last_woken_up = Some(after);
                for goal in std::mem::take(&mut self.waiting_for_a_while) {
                    self.wake_up(goal);
                }
            }
        }
    }

    fn check_timeouts(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for child in self.children.iter().filter(|c| c.respect_timeouts && !c.eof) {
            let name = self
                .goals
                .get(child.goal)
                .map(|slot| slot.common.name.clone())
                .unwrap_or_default();
            if let Some(limit) = self.settings.max_silent_time {
                if now >= child.last_output + limit {
                    expired.push((
                        child.goal,
                        format!("{name} timed out after {} of silence", seconds(limit)),
                    ));
                    continue;
                }
            }
            if let Some(limit) = self.settings.build_timeout {
                if now >= child.time_started + limit {
                    expired.push((child.goal, format!("{name} timed out after {}", seconds(limit))));
                }
            }
        }

        for (goal, msg) in expired {
            warn!(%goal, "{msg}");
            self.goal_timed_out(goal, RealiserError::build(msg));
        }
    }

    fn goal_timed_out(&mut self, id: GoalId, err: RealiserError) {
        let Some(mut kind) = self.goals.get_mut(id).and_then(|slot| slot.kind.take()) else {
            return;
        };
        let step = kind.timed_out(&mut GoalCx::new(id, self), err);
        self.finish_step(id, kind, Ok(step));
    }

    /// Explain why nothing can run although top-level goals are unfinished.
    fn stall_error(&self) -> RealiserError {
        let mut graph: DiGraphMap<GoalId, ()> = DiGraphMap::new();
        for (id, slot) in self.goals.iter() {
            if slot.common.exit_code != ExitCode::Busy {
                continue;
            }
            graph.add_node(id);
            for waitee in &slot.common.waitees {
                graph.add_edge(id, *waitee, ());
            }
        }

        let name = |id: GoalId| {
            self.goals
                .get(id)
                .map(|slot| slot.common.name.clone())
                .unwrap_or_else(|| id.to_string())
        };

        match toposort(&graph, None) {
            Err(cycle) => RealiserError::Deadlock(format!(
                "cycle in goal dependencies involving {}",
                name(cycle.node_id())
            )),
            Ok(order) => {
                let stuck: Vec<String> = order
                    .into_iter()
                    .filter(|id| graph.neighbors(*id).next().is_none())
                    .map(name)
                    .collect();
                RealiserError::Deadlock(format!(
                    "{} goal(s) are busy but none can make progress: {}",
                    stuck.len(),
                    stuck.join(", ")
                ))
            }
        }
    }
}

fn seconds(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{} seconds", d.as_secs())
    } else {
        format!("{:.3} seconds", d.as_secs_f64())
    }
}
