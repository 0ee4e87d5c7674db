// src/worker/children.rs

//! Children: builds and helper tasks owned by goals.
//!
//! A child reports back over the worker's event channel: output lines while
//! it runs and exactly one `Eof` when it is done. Its result travels
//! separately over a oneshot which the owning goal polls once woken.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::AbortHandle;
use tracing::trace;

use super::Worker;
use crate::errors::{RealiserError, Result};
use crate::exec::{BuildJob, BuildOutcome};
use crate::goal::{GoalId, JobCategory};

/// Activity reported by a child.
#[derive(Debug)]
pub(crate) enum ChildEvent {
    Output { goal: GoalId, line: String },
    Eof { goal: GoalId, serial: u64 },
}

#[derive(Debug)]
pub(crate) struct Child {
    pub goal: GoalId,
    pub serial: u64,
    pub category: JobCategory,
    /// Counted against the admission limit of `category`.
    pub in_build_slot: bool,
    /// Subject to `max_silent_time` and `build_timeout`.
    pub respect_timeouts: bool,
    pub time_started: Instant,
    pub last_output: Instant,
    pub eof: bool,
    pub abort: AbortHandle,
}

/// Completion of a child, polled by its goal.
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// `None` while the child is still running.
    pub fn poll(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(RealiserError::Helper(
                "child exited without reporting a result".to_string(),
            ))),
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pending")
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "helper panicked".to_string()
    }
}

impl Worker {
    /// Run blocking work (substituter IO) on a helper thread owned by `goal`.
    pub(crate) fn spawn_helper<T, F>(&mut self, goal: GoalId, in_build_slot: bool, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let events = self.events_tx.clone();
        let serial = self.next_child_serial();
        let handle = tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|payload| Err(RealiserError::Helper(panic_message(&*payload))));
            let _ = tx.send(result);
            let _ = events.send(ChildEvent::Eof { goal, serial });
        });
        self.child_started(goal, serial, in_build_slot, false, handle.abort_handle());
        Pending { rx }
    }

    /// Drive a build job owned by `goal`. Builds respect timeouts.
    pub(crate) fn spawn_build(
        &mut self,
        goal: GoalId,
        job: BuildJob,
        in_build_slot: bool,
    ) -> Pending<BuildOutcome> {
        let (tx, rx) = oneshot::channel();
        let events = self.events_tx.clone();
        let serial = self.next_child_serial();
        let handle = tokio::spawn(async move {
            let result = job.await;
            let _ = tx.send(result);
            let _ = events.send(ChildEvent::Eof { goal, serial });
        });
        self.child_started(goal, serial, in_build_slot, true, handle.abort_handle());
        Pending { rx }
    }

    fn next_child_serial(&mut self) -> u64 {
        self.child_serial += 1;
        self.child_serial
    }

    fn child_started(
        &mut self,
        goal: GoalId,
        serial: u64,
        in_build_slot: bool,
        respect_timeouts: bool,
        abort: AbortHandle,
    ) {
        let category = self
            .goals
            .get(goal)
            .map(|slot| slot.common.category)
            .unwrap_or(JobCategory::Administration);
        let now = Instant::now();
        self.children.push(Child {
            goal,
            serial,
            category,
            in_build_slot,
            respect_timeouts,
            time_started: now,
            last_output: now,
            eof: false,
            abort,
        });
        if in_build_slot {
            match category {
                JobCategory::Substitution => self.nr_substitutions += 1,
                JobCategory::Build => self.nr_local_builds += 1,
                JobCategory::Administration => {}
            }
        }
    }

    /// Forget `goal`'s child and give back its slot.
    pub(crate) fn child_terminated(&mut self, goal: GoalId, wake_sleepers: bool) {
        let Some(pos) = self.children.iter().position(|c| c.goal == goal) else {
            return;
        };
        let child = self.children.remove(pos);
        if child.in_build_slot {
            match child.category {
                JobCategory::Substitution => {
                    self.nr_substitutions = self.nr_substitutions.saturating_sub(1)
                }
                JobCategory::Build => self.nr_local_builds = self.nr_local_builds.saturating_sub(1),
                JobCategory::Administration => {}
            }
        }

        if wake_sleepers {
            for waiting in std::mem::take(&mut self.wanting_to_build) {
                self.wake_up(waiting);
            }
        }
    }

    pub(crate) fn kill_child(&mut self, goal: GoalId) {
        if let Some(child) = self.children.iter().find(|c| c.goal == goal) {
            trace!(%goal, "killing child");
            child.abort.abort();
        }
        self.child_terminated(goal, true);
    }

    pub(crate) fn has_child(&self, goal: GoalId) -> bool {
        self.children.iter().any(|c| c.goal == goal)
    }

    pub(crate) fn slot_available(&self, category: JobCategory) -> bool {
        match category {
            JobCategory::Substitution => {
                self.nr_substitutions < self.settings.max_substitution_jobs
            }
            JobCategory::Build => self.nr_local_builds < self.settings.max_jobs,
            JobCategory::Administration => true,
        }
    }

    pub(crate) fn wait_for_build_slot(&mut self, goal: GoalId) {
        let category = match self.goals.get(goal) {
            Some(slot) => slot.common.category,
            None => return,
        };
        if self.slot_available(category) {
            self.wake_up(goal);
        } else {
            self.wanting_to_build.insert(goal);
        }
    }

    pub(crate) fn handle_child_event(&mut self, event: ChildEvent) {
        match event {
            ChildEvent::Output { goal, line } => {
                if let Some(child) = self.children.iter_mut().find(|c| c.goal == goal) {
                    child.last_output = Instant::now();
                }
                if let Some(kind) = self.goals.get_mut(goal).and_then(|s| s.kind.as_mut()) {
                    kind.handle_child_output(&line);
                }
            }
            ChildEvent::Eof { goal, serial } => {
                let Some(child) = self
                    .children
                    .iter_mut()
                    .find(|c| c.goal == goal && c.serial == serial)
                else {
                    // Already reaped by its goal.
                    return;
                };
                child.eof = true;
                if self.goals.contains(goal) {
                    self.wake_up(goal);
                } else {
                    self.child_terminated(goal, true);
                }
            }
        }
    }

    /// Abort every child, e.g. when the run is cancelled or the worker dropped.
    pub(crate) fn kill_all_children(&mut self) {
        for child in self.children.drain(..) {
            child.abort.abort();
        }
        self.nr_local_builds = 0;
        self.nr_substitutions = 0;
    }
}
