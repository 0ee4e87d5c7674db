#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use realiser::build_result::FailureStatus;
use realiser::errors::{RealiserError, Result};
use realiser::exec::{BuildJob, BuildOutcome, BuildRequest, LocalExecutor};
use realiser::types::{PathInfo, StorePath};

use crate::builders::fake_hash;

/// How the fake builder behaves for one derivation, selected by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeBuild {
    Succeed,
    Fail(FailureStatus, String),
    /// Never finishes; only a timeout or cancellation ends it.
    Hang,
    /// Refuse to start, as if the inputs were unacceptable.
    Reject(String),
    /// Produce a different path than the derivation declares.
    WrongPath,
    /// Produce different contents on every build.
    Nondeterministic,
}

/// A `LocalExecutor` that never runs anything.
///
/// It records every build it starts, emits the configured log lines, waits
/// `delay`, and reports outputs with deterministic paths: the declared path
/// for input-addressed and fixed outputs, and one derived from the
/// derivation path for floating outputs.
#[derive(Debug, Clone, Default)]
pub struct FakeExecutor {
    state: Arc<Mutex<State>>,
    delay: Duration,
}

#[derive(Debug, Default)]
struct State {
    behaviours: BTreeMap<String, FakeBuild>,
    log_lines: BTreeMap<String, Vec<String>>,
    started: Vec<StorePath>,
    inputs_seen: BTreeMap<StorePath, BTreeSet<StorePath>>,
    running: usize,
    max_running: usize,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the behaviour for derivations named `drv_name`.
    pub fn behave(&self, drv_name: &str, behaviour: FakeBuild) -> &Self {
        self.state()
            .behaviours
            .insert(drv_name.to_string(), behaviour);
        self
    }

    pub fn fail(&self, drv_name: &str, message: &str) -> &Self {
        self.behave(
            drv_name,
            FakeBuild::Fail(FailureStatus::PermanentFailure, message.to_string()),
        )
    }

    /// Lines the builder of `drv_name` prints before finishing.
    pub fn log_lines(&self, drv_name: &str, lines: &[&str]) -> &Self {
        self.state().log_lines.insert(
            drv_name.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
        self
    }

    /// Derivation paths in the order their builds were started.
    pub fn started(&self) -> Vec<StorePath> {
        self.state().started.clone()
    }

    /// Names of the derivations built, in start order.
    pub fn started_names(&self) -> Vec<String> {
        self.state()
            .started
            .iter()
            .map(|p| p.name().trim_end_matches(".drv").to_string())
            .collect()
    }

    pub fn times_started(&self, drv_name: &str) -> usize {
        self.started_names()
            .iter()
            .filter(|n| n.as_str() == drv_name)
            .count()
    }

    /// Input closure handed to the most recent build of `drv_path`.
    pub fn inputs_of(&self, drv_path: &StorePath) -> Option<BTreeSet<StorePath>> {
        self.state().inputs_seen.get(drv_path).cloned()
    }

    pub fn max_concurrent(&self) -> usize {
        self.state().max_running
    }

    pub fn running(&self) -> usize {
        self.state().running
    }

    fn behaviour_for(&self, request: &BuildRequest) -> FakeBuild {
        self.state()
            .behaviours
            .get(&request.drv.name)
            .cloned()
            .unwrap_or(FakeBuild::Succeed)
    }
}

/// Decrements the running count when a build ends or is dropped.
struct RunningGuard(Arc<Mutex<State>>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        state.running = state.running.saturating_sub(1);
    }
}

impl LocalExecutor for FakeExecutor {
    fn start_build(&self, request: BuildRequest) -> Result<BuildJob> {
        let behaviour = self.behaviour_for(&request);
        if let FakeBuild::Reject(msg) = &behaviour {
            return Err(RealiserError::build(msg.clone()));
        }

        let (lines, build_no) = {
            let mut state = self.state();
            state.started.push(request.drv_path.clone());
            state
                .inputs_seen
                .insert(request.drv_path.clone(), request.input_paths.clone());
            state.running += 1;
            state.max_running = state.max_running.max(state.running);
            let lines = state
                .log_lines
                .get(&request.drv.name)
                .cloned()
                .unwrap_or_default();
            (lines, state.started.len())
        };

        let guard = RunningGuard(Arc::clone(&self.state));
        let delay = self.delay;

        Ok(Box::pin(async move {
            let _guard = guard;
            for line in lines {
                request.log.line(line);
            }
            if behaviour == FakeBuild::Hang {
                std::future::pending::<()>().await;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if let FakeBuild::Fail(status, message) = &behaviour {
                return Ok(BuildOutcome::Failure {
                    status: *status,
                    message: message.clone(),
                });
            }

            let outputs = request
                .drv
                .outputs
                .iter()
                .map(|(name, out)| {
                    let path = match (out.path(), &behaviour) {
                        (Some(_), FakeBuild::WrongPath) | (None, _) => floating_path(&request.drv_path, name),
                        (Some(path), _) => path.clone(),
                    };
                    let mut info = PathInfo::new(path.clone());
                    info.references = request.drv.input_srcs.clone();
                    info.nar_size = 4096;
                    let seed = if behaviour == FakeBuild::Nondeterministic {
                        format!("{path}#{build_no}")
                    } else {
                        path.to_string()
                    };
                    info.nar_hash = Some(format!("sha256:{}", fake_hash(&seed)));
                    if out.path().is_none() {
                        info.ca = Some(format!("fixed:r:sha256:{}", fake_hash(path.as_str())));
                    }
                    (name.clone(), info)
                })
                .collect();

            Ok(BuildOutcome::Success { outputs })
        }))
    }
}

/// Where the fake builder puts a floating output of `drv_path`.
pub fn floating_path(drv_path: &StorePath, output: &str) -> StorePath {
    let name = drv_path.name().trim_end_matches(".drv");
    let name = if output == "out" {
        name.to_string()
    } else {
        format!("{name}-{output}")
    };
    StorePath::from_hash_and_name(&fake_hash(&format!("{drv_path}!{output}")), &name)
}
