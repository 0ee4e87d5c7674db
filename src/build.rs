// src/build.rs

//! Entry points for hosts.
//!
//! Each function creates the goals for a request on an existing [`Worker`],
//! runs the worker until they finish and turns the outcome into what the
//! host wants: an error, per-request results, or a single build result.

use std::sync::Arc;

use tracing::{error, info};

use crate::build_result::{BuildResult, FailureStatus, KeyedBuildResult};
use crate::config::ConfigFile;
use crate::derivation::Derivation;
use crate::errors::{RealiserError, Result};
use crate::exec::LocalExecutor;
use crate::goal::{ExitCode, GoalId};
use crate::store::Store;
use crate::substituter::SubstituterRef;
use crate::types::{BuildMode, DerivedPath, OutputsSpec, StorePath};
use crate::worker::Worker;

/// Build a worker from a settings file.
///
/// `available` are the substituters the host can reach; the ones named in
/// the file are used, in the file's order.
pub fn worker_from_config(
    cfg: &ConfigFile,
    store: Arc<dyn Store>,
    executor: Arc<dyn LocalExecutor>,
    available: &[SubstituterRef],
) -> Result<Worker> {
    let substituters = cfg
        .substituters
        .iter()
        .map(|uri| {
            available
                .iter()
                .find(|s| s.uri() == uri.as_str())
                .cloned()
                .ok_or_else(|| RealiserError::ConfigError(format!("substituter '{uri}' is not available")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Worker::new(store, executor, cfg.worker_settings()).with_substituters(substituters))
}

/// Realise every request. Fails if any of them could not be realised.
pub async fn build_paths(worker: &mut Worker, reqs: &[DerivedPath], mode: BuildMode) -> Result<()> {
    let goals: Vec<GoalId> = reqs.iter().map(|req| worker.make_goal(req, mode)).collect();
    worker.run(&goals).await?;

    let mut failed: Vec<(String, String)> = Vec::new();
    for (req, goal) in reqs.iter().zip(&goals) {
        let exit = worker.exit_code(*goal).unwrap_or(ExitCode::Failed);
        if exit == ExitCode::Success {
            continue;
        }
        failed.push((format!("'{req}'"), failure_message(worker, *goal)));
    }

    let exit_status = worker.failing_exit_status();
    match failed.as_slice() {
        [] => Ok(()),
        [(_, msg)] => Err(RealiserError::BuildFailed {
            msg: msg.clone(),
            exit_status,
        }),
        many => {
            for (_, msg) in many {
                error!("{msg}");
            }
            let names: Vec<&str> = many.iter().map(|(name, _)| name.as_str()).collect();
            Err(RealiserError::BuildFailed {
                msg: format!("build of {} failed", names.join(", ")),
                exit_status,
            })
        }
    }
}

/// Realise every request and report each outcome.
///
/// Requests left unfinished because an earlier failure stopped the run are
/// reported as `MiscFailure`.
pub async fn build_paths_with_results(
    worker: &mut Worker,
    reqs: &[DerivedPath],
    mode: BuildMode,
) -> Result<Vec<KeyedBuildResult>> {
    let goals: Vec<GoalId> = reqs.iter().map(|req| worker.make_goal(req, mode)).collect();
    worker.run(&goals).await?;

    Ok(reqs
        .iter()
        .zip(&goals)
        .map(|(req, goal)| KeyedBuildResult {
            path: req.clone(),
            result: goal_result(worker, *goal),
        })
        .collect())
}

/// Build a derivation held in memory. Never fails; problems are reported in
/// the result.
pub async fn build_derivation(
    worker: &mut Worker,
    drv_path: StorePath,
    drv: Derivation,
    mode: BuildMode,
) -> BuildResult {
    let goal = worker.make_basic_derivation_goal(drv_path, drv, OutputsSpec::All, mode);
    if let Err(e) = worker.run(&[goal]).await {
        return BuildResult::failure(FailureStatus::MiscFailure, e.to_string());
    }
    goal_result(worker, goal)
}

/// Make `path` valid, substituting it if needed.
pub async fn ensure_path(worker: &mut Worker, path: &StorePath) -> Result<()> {
    if worker.store().is_valid_path(path) {
        return Ok(());
    }
    let goal = worker.make_path_substitution_goal(path.clone(), false, None);
    worker.run(&[goal]).await?;

    if worker.exit_code(goal) == Some(ExitCode::Success) {
        return Ok(());
    }
    let msg = match worker.goal_error(goal) {
        Some(err) => err.to_string(),
        None => format!("path '{path}' does not exist and cannot be created"),
    };
    Err(RealiserError::BuildFailed {
        msg,
        exit_status: worker.failing_exit_status(),
    })
}

/// Re-fetch `path`; if no substituter can provide it, rebuild its deriver.
pub async fn repair_path(worker: &mut Worker, path: &StorePath) -> Result<()> {
    let goal = worker.make_path_substitution_goal(path.clone(), true, None);
    worker.run(&[goal]).await?;
    if worker.exit_code(goal) == Some(ExitCode::Success) {
        return Ok(());
    }

    let store = Arc::clone(worker.store());
    let deriver = store
        .query_path_info(path)
        .and_then(|info| info.deriver)
        .filter(|d| store.is_valid_path(d));
    let Some(deriver) = deriver else {
        return Err(RealiserError::BuildFailed {
            msg: format!("cannot repair path '{path}'"),
            exit_status: worker.failing_exit_status(),
        });
    };

    info!(%path, %deriver, "repairing path by rebuilding its deriver");
    build_paths(
        worker,
        &[DerivedPath::built(deriver, OutputsSpec::All)],
        BuildMode::Repair,
    )
    .await
}

fn goal_result(worker: &Worker, goal: GoalId) -> BuildResult {
    match worker.goal(goal) {
        Some(common) => common.build_result().clone(),
        None => BuildResult::failure(FailureStatus::MiscFailure, "goal vanished"),
    }
}

fn failure_message(worker: &Worker, goal: GoalId) -> String {
    let Some(common) = worker.goal(goal) else {
        return "goal vanished".to_string();
    };
    if let Some(err) = common.error() {
        return err.to_string();
    }
    common
        .build_result()
        .error_msg
        .clone()
        .unwrap_or_else(|| format!("{} failed", common.name()))
}
