// src/exec/process.rs

//! Local executor running builders as OS processes.

use std::collections::BTreeMap;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::backend::{BuildJob, BuildOutcome, BuildRequest, LocalExecutor, LogSink};
use crate::build_result::FailureStatus;
use crate::errors::Result;
use crate::types::PathInfo;

/// Runs `drv.builder` with `drv.args` and `drv.env`, plus one environment
/// variable per output naming its path.
///
/// Isolation is not this type's concern; it only runs the process and
/// checks that every output path exists afterwards. Outputs must have
/// statically known paths.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        ProcessExecutor
    }
}

impl LocalExecutor for ProcessExecutor {
    fn start_build(&self, request: BuildRequest) -> Result<BuildJob> {
        let mut cmd = Command::new(&request.drv.builder);
        cmd.args(&request.drv.args)
            .env_clear()
            .envs(&request.drv.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (name, out) in &request.drv.outputs {
            let Some(path) = out.path() else {
                return Ok(Box::pin(async move {
                    Ok(BuildOutcome::Failure {
                        status: FailureStatus::InputRejected,
                        message: "floating outputs need a content-addressing executor".into(),
                    })
                }));
            };
            cmd.env(name, path.as_str());
        }

        info!(drv = %request.drv_path, builder = %request.drv.builder, "starting builder process");

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning builder for '{}'", request.drv_path))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let readers = [
            forward_lines(stdout, request.log.clone()),
            forward_lines(stderr, request.log.clone()),
        ];

        Ok(Box::pin(async move {
            let status = child
                .wait()
                .await
                .with_context(|| format!("waiting for builder of '{}'", request.drv_path))?;

            // Every line reaches the log before the outcome does.
            for reader in readers.into_iter().flatten() {
                if let Err(e) = reader.await {
                    debug!(drv = %request.drv_path, error = %e, "log forwarder ended abnormally");
                }
            }

            debug!(drv = %request.drv_path, code = ?status.code(), "builder exited");

            if !status.success() {
                return Ok(BuildOutcome::Failure {
                    status: FailureStatus::PermanentFailure,
                    message: match status.code() {
                        Some(code) => format!("builder exited with code {code}"),
                        None => "builder was killed by a signal".to_string(),
                    },
                });
            }

            let mut outputs = BTreeMap::new();
            for (name, out) in &request.drv.outputs {
                let Some(path) = out.path() else { continue };
                if tokio::fs::metadata(path.as_str()).await.is_err() {
                    return Ok(BuildOutcome::Failure {
                        status: FailureStatus::OutputRejected,
                        message: format!("builder failed to produce output path for output '{name}' at '{path}'"),
                    });
                }
                let mut info = PathInfo::new(path.clone());
                info.deriver = Some(request.drv_path.clone());
                info.ca = out.ca();
                outputs.insert(name.clone(), info);
            }

            Ok(BuildOutcome::Success { outputs })
        }))
    }
}

fn forward_lines<R>(stream: Option<R>, log: LogSink) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stream = stream?;
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log.line(line);
        }
    }))
}
