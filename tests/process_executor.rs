#![cfg(unix)]

mod common;

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use realiser::build_result::FailureStatus;
use realiser::exec::{BuildRequest, LogSink};
use realiser::store::Store;
use realiser::{
    BuildMode, BuildOutcome, Derivation, DerivationOutput, DerivedPath, LocalExecutor, MemoryStore,
    OutputsSpec, ProcessExecutor, RealiserError, StorePath, Worker, build_paths,
};
use tempfile::TempDir;

use crate::common::{init_tracing, settings, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

/// A `/bin/sh -c script` derivation with one output under `dir`.
fn shell_drv(name: &str, script: &str, dir: &Path) -> Derivation {
    let mut drv = Derivation::new(name, "/bin/sh");
    drv.args = vec!["-c".to_string(), script.to_string()];
    let out = dir.join(format!("{name}-out"));
    drv.outputs.insert(
        "out".to_string(),
        DerivationOutput::InputAddressed(StorePath::new(out.to_string_lossy())),
    );
    drv
}

fn request(drv: Derivation) -> BuildRequest {
    BuildRequest {
        drv_path: drv.store_path(),
        drv,
        input_paths: Default::default(),
        mode: BuildMode::Normal,
        log: LogSink::discard(),
    }
}

#[tokio::test]
async fn builder_sees_its_output_path_in_the_environment() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    let drv = shell_drv("touch", r#"echo building; : > "$out""#, dir.path());

    let job = ProcessExecutor::new().start_build(request(drv))?;
    match with_timeout(job).await? {
        BuildOutcome::Success { outputs } => {
            let info = outputs.get("out").ok_or("no info for 'out'")?;
            assert!(Path::new(info.path.as_str()).exists());
        }
        other => panic!("expected success, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn environment_is_cleared_apart_from_the_derivation_env() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    let mut drv = shell_drv(
        "env-check",
        r#"[ -z "$HOME" ] && [ "$GREETING" = hello ] && : > "$out""#,
        dir.path(),
    );
    drv.env.insert("GREETING".to_string(), "hello".to_string());

    let job = ProcessExecutor::new().start_build(request(drv))?;
    assert!(matches!(with_timeout(job).await?, BuildOutcome::Success { .. }));
    Ok(())
}

#[tokio::test]
async fn non_zero_exit_is_a_permanent_failure() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    let drv = shell_drv("exit-3", "echo oops >&2; exit 3", dir.path());

    let job = ProcessExecutor::new().start_build(request(drv))?;
    assert_eq!(
        with_timeout(job).await?,
        BuildOutcome::Failure {
            status: FailureStatus::PermanentFailure,
            message: "builder exited with code 3".to_string(),
        }
    );
    Ok(())
}

#[tokio::test]
async fn missing_output_is_rejected() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    let drv = shell_drv("lazy", "true", dir.path());

    let job = ProcessExecutor::new().start_build(request(drv))?;
    match with_timeout(job).await? {
        BuildOutcome::Failure { status, message } => {
            assert_eq!(status, FailureStatus::OutputRejected);
            assert!(message.contains("output 'out'"), "{message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn floating_outputs_are_refused() -> TestResult {
    init_tracing();
    let mut drv = Derivation::new("floating", "/bin/sh");
    drv.outputs
        .insert("out".to_string(), DerivationOutput::Floating);

    let job = ProcessExecutor::new().start_build(request(drv))?;
    match with_timeout(job).await? {
        BuildOutcome::Failure { status, .. } => assert_eq!(status, FailureStatus::InputRejected),
        other => panic!("expected failure, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn worker_registers_outputs_of_real_builders() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    let store = Arc::new(MemoryStore::new());
    let ok = store.add_derivation(&shell_drv("good", r#": > "$out""#, dir.path()));
    let bad = store.add_derivation(&shell_drv("bad", "exit 7", dir.path()));

    let mut cfg = settings();
    cfg.keep_going = true;
    let dyn_store: Arc<dyn Store> = store.clone();
    let mut worker = Worker::new(dyn_store, Arc::new(ProcessExecutor::new()), cfg);

    let err = with_timeout(build_paths(
        &mut worker,
        &[
            DerivedPath::built(ok, OutputsSpec::All),
            DerivedPath::built(bad, OutputsSpec::All),
        ],
        BuildMode::Normal,
    ))
    .await
    .expect_err("one builder fails");

    match err {
        RealiserError::BuildFailed { msg, exit_status } => {
            assert!(msg.contains("builder exited with code 7"), "{msg}");
            assert_eq!(exit_status, 0x64);
        }
        other => panic!("expected BuildFailed, got {other:?}"),
    }
    let good_out = StorePath::new(dir.path().join("good-out").to_string_lossy());
    assert!(store.is_valid_path(&good_out));
    Ok(())
}

#[tokio::test]
async fn failure_message_carries_the_last_lines_of_output() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    let store = Arc::new(MemoryStore::new());
    let drv = store.add_derivation(&shell_drv(
        "noisy",
        "echo first; echo last-line >&2; exit 3",
        dir.path(),
    ));

    let dyn_store: Arc<dyn Store> = store.clone();
    let mut worker = Worker::new(dyn_store, Arc::new(ProcessExecutor::new()), settings());
    let err = with_timeout(build_paths(
        &mut worker,
        &[DerivedPath::built(drv, OutputsSpec::All)],
        BuildMode::Normal,
    ))
    .await
    .expect_err("the builder fails");

    let msg = err.to_string();
    assert!(msg.contains("builder exited with code 3"), "{msg}");
    assert!(msg.contains("last 2 log lines:"), "{msg}");
    assert!(msg.contains("> first"), "{msg}");
    assert!(msg.contains("> last-line"), "{msg}");
    Ok(())
}
