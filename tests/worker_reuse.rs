mod common;

use std::error::Error;
use std::sync::Arc;

use realiser::build_result::{BuildStatus, FailureStatus, SuccessStatus};
use realiser::goal::ExitCode;
use realiser::store::Store;
use realiser::{
    BuildMode, DerivedPath, OutputsSpec, SubstituterRef, build_paths, build_paths_with_results,
    repair_path,
};
use realiser_test_utils::builders::{DerivationBuilder, leaf_info, output_path, store_path};
use realiser_test_utils::fake_executor::FakeBuild;
use realiser_test_utils::fake_substituter::FlakySubstituter;

use crate::common::{Harness, KEY, init_tracing, settings, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn all(drv: &realiser::StorePath) -> DerivedPath {
    DerivedPath::built(drv.clone(), OutputsSpec::All)
}

#[tokio::test]
async fn goals_cancelled_by_a_failure_are_built_on_the_next_run() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let bad = h.add(&DerivationBuilder::new("bad").output("out").build());
    let slow = h.add(&DerivationBuilder::new("slow").output("out").build());
    h.executor.fail("bad", "boom");
    h.executor.behave("slow", FakeBuild::Hang);

    let mut cfg = settings();
    cfg.max_jobs = 2;
    let mut worker = h.worker(cfg);
    let results = with_timeout(build_paths_with_results(
        &mut worker,
        &[all(&bad), all(&slow)],
        BuildMode::Normal,
    ))
    .await?;
    assert_eq!(
        results[0].result.failure_status(),
        Some(FailureStatus::PermanentFailure)
    );
    assert_eq!(results[1].result.error_msg.as_deref(), Some("cancelled"));

    let attempts = h.executor.times_started("slow");
    h.executor.behave("slow", FakeBuild::Succeed);
    with_timeout(build_paths(&mut worker, &[all(&slow)], BuildMode::Normal)).await?;

    assert!(h.store.is_valid_path(&output_path("slow", "out")));
    assert_eq!(h.executor.times_started("slow"), attempts + 1);
    assert_eq!(h.executor.times_started("bad"), 1);
    Ok(())
}

#[tokio::test]
async fn every_goal_is_finished_when_a_run_returns() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let bad = h.add(&DerivationBuilder::new("bad").output("out").build());
    let slow = h.add(&DerivationBuilder::new("slow").output("out").build());
    h.executor.fail("bad", "boom");
    h.executor.behave("slow", FakeBuild::Hang);

    let mut cfg = settings();
    cfg.max_jobs = 2;
    let mut worker = h.worker(cfg);
    let slow_goal = worker.make_derivation_goal(slow, OutputsSpec::All, BuildMode::Normal);
    let bad_goal = worker.make_derivation_goal(bad, OutputsSpec::All, BuildMode::Normal);
    with_timeout(worker.run(&[bad_goal, slow_goal])).await?;

    assert_eq!(worker.exit_code(bad_goal), Some(ExitCode::Failed));
    assert_eq!(worker.exit_code(slow_goal), Some(ExitCode::Failed));
    let msg = worker
        .goal_error(slow_goal)
        .map(|e| e.to_string())
        .unwrap_or_default();
    assert!(msg.contains("was cancelled"), "{msg}");
    Ok(())
}

#[tokio::test]
async fn path_missing_on_one_run_is_accepted_once_valid() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let path = store_path("late-arrival");
    let req = DerivedPath::Opaque(path.clone());

    let mut worker = h.worker(settings());
    let err = with_timeout(build_paths(&mut worker, &[req.clone()], BuildMode::Normal))
        .await
        .expect_err("nothing provides the path yet");
    assert!(err.to_string().contains("there is no substituter"), "{err}");

    h.store.add_valid_path(leaf_info(&path, KEY));
    let results =
        with_timeout(build_paths_with_results(&mut worker, &[req], BuildMode::Normal)).await?;
    assert_eq!(
        results[0].result.status,
        BuildStatus::Success(SuccessStatus::AlreadyValid)
    );
    Ok(())
}

#[tokio::test]
async fn repair_is_retried_on_a_later_run() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let path = store_path("bitrot");
    h.store.add_valid_path(leaf_info(&path, KEY));
    h.store.mark_corrupt(&path);

    let cache = Arc::new(FlakySubstituter::new("https://cache.example.org"));
    let mut worker = h.worker_with(settings(), vec![cache.clone() as SubstituterRef]);
    let err = with_timeout(repair_path(&mut worker, &path))
        .await
        .expect_err("the cache does not have the path yet");
    assert!(err.to_string().contains("cannot repair path"), "{err}");

    cache.add_path(leaf_info(&path, KEY));
    with_timeout(repair_path(&mut worker, &path)).await?;

    assert_eq!(cache.copies(), 1);
    assert!(h.store.verify_path_contents(&path));
    Ok(())
}

#[tokio::test]
async fn results_stay_readable_until_the_next_run() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let first = store_path("first");
    let second = store_path("second");
    h.store.add_valid_path(leaf_info(&first, KEY));
    h.store.add_valid_path(leaf_info(&second, KEY));

    let mut worker = h.worker(settings());
    let goal = worker.make_path_substitution_goal(first, false, None);
    with_timeout(worker.run(&[goal])).await?;
    assert_eq!(worker.exit_code(goal), Some(ExitCode::Success));

    let next = worker.make_path_substitution_goal(second, false, None);
    assert_ne!(next, goal);
    with_timeout(worker.run(&[next])).await?;

    assert_eq!(worker.exit_code(goal), None);
    assert_eq!(worker.exit_code(next), Some(ExitCode::Success));
    assert_eq!(worker.live_goal_count(), 1);
    Ok(())
}
