mod common;

use std::error::Error;
use std::sync::Arc;

use realiser::build_result::{BuildStatus, SuccessStatus};
use realiser::derivation::DerivationOutput;
use realiser::goal::{ExitCode, GoalId, GoalKind};
use realiser::store::Store;
use realiser::{
    BuildMode, DerivedPath, DrvOutput, OutputsSpec, SingleDerivedPath, StorePath, SubstituterRef,
    UnkeyedRealisation, Worker, build_paths,
};
use realiser_test_utils::builders::{DerivationBuilder, leaf_info, output_path, store_path};
use realiser_test_utils::fake_substituter::FlakySubstituter;

use crate::common::{Harness, KEY, init_tracing, settings, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn traced_path(worker: &Worker, goal: GoalId) -> Option<StorePath> {
    match worker.goal_kind(goal)? {
        GoalKind::BuildTrace(g) => g.output_info().map(|r| r.out_path.clone()),
        _ => None,
    }
}

fn status(worker: &Worker, goal: GoalId) -> Option<BuildStatus> {
    worker.build_result(goal).map(|r| r.status)
}

#[tokio::test]
async fn valid_static_output_is_found_without_work() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let drv = h.add(&DerivationBuilder::new("bash").output("out").build());
    h.store.add_valid_path(leaf_info(&output_path("bash", "out"), KEY));

    let mut worker = h.worker(settings());
    let goal = worker.make_build_trace_goal(SingleDerivedPath::Opaque(drv), "out".to_string());
    with_timeout(worker.run(&[goal])).await?;

    assert_eq!(traced_path(&worker, goal), Some(output_path("bash", "out")));
    assert_eq!(
        status(&worker, goal),
        Some(BuildStatus::Success(SuccessStatus::AlreadyValid))
    );
    assert!(h.executor.started().is_empty());
    Ok(())
}

#[tokio::test]
async fn recorded_realisation_answers_floating_outputs() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let drv = h.add(&DerivationBuilder::new("ca-tool").floating_output("out").build());
    let built = store_path("ca-tool");
    h.store.add_valid_path(leaf_info(&built, KEY));
    h.store.add_realisation(realiser::Realisation::new(
        DrvOutput::new(drv.clone(), "out"),
        built.clone(),
    ));

    let mut worker = h.worker(settings());
    let goal = worker.make_build_trace_goal(SingleDerivedPath::Opaque(drv), "out".to_string());
    with_timeout(worker.run(&[goal])).await?;

    assert_eq!(traced_path(&worker, goal), Some(built));
    assert!(h.executor.started().is_empty());
    Ok(())
}

#[tokio::test]
async fn realisation_is_fetched_from_a_substituter() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let drv = h.add(&DerivationBuilder::new("fetched").floating_output("out").build());
    let remote_out = store_path("fetched");

    let cache = Arc::new(FlakySubstituter::new("https://cache.example.org"));
    cache.add_realisation(
        DrvOutput::new(drv.clone(), "out"),
        UnkeyedRealisation::new(remote_out.clone()),
    );
    cache.add_path(leaf_info(&remote_out, KEY));

    let mut worker = h.worker_with(settings(), vec![cache.clone() as SubstituterRef]);
    let goal = worker.make_build_trace_goal(SingleDerivedPath::Opaque(drv.clone()), "out".to_string());
    with_timeout(worker.run(&[goal])).await?;

    assert_eq!(traced_path(&worker, goal), Some(remote_out.clone()));
    assert_eq!(
        status(&worker, goal),
        Some(BuildStatus::Success(SuccessStatus::Substituted))
    );
    assert!(h.store.is_valid_path(&remote_out));
    assert_eq!(
        h.store
            .query_realisation(&DrvOutput::new(drv, "out"))
            .map(|r| r.out_path),
        Some(remote_out)
    );
    assert!(h.executor.started().is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_output_is_built() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let drv = h.add(&DerivationBuilder::new("make").output("out").build());

    let mut worker = h.worker(settings());
    let goal = worker.make_build_trace_goal(SingleDerivedPath::Opaque(drv), "out".to_string());
    with_timeout(worker.run(&[goal])).await?;

    assert_eq!(traced_path(&worker, goal), Some(output_path("make", "out")));
    assert_eq!(
        status(&worker, goal),
        Some(BuildStatus::Success(SuccessStatus::Built))
    );
    assert_eq!(h.executor.started_names(), vec!["make"]);
    Ok(())
}

#[tokio::test]
async fn unresolved_derivation_is_resolved_then_traced() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let dep = h.add(&DerivationBuilder::new("gcc").output("out").build());
    let drv = h.add(
        &DerivationBuilder::new("hello-ca")
            .floating_output("out")
            .input_drv(&dep, &["out"])
            .build(),
    );

    let mut worker = h.worker(settings());
    let goal = worker.make_build_trace_goal(SingleDerivedPath::Opaque(drv.clone()), "out".to_string());
    with_timeout(worker.run(&[goal])).await?;

    let path = traced_path(&worker, goal).expect("output traced");
    assert_eq!(worker.exit_code(goal), Some(ExitCode::Success));
    assert_eq!(h.executor.started_names(), vec!["gcc", "hello-ca"]);
    assert_eq!(
        h.store
            .query_realisation(&DrvOutput::new(drv, "out"))
            .map(|r| r.out_path),
        Some(path)
    );
    Ok(())
}

#[tokio::test]
async fn failure_to_build_is_forwarded() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let drv = h.add(&DerivationBuilder::new("doomed").output("out").build());
    h.executor.fail("doomed", "segfault");

    let mut worker = h.worker(settings());
    let goal = worker.make_build_trace_goal(SingleDerivedPath::Opaque(drv), "out".to_string());
    with_timeout(worker.run(&[goal])).await?;

    assert_eq!(worker.exit_code(goal), Some(ExitCode::Failed));
    assert_eq!(traced_path(&worker, goal), None);
    let err = worker.goal_error(goal).expect("error forwarded");
    assert!(err.to_string().contains("segfault"), "{err}");
    Ok(())
}

/// A derivation whose output is itself a derivation.
#[tokio::test]
async fn output_of_a_derivation_producing_a_derivation() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let inner = DerivationBuilder::new("generated").output("out").build();
    let inner_path = h.add(&inner);

    let mut generator = DerivationBuilder::new("generator").build();
    generator.outputs.insert(
        "out".to_string(),
        DerivationOutput::InputAddressed(inner_path.clone()),
    );
    let generator = h.add(&generator);

    let dynamic = SingleDerivedPath::built(SingleDerivedPath::Opaque(generator.clone()), "out");

    let mut worker = h.worker(settings());
    let goal = worker.make_build_trace_goal(dynamic.clone(), "out".to_string());
    with_timeout(worker.run(&[goal])).await?;
    assert_eq!(traced_path(&worker, goal), Some(output_path("generated", "out")));
    assert_eq!(h.executor.started_names(), vec!["generated"]);

    // Realising the same reference through the host entry point reuses it.
    let mut worker = h.worker(settings());
    with_timeout(build_paths(
        &mut worker,
        &[DerivedPath::Built {
            drv_path: dynamic,
            outputs: OutputsSpec::All,
        }],
        BuildMode::Normal,
    ))
    .await?;
    assert_eq!(h.executor.times_started("generated"), 1);
    Ok(())
}
