mod common;

use std::collections::BTreeSet;
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use realiser::config::ConfigFile;
use realiser::store::Store;
use realiser::{
    BuildMode, DerivedPath, OutputsSpec, RealiserError, SubstituterRef, build_paths, ensure_path,
    repair_path, worker_from_config,
};
use realiser_test_utils::builders::{DerivationBuilder, PathInfoBuilder, leaf_info, output_path, store_path};
use realiser_test_utils::fake_hook::{Scripted, ScriptedHook};
use realiser_test_utils::fake_substituter::FlakySubstituter;

use crate::common::{Harness, KEY, init_tracing, settings, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn all(drv: &realiser::StorePath) -> DerivedPath {
    DerivedPath::built(drv.clone(), OutputsSpec::All)
}

#[tokio::test]
async fn accepted_builds_run_on_the_hook() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let drv = h.add(&DerivationBuilder::new("hello").output("out").build());

    let hook = ScriptedHook::new([Scripted::Accept]);
    let remote = hook.remote();
    let offers = hook.offers();
    let mut worker = h.worker(settings()).with_build_hook(Box::new(hook));
    with_timeout(build_paths(&mut worker, &[all(&drv)], BuildMode::Normal)).await?;

    assert!(h.executor.started().is_empty());
    assert_eq!(remote.started_names(), vec!["hello"]);
    assert_eq!(offers.lock().map(|o| o.len()).unwrap_or_default(), 1);
    assert!(h.store.is_valid_path(&output_path("hello", "out")));
    Ok(())
}

#[tokio::test]
async fn postponed_build_is_offered_again() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let drv = h.add(&DerivationBuilder::new("busy").output("out").build());

    let hook = ScriptedHook::new([Scripted::Postpone, Scripted::Accept]);
    let remote = hook.remote();
    let offers = hook.offers();
    let mut worker = h.worker(settings()).with_build_hook(Box::new(hook));
    with_timeout(build_paths(&mut worker, &[all(&drv)], BuildMode::Normal)).await?;

    let offered = offers.lock().map(|o| o.clone()).unwrap_or_default();
    assert_eq!(offered, vec![drv.clone(), drv]);
    assert_eq!(remote.started_names(), vec!["busy"]);
    assert!(h.executor.started().is_empty());
    Ok(())
}

#[tokio::test]
async fn permanently_declining_hook_is_not_asked_again() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let lib = h.add(&DerivationBuilder::new("lib").output("out").build());
    let app = h.add(
        &DerivationBuilder::new("app")
            .output("out")
            .input_drv(&lib, &["out"])
            .build(),
    );

    let hook = ScriptedHook::new([Scripted::DeclinePermanently, Scripted::Accept]);
    let offers = hook.offers();
    let mut worker = h.worker(settings()).with_build_hook(Box::new(hook));
    with_timeout(build_paths(&mut worker, &[all(&app)], BuildMode::Normal)).await?;

    assert_eq!(offers.lock().map(|o| o.clone()).unwrap_or_default(), vec![lib]);
    assert_eq!(h.executor.started_names(), vec!["lib", "app"]);
    Ok(())
}

#[tokio::test]
async fn local_preference_skips_the_hook() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let drv = h.add(
        &DerivationBuilder::new("tiny-script")
            .output("out")
            .prefer_local_build()
            .build(),
    );

    let hook = ScriptedHook::new([Scripted::Accept]);
    let offers = hook.offers();
    let mut worker = h.worker(settings()).with_build_hook(Box::new(hook));
    with_timeout(build_paths(&mut worker, &[all(&drv)], BuildMode::Normal)).await?;

    assert!(offers.lock().map(|o| o.is_empty()).unwrap_or_default());
    assert_eq!(h.executor.started_names(), vec!["tiny-script"]);
    Ok(())
}

#[tokio::test]
async fn hook_can_build_with_no_local_slots() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let drv = h.add(&DerivationBuilder::new("offloaded").output("out").build());

    let hook = ScriptedHook::new([Scripted::Accept]);
    let remote = hook.remote();
    let mut cfg = settings();
    cfg.max_jobs = 0;
    let mut worker = h.worker(cfg).with_build_hook(Box::new(hook));
    with_timeout(build_paths(&mut worker, &[all(&drv)], BuildMode::Normal)).await?;

    assert_eq!(remote.started_names(), vec!["offloaded"]);
    Ok(())
}

#[tokio::test]
async fn ensure_path_reports_a_missing_substitute() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let path = store_path("nowhere-1.0");

    let mut worker = h.worker(settings());
    let err = with_timeout(ensure_path(&mut worker, &path))
        .await
        .expect_err("nothing can provide the path");

    let msg = err.to_string();
    assert!(msg.contains(&format!("path '{path}' is required")), "{msg}");
    assert!(msg.contains("there is no substituter"), "{msg}");
    match err {
        RealiserError::BuildFailed { exit_status, .. } => assert_eq!(exit_status, 1),
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn ensure_path_accepts_valid_paths_without_a_run() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let path = store_path("present");
    h.store.add_valid_path(leaf_info(&path, KEY));

    let mut worker = h.worker(settings());
    with_timeout(ensure_path(&mut worker, &path)).await?;
    assert_eq!(worker.live_goal_count(), 0);
    Ok(())
}

#[tokio::test]
async fn repair_rebuilds_the_deriver_when_no_substitute_exists() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let drv = h.add(&DerivationBuilder::new("fragile").output("out").build());
    let out = output_path("fragile", "out");
    h.store
        .add_valid_path(PathInfoBuilder::new(&out).deriver(&drv).build());
    h.store.mark_corrupt(&out);

    let mut worker = h.worker(settings());
    with_timeout(repair_path(&mut worker, &out)).await?;

    assert_eq!(h.executor.started_names(), vec!["fragile"]);
    assert!(h.store.verify_path_contents(&out));
    Ok(())
}

#[tokio::test]
async fn repair_without_substitute_or_deriver_fails() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let out = store_path("orphan");
    h.store.add_valid_path(leaf_info(&out, KEY));
    h.store.mark_corrupt(&out);

    let mut worker = h.worker(settings());
    let err = with_timeout(repair_path(&mut worker, &out))
        .await
        .expect_err("nothing can repair the path");
    assert!(err.to_string().contains("cannot repair path"), "{err}");
    Ok(())
}

#[tokio::test]
async fn configured_substituters_are_used_in_file_order() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let path = store_path("from-config");

    let first = Arc::new(FlakySubstituter::new("https://first.example.org"));
    let second = Arc::new(FlakySubstituter::new("https://second.example.org"));
    let unused = Arc::new(FlakySubstituter::new("https://unused.example.org"));
    first.add_path(leaf_info(&path, KEY));
    second.add_path(leaf_info(&path, KEY));
    unused.add_path(leaf_info(&path, KEY));
    let available = vec![
        unused.clone() as SubstituterRef,
        second.clone() as SubstituterRef,
        first.clone() as SubstituterRef,
    ];

    let cfg: ConfigFile = toml::from_str::<realiser::config::RawConfigFile>(&format!(
        r#"
        [substitution]
        substituters = ["https://first.example.org", "https://second.example.org"]
        trusted_public_keys = ["{KEY}"]
        "#
    ))?
    .try_into()?;

    let store: Arc<dyn Store> = h.store.clone();
    let mut worker = worker_from_config(&cfg, store, Arc::new(h.executor.clone()), &available)?;
    with_timeout(ensure_path(&mut worker, &path)).await?;

    assert_eq!(first.copies(), 1);
    assert_eq!(second.queries(), 0);
    assert_eq!(unused.queries(), 0);
    Ok(())
}

#[tokio::test]
async fn unknown_configured_substituter_is_rejected() -> TestResult {
    let h = Harness::new();
    let cfg: ConfigFile = toml::from_str::<realiser::config::RawConfigFile>(
        r#"
        [substitution]
        substituters = ["https://gone.example.org"]
        "#,
    )?
    .try_into()?;

    let store: Arc<dyn Store> = h.store.clone();
    let err = worker_from_config(&cfg, store, Arc::new(h.executor.clone()), &[])
        .expect_err("the substituter is not available");
    assert!(
        err.to_string()
            .contains("substituter 'https://gone.example.org' is not available"),
        "{err}"
    );
    Ok(())
}

#[tokio::test]
async fn locked_outputs_wait_for_the_other_builder() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let drv = h.add(&DerivationBuilder::new("contended").output("out").build());
    let lock = h
        .store
        .lock_externally(BTreeSet::from([output_path("contended", "out")]))
        .ok_or("lock already held")?;

    let released = Instant::now();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(lock);
    });

    let mut worker = h.worker(settings());
    with_timeout(build_paths(&mut worker, &[all(&drv)], BuildMode::Normal)).await?;

    assert!(released.elapsed() >= Duration::from_millis(100));
    assert_eq!(h.executor.times_started("contended"), 1);
    Ok(())
}
