//! Test: Reconciliation - resolving steps left in flight by a dead process

use crate::helpers::*;
use deployline::core::{Run, RunStatus, Step, StepKind, StepStatus};
use deployline::error::ErrorClass;
use deployline::execution::{SchedulingStrategy, Triggered};
use deployline::persistence::RunJournal;
use chrono::Utc;
use std::time::Duration;

/// A run some earlier process started and never finished
async fn stale_run(harness: &Harness, key: Option<&str>) -> (Run, RunJournal) {
    let mut run = Run::new(spec(RELEASE, &[("tag", "v3")]), key.map(str::to_string));
    run.heartbeat_at = Utc::now() - chrono::Duration::hours(1);
    harness.store.create_run(&run).await.unwrap();
    run.start();
    harness.store.update_run_status(&run).await.unwrap();
    let journal = RunJournal::new(run.id, harness.store.clone());
    (run, journal)
}

fn deploy_step(run: &Run, target: &str) -> Step {
    let mut step = run.graph.step("deploy").unwrap().clone();
    step.target = Some(target.to_string());
    step.invocation = step
        .invocation
        .with_parameter("artifact", "registry.local/web:v3")
        .with_parameter("target", target);
    step
}

#[tokio::test]
async fn test_reconcile_resolves_dispatch_markers() {
    let harness = Harness::new(SchedulingStrategy::Parallel);

    // Deploy that actually went through before the crash
    let (landed, journal) = stale_run(&harness, None).await;
    let step = deploy_step(&landed, "production");
    journal.mark_dispatched(&step, 1, &step.invocation).await.unwrap();
    harness.backend.set_live("production", "registry.local/web:v3");

    // Deploy the backend knows did not happen
    let (missed, journal) = stale_run(&harness, None).await;
    let step = deploy_step(&missed, "staging");
    journal.mark_dispatched(&step, 1, &step.invocation).await.unwrap();

    // Push whose outcome nobody can tell; only the latest attempt counts
    let (unknown, journal) = stale_run(&harness, Some("release-3")).await;
    let push = unknown.graph.step("push").unwrap().clone();
    journal.mark_dispatched(&push, 1, &push.invocation).await.unwrap();
    journal.mark_dispatched(&push, 2, &push.invocation).await.unwrap();

    // The stale run still holds its idempotency key
    let blocked = harness
        .manager
        .trigger(spec(RELEASE, &[("tag", "v3")]), Some("release-3".to_string()))
        .await
        .unwrap();
    assert_eq!(blocked, Triggered::Existing(unknown.id));

    let report = harness.manager.reconcile().await.unwrap();
    assert_eq!(report.verified, 1);
    assert_eq!(report.interrupted, 2);
    assert_eq!(report.failed_runs.len(), 3);
    for run in [&landed, &missed, &unknown] {
        assert!(report.failed_runs.contains(&run.id));
    }

    let results = harness.results(landed.id).await;
    assert_eq!(step_ids(&results), vec!["deploy"]);
    assert_eq!(results[0].status, StepStatus::Succeeded);
    assert_eq!(results[0].artifact.as_deref(), Some("registry.local/web:v3"));
    let good = harness.store.last_good("production").await.unwrap().unwrap();
    assert_eq!(good.artifact, "registry.local/web:v3");

    // Staging never had a good deploy, so there is nothing to roll back to
    let results = harness.results(missed.id).await;
    assert_eq!(step_ids(&results), vec!["deploy", "rollback-staging"]);
    assert_eq!(results[0].status, StepStatus::Failed);
    assert_eq!(results[0].error.as_ref().map(|e| e.class), Some(ErrorClass::Permanent));
    assert_eq!(results[1].error.as_ref().map(|e| e.class), Some(ErrorClass::NoGoodArtifact));
    let missed_run = harness.manager.status(missed.id).await.unwrap().run;
    assert!(missed_run.rollback_error.is_some());

    let results = harness.results(unknown.id).await;
    assert_eq!(step_ids(&results), vec!["push"]);
    assert_eq!(results[0].attempts, 2);
    assert_eq!(results[0].error.as_ref().map(|e| e.class), Some(ErrorClass::Interrupted));

    assert!(harness.store.unresolved_dispatches().await.unwrap().is_empty());
    assert!(harness.store.active_runs().await.unwrap().is_empty());
    for run in [&landed, &missed, &unknown] {
        let status = harness.manager.status(run.id).await.unwrap().run.status;
        assert_eq!(status, RunStatus::Failed);
    }

    // The key is free again
    let retried = harness
        .manager
        .trigger(spec(RELEASE, &[("tag", "v3")]), Some("release-3".to_string()))
        .await
        .unwrap();
    assert!(matches!(retried, Triggered::Started(_)));
    assert_eq!(harness.manager.wait(retried.run_id()).await.unwrap(), RunStatus::Succeeded);

    // A second pass has nothing left to do
    let report = harness.manager.reconcile().await.unwrap();
    assert_eq!(report.verified + report.interrupted, 0);
    assert!(report.failed_runs.is_empty());
}

#[tokio::test]
async fn test_reconcile_leaves_local_runs_alone() {
    let harness = Harness::new(SchedulingStrategy::Sequential);
    harness.backend.delay("build", Duration::from_millis(300));

    let run_id = harness
        .manager
        .trigger(spec(RELEASE, &[("tag", "v1")]), None)
        .await
        .unwrap()
        .run_id();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = harness.manager.reconcile().await.unwrap();
    assert_eq!(report.verified + report.interrupted, 0);
    assert!(report.failed_runs.is_empty());

    assert_eq!(harness.manager.wait(run_id).await.unwrap(), RunStatus::Succeeded);
    assert_eq!(harness.results(run_id).await.len(), 3);
}

#[tokio::test]
async fn test_reconcile_rolls_back_failed_deploy_of_dead_run() {
    let harness = Harness::new(SchedulingStrategy::Sequential);

    let (_, status) = harness.run(spec(RELEASE, &[("tag", "v1")])).await;
    assert_eq!(status, RunStatus::Succeeded);

    // The process died while rolling out v3; production still runs v1
    let (dead, journal) = stale_run(&harness, None).await;
    let step = deploy_step(&dead, "production");
    journal.mark_dispatched(&step, 1, &step.invocation).await.unwrap();

    let report = harness.manager.reconcile().await.unwrap();
    assert_eq!(report.interrupted, 1);
    assert_eq!(report.rolled_back, vec![dead.id]);
    assert!(report.failed_runs.is_empty());

    let status = harness.manager.status(dead.id).await.unwrap();
    assert_eq!(status.run.status, RunStatus::RolledBack);
    assert!(status.run.rollback_error.is_none());
    assert_eq!(step_ids(&status.results), vec!["deploy", "rollback-production"]);
    assert_eq!(status.results[1].kind, StepKind::Rollback);
    assert_eq!(status.results[1].status, StepStatus::Succeeded);
    assert_eq!(status.results[1].artifact.as_deref(), Some("registry.local/web:v1"));

    assert_eq!(harness.backend.calls(ROLLBACK), 1);
    assert_eq!(harness.backend.live("production").as_deref(), Some("registry.local/web:v1"));
}

#[tokio::test]
async fn test_reconcile_leaves_runs_of_live_processes_alone() {
    let harness = Harness::new(SchedulingStrategy::Parallel);

    // Another process is executing this run and keeps its heartbeat fresh
    let mut run = Run::new(spec(RELEASE, &[("tag", "v4")]), Some("release-4".to_string()));
    harness.store.create_run(&run).await.unwrap();
    run.start();
    harness.store.update_run_status(&run).await.unwrap();
    let journal = RunJournal::new(run.id, harness.store.clone());
    let build = run.graph.step("build").unwrap().clone();
    journal.mark_dispatched(&build, 1, &build.invocation).await.unwrap();

    let report = harness.manager.reconcile().await.unwrap();
    assert!(report.is_empty());
    assert_eq!(harness.store.unresolved_dispatches().await.unwrap().len(), 1);
    assert_eq!(
        harness.manager.status(run.id).await.unwrap().run.status,
        RunStatus::Running
    );

    // Once the heartbeat goes quiet the run is taken over
    harness
        .store
        .heartbeat(run.id, Utc::now() - chrono::Duration::minutes(5))
        .await
        .unwrap();
    let report = harness.manager.reconcile().await.unwrap();
    assert_eq!(report.failed_runs, vec![run.id]);
    assert!(harness.store.unresolved_dispatches().await.unwrap().is_empty());
}
