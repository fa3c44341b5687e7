//! Test: Rollback - a failed deploy reverts its target to the last good artifact

use crate::helpers::*;
use deployline::core::{RunStatus, StepKind, StepStatus};
use deployline::error::ErrorClass;
use deployline::execution::SchedulingStrategy;

#[tokio::test]
async fn test_failed_deploy_rolls_back_to_previous_artifact() {
    let harness = Harness::new(SchedulingStrategy::Parallel);

    let (_, status) = harness.run(spec(RELEASE, &[("tag", "v1")])).await;
    assert_eq!(status, RunStatus::Succeeded);

    harness.backend.fail_transient("deploy", 3);
    let (run_id, status) = harness.run(spec(RELEASE, &[("tag", "v2")])).await;
    assert_eq!(status, RunStatus::RolledBack);

    let results = harness.results(run_id).await;
    assert_eq!(
        step_ids(&results),
        vec!["build", "push", "deploy", "rollback-production"]
    );

    let deploy = &results[2];
    assert_eq!(deploy.status, StepStatus::Failed);
    assert_eq!(deploy.attempts, 3);
    assert_eq!(deploy.error.as_ref().map(|e| e.class), Some(ErrorClass::Transient));

    let rollback = &results[3];
    assert_eq!(rollback.kind, StepKind::Rollback);
    assert_eq!(rollback.status, StepStatus::Succeeded);
    assert_eq!(rollback.artifact.as_deref(), Some("registry.local/web:v1"));
    assert_eq!(
        rollback.invocation.command_line(),
        "kubectl set image deploy/web web=registry.local/web:v1"
    );

    assert_eq!(harness.backend.live("production").as_deref(), Some("registry.local/web:v1"));
    assert_eq!(harness.backend.calls(ROLLBACK), 1);

    // Rollbacks do not count as new good deploys
    let history = harness.store.good_history("production").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].artifact, "registry.local/web:v1");

    let report = harness.manager.status(run_id).await.unwrap();
    assert!(report.run.rollback_error.is_none());
}

#[tokio::test]
async fn test_failed_deploy_without_history_fails_run() {
    let harness = Harness::new(SchedulingStrategy::Parallel);
    harness.backend.fail_permanent("deploy");

    let (run_id, status) = harness.run(spec(RELEASE, &[("tag", "v1")])).await;
    assert_eq!(status, RunStatus::Failed);

    let results = harness.results(run_id).await;
    assert_eq!(
        step_ids(&results),
        vec!["build", "push", "deploy", "rollback-production"]
    );

    let rollback = &results[3];
    assert_eq!(rollback.status, StepStatus::Failed);
    assert_eq!(rollback.attempts, 0);
    assert_eq!(
        rollback.error.as_ref().map(|e| e.class),
        Some(ErrorClass::NoGoodArtifact)
    );

    assert_eq!(harness.backend.live("production"), None);
    assert_eq!(harness.backend.calls(ROLLBACK), 0);

    let report = harness.manager.status(run_id).await.unwrap();
    let reason = report.run.rollback_error.unwrap();
    assert!(reason.contains("no good artifact"), "unexpected reason: {}", reason);
}

#[tokio::test]
async fn test_failed_rollback_is_recorded_on_the_run() {
    let harness = Harness::new(SchedulingStrategy::Sequential);

    let (_, status) = harness.run(spec(RELEASE, &[("tag", "v1")])).await;
    assert_eq!(status, RunStatus::Succeeded);

    harness.backend.fail_permanent("deploy");
    harness.backend.fail_permanent(ROLLBACK);
    let (run_id, status) = harness.run(spec(RELEASE, &[("tag", "v2")])).await;
    assert_eq!(status, RunStatus::Failed);

    let results = harness.results(run_id).await;
    assert_eq!(results.len(), 4);
    assert_eq!(results[3].status, StepStatus::Failed);
    assert_eq!(results[3].error.as_ref().map(|e| e.class), Some(ErrorClass::Permanent));

    let report = harness.manager.status(run_id).await.unwrap();
    assert!(report.run.rollback_error.is_some());
    assert_eq!(harness.backend.live("production").as_deref(), Some("registry.local/web:v1"));
}

#[tokio::test]
async fn test_non_deploy_failure_does_not_roll_back() {
    let harness = Harness::new(SchedulingStrategy::Sequential);

    let (_, status) = harness.run(spec(RELEASE, &[("tag", "v1")])).await;
    assert_eq!(status, RunStatus::Succeeded);

    harness.backend.fail_permanent("push");
    let (run_id, status) = harness.run(spec(RELEASE, &[("tag", "v2")])).await;
    assert_eq!(status, RunStatus::Failed);

    assert_eq!(step_ids(&harness.results(run_id).await), vec!["build", "push"]);
    assert_eq!(harness.backend.calls(ROLLBACK), 0);
    assert_eq!(harness.backend.live("production").as_deref(), Some("registry.local/web:v1"));
}

#[tokio::test]
async fn test_failed_redeploy_of_live_artifact_rolls_back_to_it() {
    let harness = Harness::new(SchedulingStrategy::Sequential);

    let (_, status) = harness.run(spec(RELEASE, &[("tag", "v1")])).await;
    assert_eq!(status, RunStatus::Succeeded);

    // Same artifact again, but the cluster rejects it this time
    harness.backend.fail_permanent("deploy");
    let (run_id, status) = harness.run(spec(RELEASE, &[("tag", "v1")])).await;
    assert_eq!(status, RunStatus::RolledBack);

    let results = harness.results(run_id).await;
    assert_eq!(
        step_ids(&results),
        vec!["build", "push", "deploy", "rollback-production"]
    );
    assert_eq!(results[3].status, StepStatus::Succeeded);
    assert_eq!(results[3].artifact.as_deref(), Some("registry.local/web:v1"));
    assert_eq!(harness.backend.calls(ROLLBACK), 1);
    assert_eq!(harness.backend.live("production").as_deref(), Some("registry.local/web:v1"));

    let report = harness.manager.status(run_id).await.unwrap();
    assert!(report.run.rollback_error.is_none());
}
