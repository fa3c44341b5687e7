//! Test: Success Chain - build, push and deploy run in order

use crate::helpers::*;
use deployline::core::{RunStatus, StepKind, StepStatus};
use deployline::execution::SchedulingStrategy;

#[tokio::test]
async fn test_success_chain() {
    let harness = Harness::new(SchedulingStrategy::Parallel);

    let (run_id, status) = harness.run(spec(RELEASE, &[("tag", "v1")])).await;
    assert_eq!(status, RunStatus::Succeeded);

    let results = harness.results(run_id).await;
    assert_eq!(step_ids(&results), vec!["build", "push", "deploy"]);
    assert!(results.iter().all(|r| r.status == StepStatus::Succeeded));
    assert!(results.iter().all(|r| r.attempts == 1));

    // Artifacts flow from prerequisite to dependent
    assert_eq!(results[0].artifact.as_deref(), Some("registry.local/web:v1"));
    assert_eq!(
        results[1].invocation.command_line(),
        "docker push registry.local/web:v1"
    );
    assert_eq!(results[2].kind, StepKind::Deploy);
    assert_eq!(
        results[2].invocation.command_line(),
        "kubectl set image deploy/web web=registry.local/web:v1"
    );
    assert_eq!(results[2].artifact.as_deref(), Some("registry.local/web:v1"));

    assert_eq!(harness.backend.live("production").as_deref(), Some("registry.local/web:v1"));

    let good = harness.store.last_good("production").await.unwrap().unwrap();
    assert_eq!(good.artifact, "registry.local/web:v1");
    assert_eq!(good.run_id, run_id);

    let report = harness.manager.status(run_id).await.unwrap();
    assert_eq!(report.run.status, RunStatus::Succeeded);
    assert!(report.run.finished_at.is_some());
    assert!(report.run.rollback_error.is_none());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let harness = Harness::new(SchedulingStrategy::Sequential);
    harness.backend.fail_transient("push", 2);

    let (run_id, status) = harness.run(spec(RELEASE, &[("tag", "v1")])).await;
    assert_eq!(status, RunStatus::Succeeded);

    let results = harness.results(run_id).await;
    assert_eq!(step_ids(&results), vec!["build", "push", "deploy"]);
    assert_eq!(results[1].attempts, 3);
    assert_eq!(harness.backend.calls("push"), 3);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let harness = Harness::new(SchedulingStrategy::Sequential);
    harness.backend.fail_permanent("build");

    let (run_id, status) = harness.run(spec(RELEASE, &[("tag", "v1")])).await;
    assert_eq!(status, RunStatus::Failed);

    let results = harness.results(run_id).await;
    assert_eq!(step_ids(&results), vec!["build"]);
    assert_eq!(results[0].attempts, 1);
    assert_eq!(harness.backend.calls("push"), 0);
    assert_eq!(harness.backend.calls(ROLLBACK), 0);
}
