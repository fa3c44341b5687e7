//! Test: Operator rollback - reverting a target outside of a failing run

use crate::helpers::*;
use deployline::core::{RunStatus, StepStatus};
use deployline::execution::SchedulingStrategy;
use deployline::PipelineError;

#[tokio::test]
async fn test_rollback_round_trip() {
    let harness = Harness::new(SchedulingStrategy::Parallel);

    for tag in ["v1", "v2"] {
        let (_, status) = harness.run(spec(RELEASE, &[("tag", tag)])).await;
        assert_eq!(status, RunStatus::Succeeded);
    }
    assert_eq!(harness.backend.live("production").as_deref(), Some("registry.local/web:v2"));

    let report = harness.manager.rollback("production").await.unwrap();
    assert_eq!(report.run.status, RunStatus::RolledBack);
    assert_eq!(report.run.pipeline_name, "rollback:production");
    assert_eq!(step_ids(&report.results), vec!["rollback-production"]);
    assert_eq!(report.results[0].status, StepStatus::Succeeded);
    assert_eq!(harness.backend.live("production").as_deref(), Some("registry.local/web:v1"));

    // Rolling back the rollback returns to where we started
    let report = harness.manager.rollback("production").await.unwrap();
    assert_eq!(report.run.status, RunStatus::RolledBack);
    assert_eq!(harness.backend.live("production").as_deref(), Some("registry.local/web:v2"));

    let history = harness.manager.history(10).await.unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].id, report.run.id);
}

#[tokio::test]
async fn test_rollback_without_history() {
    let harness = Harness::new(SchedulingStrategy::Parallel);

    let err = harness.manager.rollback("production").await.unwrap_err();
    assert!(matches!(err, PipelineError::NoGoodArtifact { ref target } if target == "production"));
    assert_eq!(harness.backend.calls(ROLLBACK), 0);

    // The attempt is still on record
    let history = harness.manager.history(1).await.unwrap();
    assert_eq!(history[0].status, RunStatus::Failed);
    assert!(history[0].rollback_error.is_some());
}

#[tokio::test]
async fn test_single_good_deploy_has_nothing_to_go_back_to() {
    let harness = Harness::new(SchedulingStrategy::Parallel);

    let (_, status) = harness.run(spec(RELEASE, &[("tag", "v1")])).await;
    assert_eq!(status, RunStatus::Succeeded);

    let err = harness.manager.rollback("production").await.unwrap_err();
    assert!(matches!(err, PipelineError::NoGoodArtifact { .. }));
    assert_eq!(harness.backend.live("production").as_deref(), Some("registry.local/web:v1"));
}
