//! Test: Durability - recorded state survives reopening the SQLite store

use crate::helpers::*;
use chrono::Utc;
use deployline::backend::BackendRegistry;
use deployline::core::{Run, RunStatus, StepStatus};
use deployline::execution::SchedulingStrategy;
use deployline::persistence::{RunJournal, SqliteStore, StateStore};
use deployline::settings::OrchestratorConfig;
use std::sync::Arc;

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state.db");

    let (first, second) = {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open(&path).await.unwrap());
        let harness = Harness::with_store(SchedulingStrategy::Parallel, store);

        let (first, status) = harness.run(spec(RELEASE, &[("tag", "v1")])).await;
        assert_eq!(status, RunStatus::Succeeded);

        harness.backend.fail_permanent("deploy");
        let (second, status) = harness.run(spec(RELEASE, &[("tag", "v2")])).await;
        assert_eq!(status, RunStatus::RolledBack);
        (first, second)
    };

    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open(&path).await.unwrap());
    let harness = Harness::with_store(SchedulingStrategy::Parallel, store);

    let report = harness.manager.status(first).await.unwrap();
    assert_eq!(report.run.status, RunStatus::Succeeded);
    assert_eq!(step_ids(&report.results), vec!["build", "push", "deploy"]);

    let report = harness.manager.status(second).await.unwrap();
    assert_eq!(report.run.status, RunStatus::RolledBack);
    assert_eq!(
        step_ids(&report.results),
        vec!["build", "push", "deploy", "rollback-production"]
    );
    assert_eq!(report.results[2].status, StepStatus::Failed);
    assert_eq!(report.results[3].artifact.as_deref(), Some("registry.local/web:v1"));

    let good = harness.store.last_good("production").await.unwrap().unwrap();
    assert_eq!(good.artifact, "registry.local/web:v1");
    assert_eq!(good.run_id, first);

    let history = harness.manager.history(10).await.unwrap();
    assert_eq!(history.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second, first]);

    // The reopened store still drives rollbacks: the live v1 goes nowhere new
    harness.backend.set_live("production", "registry.local/web:v1");
    let err = harness.manager.rollback("production").await.unwrap_err();
    assert!(matches!(err, deployline::PipelineError::NoGoodArtifact { .. }));
}

#[tokio::test]
async fn test_reopening_store_recovers_crashed_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");

    let crashed = {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open(&path).await.unwrap());
        let harness = Harness::with_store(SchedulingStrategy::Parallel, store.clone());
        let (_, status) = harness.run(spec(RELEASE, &[("tag", "v1")])).await;
        assert_eq!(status, RunStatus::Succeeded);

        // A run whose process died mid-deploy, holding its idempotency key
        let mut run = Run::new(spec(RELEASE, &[("tag", "v2")]), Some("release-2".to_string()));
        run.heartbeat_at = Utc::now() - chrono::Duration::minutes(10);
        store.create_run(&run).await.unwrap();
        run.start();
        store.update_run_status(&run).await.unwrap();

        let mut deploy = run.graph.step("deploy").unwrap().clone();
        deploy.invocation = deploy
            .invocation
            .with_parameter("artifact", "registry.local/web:v2")
            .with_parameter("target", "production");
        RunJournal::new(run.id, store.clone())
            .mark_dispatched(&deploy, 1, &deploy.invocation)
            .await
            .unwrap();
        run.id
    };

    // The new process finds production still on v1
    let backend = MockBackend::new();
    backend.set_live("production", "registry.local/web:v1");
    let manager = OrchestratorConfig::new()
        .with_db_path(&path)
        .open_manager_with(BackendRegistry::new().with_fallback(backend.clone()))
        .await
        .unwrap();

    let report = manager.status(crashed).await.unwrap();
    assert_eq!(report.run.status, RunStatus::RolledBack);
    assert_eq!(
        step_ids(&report.results),
        vec!["deploy", "rollback-production"]
    );
    assert_eq!(report.results[0].status, StepStatus::Failed);
    assert_eq!(report.results[1].artifact.as_deref(), Some("registry.local/web:v1"));
    assert_eq!(backend.calls(ROLLBACK), 1);

    assert!(manager.store().unresolved_dispatches().await.unwrap().is_empty());
    assert!(manager.store().active_runs().await.unwrap().is_empty());
    assert!(manager.store().find_active_by_key("release-2").await.unwrap().is_none());
}
