//! Test: Idempotency - one active run per idempotency key

use crate::helpers::*;
use deployline::core::RunStatus;
use deployline::execution::{SchedulingStrategy, Triggered};
use std::time::Duration;

#[tokio::test]
async fn test_same_key_returns_active_run() {
    let harness = Harness::new(SchedulingStrategy::Sequential);
    harness.backend.delay("build", Duration::from_millis(300));

    let first = harness
        .manager
        .trigger(spec(RELEASE, &[("tag", "v1")]), Some("release-1".to_string()))
        .await
        .unwrap();
    let second = harness
        .manager
        .trigger(spec(RELEASE, &[("tag", "v1")]), Some("release-1".to_string()))
        .await
        .unwrap();

    assert!(matches!(first, Triggered::Started(_)));
    assert_eq!(second, Triggered::Existing(first.run_id()));

    // A different key is a different run
    let other = harness
        .manager
        .trigger(spec(RELEASE, &[("tag", "v1")]), Some("release-2".to_string()))
        .await
        .unwrap();
    assert!(matches!(other, Triggered::Started(id) if id != first.run_id()));

    assert_eq!(harness.manager.wait(first.run_id()).await.unwrap(), RunStatus::Succeeded);
    assert_eq!(harness.manager.wait(other.run_id()).await.unwrap(), RunStatus::Succeeded);
    assert_eq!(harness.backend.calls("build"), 2);

    // Once the run finished the key may start a new one
    let again = harness
        .manager
        .trigger(spec(RELEASE, &[("tag", "v1")]), Some("release-1".to_string()))
        .await
        .unwrap();
    assert!(matches!(again, Triggered::Started(id) if id != first.run_id()));
    assert_eq!(harness.manager.wait(again.run_id()).await.unwrap(), RunStatus::Succeeded);
}

#[tokio::test]
async fn test_key_of_run_recorded_by_another_process() {
    let harness = Harness::new(SchedulingStrategy::Sequential);

    // A run left active in the store by some other orchestrator
    let foreign = deployline::core::Run::new(spec(RELEASE, &[("tag", "v1")]), Some("shared".to_string()));
    harness.store.create_run(&foreign).await.unwrap();

    let triggered = harness
        .manager
        .trigger(spec(RELEASE, &[("tag", "v1")]), Some("shared".to_string()))
        .await
        .unwrap();
    assert_eq!(triggered, Triggered::Existing(foreign.id));
    assert_eq!(harness.backend.calls("build"), 0);
}

#[tokio::test]
async fn test_runs_without_key_are_never_deduplicated() {
    let harness = Harness::new(SchedulingStrategy::Sequential);
    harness.backend.delay("build", Duration::from_millis(100));

    let first = harness.manager.trigger(spec(RELEASE, &[("tag", "v1")]), None).await.unwrap();
    let second = harness.manager.trigger(spec(RELEASE, &[("tag", "v1")]), None).await.unwrap();
    assert_ne!(first.run_id(), second.run_id());

    harness.manager.wait(first.run_id()).await.unwrap();
    harness.manager.wait(second.run_id()).await.unwrap();
    assert_eq!(harness.manager.history(10).await.unwrap().len(), 2);
}
