//! Test: Ordering - steps start only after their prerequisites finished

use crate::helpers::*;
use deployline::core::{RunStatus, StepResult};
use deployline::execution::SchedulingStrategy;
use std::collections::HashMap;
use std::time::Duration;

const DIAMOND: &str = r#"
name: "diamond"
defaults:
  retry:
    max_attempts: 1
steps:
  - id: "build"
    kind: build
    command: "build"
    parameters: { name: "build", produces: "web:1" }
  - id: "lint"
    kind: verify
    command: "lint"
    parameters: { name: "lint" }
  - id: "push"
    kind: push
    depends_on: ["build"]
    command: "push {{ steps.build.artifact }}"
    parameters: { name: "push", produces: "{{ steps.build.artifact }}" }
  - id: "provision"
    kind: provision
    depends_on: ["build"]
    command: "terraform apply"
    parameters: { name: "provision" }
  - id: "deploy"
    kind: deploy
    depends_on: ["push", "provision"]
    target: "staging"
    command: "deploy {{ artifact }}"
    parameters: { name: "deploy", artifact: "{{ steps.push.artifact }}" }
"#;

fn assert_prerequisites_finished_first(results: &[StepResult], deps: &[(&str, &[&str])]) {
    let by_id: HashMap<&str, &StepResult> = results.iter().map(|r| (r.step_id.as_str(), r)).collect();
    for (step, prerequisites) in deps {
        let started = by_id[step].started_at;
        for prerequisite in *prerequisites {
            let finished = by_id[prerequisite].finished_at;
            assert!(
                started >= finished,
                "{} started at {} before {} finished at {}",
                step,
                started,
                prerequisite,
                finished
            );
        }
    }
}

const EDGES: &[(&str, &[&str])] = &[
    ("push", &["build"]),
    ("provision", &["build"]),
    ("deploy", &["push", "provision"]),
];

#[tokio::test]
async fn test_parallel_run_respects_prerequisites() {
    let harness = Harness::new(SchedulingStrategy::Parallel);
    for name in ["build", "lint", "push", "provision", "deploy"] {
        harness.backend.delay(name, Duration::from_millis(200));
    }

    let (run_id, status) = harness.run(spec(DIAMOND, &[])).await;
    assert_eq!(status, RunStatus::Succeeded);

    let results = harness.results(run_id).await;
    assert_eq!(results.len(), 5);
    assert_prerequisites_finished_first(&results, EDGES);

    // Independent steps overlap
    let by_id: HashMap<&str, &StepResult> = results.iter().map(|r| (r.step_id.as_str(), r)).collect();
    assert!(by_id["lint"].started_at < by_id["build"].finished_at);
    assert!(by_id["push"].started_at < by_id["provision"].finished_at);
    assert!(by_id["provision"].started_at < by_id["push"].finished_at);

    assert_eq!(harness.backend.live("staging").as_deref(), Some("web:1"));
}

#[tokio::test]
async fn test_sequential_run_follows_declaration_order() {
    let harness = Harness::new(SchedulingStrategy::Sequential);

    let (run_id, status) = harness.run(spec(DIAMOND, &[])).await;
    assert_eq!(status, RunStatus::Succeeded);

    let results = harness.results(run_id).await;
    assert_eq!(
        step_ids(&results),
        vec!["build", "lint", "push", "provision", "deploy"]
    );
    assert_prerequisites_finished_first(&results, EDGES);
    for pair in results.windows(2) {
        assert!(pair[1].started_at >= pair[0].finished_at);
    }
}

#[tokio::test]
async fn test_limited_parallelism_caps_in_flight_steps() {
    let harness = Harness::new(SchedulingStrategy::LimitedParallel(1));
    for name in ["build", "lint"] {
        harness.backend.delay(name, Duration::from_millis(100));
    }

    let (run_id, status) = harness.run(spec(DIAMOND, &[])).await;
    assert_eq!(status, RunStatus::Succeeded);

    let results = harness.results(run_id).await;
    for pair in results.windows(2) {
        assert!(pair[1].started_at >= pair[0].finished_at);
    }
}
