//! Test utilities for deployline scenarios

use async_trait::async_trait;
use deployline::backend::{Backend, BackendError, BackendOutcome, BackendRegistry, Verification};
use deployline::core::config::PipelineConfig;
use deployline::core::{Invocation, RunSpec, RunStatus, StepKind, StepResult};
use deployline::execution::{PipelineEngine, RunManager, SchedulingStrategy, Triggered};
use deployline::persistence::{InMemoryStore, StateStore};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Script key shared by every rollback invocation
pub const ROLLBACK: &str = "rollback";

/// Mock backend standing in for builders, registries and clusters
///
/// Invocations are identified by their `name` parameter (rollbacks by
/// [`ROLLBACK`]). Scripted errors are consumed first; after that every call
/// succeeds. A successful deploy or rollback updates the live artifact of
/// its target, and build/push steps report their `produces` parameter as
/// the artifact.
#[derive(Default)]
pub struct MockBackend {
    scripts: Mutex<HashMap<String, VecDeque<BackendError>>>,
    delays: Mutex<HashMap<String, Duration>>,
    live: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<(String, StepKind)>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next calls for `name` with the given errors
    pub fn fail_with(&self, name: &str, errors: Vec<BackendError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn fail_transient(&self, name: &str, times: usize) {
        self.fail_with(
            name,
            (0..times)
                .map(|i| BackendError::Transient(format!("{} unavailable ({})", name, i + 1)))
                .collect(),
        );
    }

    pub fn fail_permanent(&self, name: &str) {
        self.fail_with(name, vec![BackendError::Permanent(format!("{} rejected", name))]);
    }

    /// Make every call for `name` take at least `delay`
    pub fn delay(&self, name: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(name.to_string(), delay);
    }

    /// Artifact currently running on a target
    pub fn live(&self, target: &str) -> Option<String> {
        self.live.lock().unwrap().get(target).cloned()
    }

    pub fn set_live(&self, target: &str, artifact: &str) {
        self.live
            .lock()
            .unwrap()
            .insert(target.to_string(), artifact.to_string());
    }

    /// Number of calls made for `name`
    pub fn calls(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .count()
    }

    fn key(invocation: &Invocation) -> String {
        if invocation.kind == StepKind::Rollback {
            ROLLBACK.to_string()
        } else {
            invocation.parameter("name").unwrap_or_default().to_string()
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn execute(&self, invocation: &Invocation) -> Result<BackendOutcome, BackendError> {
        let key = Self::key(invocation);
        self.calls.lock().unwrap().push((key.clone(), invocation.kind));

        let delay = self.delays.lock().unwrap().get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|script| script.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }

        if invocation.kind.touches_target() {
            if let (Some(target), Some(artifact)) =
                (invocation.parameter("target"), invocation.parameter("artifact"))
            {
                self.set_live(target, artifact);
            }
            return Ok(BackendOutcome::new(format!("deployed {}", invocation.command_line())));
        }

        let outcome = BackendOutcome::new(format!("ran {}", invocation.command_line()));
        Ok(match invocation.parameter("produces") {
            Some(artifact) => outcome.with_artifact(artifact),
            None => outcome,
        })
    }

    async fn verify(&self, invocation: &Invocation) -> Result<Verification, BackendError> {
        if !invocation.kind.touches_target() {
            return Ok(Verification::Unknown);
        }
        let target = invocation.parameter("target").unwrap_or_default();
        let wanted = invocation.parameter("artifact").unwrap_or_default();
        match self.live(target) {
            Some(live) if live == wanted => Ok(Verification::Succeeded(
                BackendOutcome::new("already live").with_artifact(live),
            )),
            Some(live) => Ok(Verification::Failed(format!("{} is running {}", target, live))),
            None => Ok(Verification::Failed(format!("{} has nothing deployed", target))),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Orchestrator wired to a mock backend and an in-memory store
pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub store: Arc<dyn StateStore>,
    pub manager: RunManager,
}

impl Harness {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self::with_store(strategy, Arc::new(InMemoryStore::new()))
    }

    pub fn with_store(strategy: SchedulingStrategy, store: Arc<dyn StateStore>) -> Self {
        let backend = MockBackend::new();
        let registry = Arc::new(BackendRegistry::new().with_fallback(backend.clone()));
        let engine = PipelineEngine::new(registry.clone(), store.clone(), strategy)
            .with_abort_poll(Duration::from_millis(20));
        let manager = RunManager::new(engine, registry);
        Self {
            backend,
            store,
            manager,
        }
    }

    /// Trigger and wait for the run to finish
    pub async fn run(&self, spec: RunSpec) -> (Uuid, RunStatus) {
        let triggered = self.manager.trigger(spec, None).await.unwrap();
        let Triggered::Started(run_id) = triggered else {
            panic!("expected a new run, got {:?}", triggered);
        };
        let status = self.manager.wait(run_id).await.unwrap();
        (run_id, status)
    }

    pub async fn results(&self, run_id: Uuid) -> Vec<StepResult> {
        self.store.results_for_run(run_id).await.unwrap()
    }
}

/// Build a run spec from YAML with extra variables
pub fn spec(yaml: &str, vars: &[(&str, &str)]) -> RunSpec {
    let mut spec = PipelineConfig::from_yaml(yaml).unwrap().to_run_spec().unwrap();
    for (k, v) in vars {
        spec.variables.insert(k.to_string(), v.to_string());
    }
    spec
}

/// build -> push -> deploy(production) for image tag `{{ tag }}`
pub const RELEASE: &str = r#"
name: "web-release"
variables:
  image: "registry.local/web"
defaults:
  timeout_secs: 30
  retry:
    max_attempts: 3
    backoff_base_secs: 0.01
steps:
  - id: "build"
    kind: build
    command: "docker build -t {{ image }}:{{ tag }} ."
    parameters:
      name: "build"
      produces: "{{ image }}:{{ tag }}"
  - id: "push"
    kind: push
    depends_on: ["build"]
    command: "docker push {{ steps.build.artifact }}"
    parameters:
      name: "push"
      produces: "{{ steps.build.artifact }}"
  - id: "deploy"
    kind: deploy
    depends_on: ["push"]
    target: "production"
    command: "kubectl set image deploy/web web={{ artifact }}"
    parameters:
      name: "deploy"
      artifact: "{{ steps.push.artifact }}"
"#;

pub fn step_ids(results: &[StepResult]) -> Vec<&str> {
    results.iter().map(|r| r.step_id.as_str()).collect()
}
