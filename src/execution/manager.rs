//! Run manager - trigger, status, abort, rollback and recovery of runs

use crate::{
    backend::{BackendError, BackendRegistry, Verification},
    core::{
        DependencyGraph, DispatchMarker, Run, RunSpec, RunStatus, Step, StepKind, StepResult,
        StepStatus, ARTIFACT_PARAM,
    },
    error::{ErrorClass, PipelineError, PipelineResult},
    execution::engine::PipelineEngine,
    persistence::{RunJournal, StateStore},
};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A run whose heartbeat is older than this belongs to a dead process
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Outcome of a trigger request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Triggered {
    /// A new run was created and is executing
    Started(Uuid),
    /// A run with the same idempotency key is still active
    Existing(Uuid),
}

impl Triggered {
    pub fn run_id(&self) -> Uuid {
        match self {
            Triggered::Started(id) | Triggered::Existing(id) => *id,
        }
    }
}

/// Durably recorded view of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: Run,
    pub results: Vec<StepResult>,
}

/// What a recovery pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Markers whose outcome the backend confirmed
    pub verified: usize,
    /// Markers recorded as interrupted
    pub interrupted: usize,
    /// Runs moved from running to failed
    pub failed_runs: Vec<Uuid>,
    /// Runs whose failed deploy was rolled back during recovery
    pub rolled_back: Vec<Uuid>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.verified == 0
            && self.interrupted == 0
            && self.failed_runs.is_empty()
            && self.rolled_back.is_empty()
    }
}

struct ActiveRun {
    idempotency_key: Option<String>,
    cancel: CancellationToken,
}

/// Entry point for operators and the CLI
pub struct RunManager {
    engine: Arc<PipelineEngine>,
    store: Arc<dyn StateStore>,
    backends: Arc<BackendRegistry>,
    active: Arc<RwLock<HashMap<Uuid, ActiveRun>>>,
    handles: Mutex<HashMap<Uuid, JoinHandle<PipelineResult<RunStatus>>>>,
    /// Serializes the idempotency check with run creation
    trigger_lock: Mutex<()>,
    stale_after: Duration,
}

impl RunManager {
    pub fn new(engine: PipelineEngine, backends: Arc<BackendRegistry>) -> Self {
        let store = engine.store().clone();
        Self {
            engine: Arc::new(engine),
            store,
            backends,
            active: Arc::new(RwLock::new(HashMap::new())),
            handles: Mutex::new(HashMap::new()),
            trigger_lock: Mutex::new(()),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// How long a run may go without a heartbeat before recovery takes it over
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.stale_after / 3).max(Duration::from_millis(10))
    }

    /// Keep refreshing the run's heartbeat until the guard is dropped
    fn spawn_heartbeat(store: Arc<dyn StateStore>, run_id: Uuid, every: Duration) -> DropGuard {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.heartbeat(run_id, Utc::now()).await {
                            warn!("Could not refresh heartbeat of run {}: {}", run_id, e);
                        }
                    }
                }
            }
        });
        stop.drop_guard()
    }

    pub fn engine(&self) -> &PipelineEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Start a run in the background and return its id immediately
    ///
    /// With an idempotency key, an active run carrying the same key is
    /// returned instead of starting a duplicate.
    pub async fn trigger(&self, spec: RunSpec, idempotency_key: Option<String>) -> PipelineResult<Triggered> {
        let _guard = self.trigger_lock.lock().await;

        if let Some(key) = &idempotency_key {
            let local = self
                .active
                .read()
                .await
                .iter()
                .find(|(_, active)| active.idempotency_key.as_deref() == Some(key.as_str()))
                .map(|(id, _)| *id);
            if let Some(run_id) = local {
                info!("Run {} already active for key {}", run_id, key);
                return Ok(Triggered::Existing(run_id));
            }
            if let Some(run) = self.store.find_active_by_key(key).await? {
                info!("Run {} already active for key {}", run.id, key);
                return Ok(Triggered::Existing(run.id));
            }
        }

        let mut run = Run::new(spec, idempotency_key.clone());
        let run_id = run.id;
        self.store.create_run(&run).await?;

        let cancel = CancellationToken::new();
        self.active.write().await.insert(
            run_id,
            ActiveRun {
                idempotency_key,
                cancel: cancel.clone(),
            },
        );

        let engine = self.engine.clone();
        let active = self.active.clone();
        let store = self.store.clone();
        let every = self.heartbeat_interval();
        let handle = tokio::spawn(async move {
            let _heartbeat = Self::spawn_heartbeat(store, run_id, every);
            let outcome = engine.execute(&mut run, cancel).await;
            active.write().await.remove(&run_id);
            outcome
        });
        self.handles.lock().await.insert(run_id, handle);

        info!("Triggered run {}", run_id);
        Ok(Triggered::Started(run_id))
    }

    /// Wait for a run started by this manager; other runs report their stored status
    pub async fn wait(&self, run_id: Uuid) -> PipelineResult<RunStatus> {
        let handle = self.handles.lock().await.remove(&run_id);
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| PipelineError::persistence(format!("run task failed: {}", e)))?,
            None => self
                .store
                .load_run(run_id)
                .await?
                .map(|run| run.status)
                .ok_or(PipelineError::RunNotFound(run_id)),
        }
    }

    /// Current status and step results, read only from the store
    pub async fn status(&self, run_id: Uuid) -> PipelineResult<RunReport> {
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))?;
        let results = self.store.results_for_run(run_id).await?;
        Ok(RunReport { run, results })
    }

    /// Most recent runs first
    pub async fn history(&self, limit: usize) -> PipelineResult<Vec<Run>> {
        self.store.list_runs(limit).await
    }

    /// Request an abort; returns false when the run already finished
    pub async fn abort(&self, run_id: Uuid) -> PipelineResult<bool> {
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))?;
        if !run.is_active() {
            return Ok(false);
        }

        self.store.request_abort(run_id).await?;
        if let Some(active) = self.active.read().await.get(&run_id) {
            active.cancel.cancel();
        }

        info!("Abort requested for run {}", run_id);
        Ok(true)
    }

    /// Operator rollback of a target, recorded as its own run
    pub async fn rollback(&self, target: &str) -> PipelineResult<RunReport> {
        let spec = RunSpec {
            name: format!("rollback:{}", target),
            variables: HashMap::new(),
            graph: DependencyGraph::new(),
        };
        let mut run = Run::new(spec, None);
        self.store.create_run(&run).await?;
        run.start();
        self.store.update_run_status(&run).await?;
        let _heartbeat = Self::spawn_heartbeat(self.store.clone(), run.id, self.heartbeat_interval());

        let journal = RunJournal::new(run.id, self.store.clone());
        let outcome = self
            .engine
            .rollback_controller()
            .rollback(&journal, target, &CancellationToken::new())
            .await;

        let status = match &outcome {
            Ok(result) if result.is_success() => RunStatus::RolledBack,
            Ok(result) => {
                run.rollback_error = result.error_message().map(str::to_string);
                RunStatus::Failed
            }
            Err(e) => {
                run.rollback_error = Some(e.to_string());
                RunStatus::Failed
            }
        };
        run.finish(status);
        self.store.update_run_status(&run).await?;

        outcome?;
        self.status(run.id).await
    }

    /// Take over runs left behind by a process that died
    ///
    /// A run is taken over once it is active and its heartbeat is older than
    /// the stale threshold; runs executing in this process are never touched.
    /// Each unresolved step of such a run (and any marker whose run already
    /// finished) is offered to its backend's `verify`. Confirmed outcomes are
    /// recorded as they are; anything else is recorded as interrupted. The
    /// stale run then gets a terminal status, rolling its target back when
    /// the failing step was a deploy.
    pub async fn reconcile(&self) -> PipelineResult<ReconcileReport> {
        let local: HashSet<Uuid> = self.active.read().await.keys().copied().collect();
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        let mut stale = Vec::new();
        let mut live = HashSet::new();
        for run in self.store.active_runs().await? {
            if local.contains(&run.id) || !run.is_stale(now, self.stale_after) {
                debug!("Run {} is still owned by a live process", run.id);
                live.insert(run.id);
            } else {
                stale.push(run);
            }
        }

        // Latest attempt per step
        let mut pending: BTreeMap<(Uuid, String), DispatchMarker> = BTreeMap::new();
        for marker in self.store.unresolved_dispatches().await? {
            if local.contains(&marker.run_id) || live.contains(&marker.run_id) {
                continue;
            }
            let key = (marker.run_id, marker.step_id.clone());
            match pending.get(&key) {
                Some(existing) if existing.attempt >= marker.attempt => {}
                _ => {
                    pending.insert(key, marker);
                }
            }
        }

        for marker in pending.into_values() {
            let result = self.verify_marker(&marker).await;
            if result.is_success() {
                report.verified += 1;
            } else {
                report.interrupted += 1;
            }
            RunJournal::new(marker.run_id, self.store.clone())
                .record(&result)
                .await?;
        }

        for mut run in stale {
            warn!("Run {} was left {}; taking it over", run.id, run.status.as_str());
            let status = self.settle_stale_run(&mut run).await?;
            run.finish(status);
            self.store.update_run_status(&run).await?;
            if status == RunStatus::RolledBack {
                report.rolled_back.push(run.id);
            } else {
                report.failed_runs.push(run.id);
            }
        }

        info!(
            "Reconciled {} verified and {} interrupted step(s)",
            report.verified, report.interrupted
        );
        Ok(report)
    }

    /// Terminal status of a run whose process died, rolling back a failed deploy
    async fn settle_stale_run(&self, run: &mut Run) -> PipelineResult<RunStatus> {
        if self.store.abort_requested(run.id).await? {
            return Ok(RunStatus::Failed);
        }

        let results = self.store.results_for_run(run.id).await?;

        // The process got as far as rolling back before it died
        if let Some(rollback) = results.iter().rev().find(|r| r.kind == StepKind::Rollback) {
            if rollback.is_success() {
                return Ok(RunStatus::RolledBack);
            }
            run.rollback_error = Some(rollback.error_message().unwrap_or("rollback failed").to_string());
            return Ok(RunStatus::Failed);
        }

        let failed_target = results
            .iter()
            .filter(|r| r.kind == StepKind::Deploy && r.status == StepStatus::Failed)
            .filter(|r| !r.error.as_ref().is_some_and(|e| e.class == ErrorClass::Persistence))
            .find_map(|r| r.target.clone());
        let Some(target) = failed_target else {
            return Ok(RunStatus::Failed);
        };

        let journal = RunJournal::new(run.id, self.store.clone());
        match self
            .engine
            .rollback_controller()
            .rollback(&journal, &target, &CancellationToken::new())
            .await
        {
            Ok(result) if result.is_success() => Ok(RunStatus::RolledBack),
            Ok(result) => {
                run.rollback_error = Some(result.error_message().unwrap_or("rollback failed").to_string());
                Ok(RunStatus::Failed)
            }
            Err(e @ PipelineError::NoGoodArtifact { .. }) => {
                run.rollback_error = Some(e.to_string());
                Ok(RunStatus::Failed)
            }
            Err(e) => Err(e),
        }
    }

    async fn verify_marker(&self, marker: &DispatchMarker) -> StepResult {
        let step = Step {
            id: marker.step_id.clone(),
            depends_on: vec![],
            target: marker.target.clone(),
            invocation: marker.invocation.clone(),
        };
        let interrupted = PipelineError::Interrupted {
            step: marker.step_id.clone(),
        };

        let verification = match self.backends.backend_for(step.kind()) {
            Ok(backend) => backend.verify(&marker.invocation).await,
            Err(e) => {
                warn!("Cannot verify step {}: {}", marker.step_id, e);
                Ok(Verification::Unknown)
            }
        };

        match verification {
            Ok(Verification::Succeeded(outcome)) => {
                let artifact = outcome
                    .artifact
                    .or_else(|| marker.invocation.parameter(ARTIFACT_PARAM).map(str::to_string));
                StepResult::succeeded(
                    marker.run_id,
                    &step,
                    marker.invocation.clone(),
                    outcome.output,
                    artifact,
                    marker.attempt,
                    marker.dispatched_at,
                )
                .with_exit_code(outcome.exit_code)
            }
            Ok(Verification::Failed(message)) => StepResult::failed(
                marker.run_id,
                &step,
                marker.invocation.clone(),
                &PipelineError::Backend(BackendError::Permanent(message)),
                marker.attempt,
                marker.dispatched_at,
            ),
            Ok(Verification::Unknown) => StepResult::failed(
                marker.run_id,
                &step,
                marker.invocation.clone(),
                &interrupted,
                marker.attempt,
                marker.dispatched_at,
            ),
            Err(e) => {
                warn!("Verification of step {} failed: {}", marker.step_id, e);
                StepResult::failed(
                    marker.run_id,
                    &step,
                    marker.invocation.clone(),
                    &interrupted,
                    marker.attempt,
                    marker.dispatched_at,
                )
            }
        }
    }
}
