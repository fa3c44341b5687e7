//! In-memory state store (for testing or ephemeral use)

use crate::core::{DispatchMarker, GoodArtifact, Run, StepResult};
use crate::error::{PipelineError, PipelineResult};
use crate::persistence::{StateStore, DEFAULT_RETENTION};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, Run>,
    /// Creation order
    run_order: Vec<Uuid>,
    results: Vec<StepResult>,
    dispatches: Vec<DispatchMarker>,
    /// Newest first
    last_good: HashMap<String, VecDeque<GoodArtifact>>,
    aborts: HashSet<Uuid>,
}

/// State store kept entirely in process memory
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    retention: usize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Keep at most `retention` good artifacts per target
    pub fn with_retention(retention: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            retention: retention.max(1),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStore {
    async fn create_run(&self, run: &Run) -> PipelineResult<()> {
        let mut inner = self.inner.write().await;
        if inner.runs.contains_key(&run.id) {
            return Err(PipelineError::persistence(format!("run {} already exists", run.id)));
        }
        inner.runs.insert(run.id, run.clone());
        inner.run_order.push(run.id);
        Ok(())
    }

    async fn update_run_status(&self, run: &Run) -> PipelineResult<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .runs
            .get_mut(&run.id)
            .ok_or(PipelineError::RunNotFound(run.id))?;

        stored.status = run.status;
        stored.started_at = run.started_at;
        stored.finished_at = run.finished_at;
        stored.rollback_error = run.rollback_error.clone();
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> PipelineResult<Option<Run>> {
        let inner = self.inner.read().await;
        Ok(inner.runs.get(&run_id).cloned())
    }

    async fn heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> PipelineResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(run) = inner.runs.get_mut(&run_id) {
            run.heartbeat_at = at;
        }
        Ok(())
    }

    async fn list_runs(&self, limit: usize) -> PipelineResult<Vec<Run>> {
        let inner = self.inner.read().await;
        Ok(inner
            .run_order
            .iter()
            .rev()
            .filter_map(|id| inner.runs.get(id).cloned())
            .take(limit)
            .collect())
    }

    async fn active_runs(&self) -> PipelineResult<Vec<Run>> {
        let inner = self.inner.read().await;
        Ok(inner
            .run_order
            .iter()
            .filter_map(|id| inner.runs.get(id))
            .filter(|run| run.is_active())
            .cloned()
            .collect())
    }

    async fn find_active_by_key(&self, key: &str) -> PipelineResult<Option<Run>> {
        let inner = self.inner.read().await;
        Ok(inner
            .runs
            .values()
            .find(|run| run.is_active() && run.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn mark_dispatched(&self, marker: &DispatchMarker) -> PipelineResult<()> {
        let mut inner = self.inner.write().await;
        inner.dispatches.push(marker.clone());
        Ok(())
    }

    async fn unresolved_dispatches(&self) -> PipelineResult<Vec<DispatchMarker>> {
        let inner = self.inner.read().await;
        Ok(inner.dispatches.clone())
    }

    async fn record(&self, result: &StepResult) -> PipelineResult<()> {
        let mut inner = self.inner.write().await;

        inner.results.push(result.clone());
        inner
            .dispatches
            .retain(|m| !(m.run_id == result.run_id && m.step_id == result.step_id));

        if let Some(good) = GoodArtifact::from_result(result) {
            let history = inner.last_good.entry(good.target.clone()).or_default();
            history.push_front(good);
            history.truncate(self.retention);
        }

        Ok(())
    }

    async fn results_for_run(&self, run_id: Uuid) -> PipelineResult<Vec<StepResult>> {
        let inner = self.inner.read().await;
        Ok(inner
            .results
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn latest_deploy(&self, target: &str) -> PipelineResult<Option<StepResult>> {
        let inner = self.inner.read().await;
        Ok(inner
            .results
            .iter()
            .rev()
            .find(|r| r.kind.touches_target() && r.target.as_deref() == Some(target))
            .cloned())
    }

    async fn last_good(&self, target: &str) -> PipelineResult<Option<GoodArtifact>> {
        let inner = self.inner.read().await;
        Ok(inner
            .last_good
            .get(target)
            .and_then(|history| history.front().cloned()))
    }

    async fn good_history(&self, target: &str) -> PipelineResult<Vec<GoodArtifact>> {
        let inner = self.inner.read().await;
        Ok(inner
            .last_good
            .get(target)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn request_abort(&self, run_id: Uuid) -> PipelineResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.runs.contains_key(&run_id) {
            return Err(PipelineError::RunNotFound(run_id));
        }
        inner.aborts.insert(run_id);
        Ok(())
    }

    async fn abort_requested(&self, run_id: Uuid) -> PipelineResult<bool> {
        let inner = self.inner.read().await;
        Ok(inner.aborts.contains(&run_id))
    }
}
