//! Per-run write path into the state store

use crate::core::{DispatchMarker, Invocation, Step, StepResult};
use crate::error::PipelineResult;
use crate::persistence::StateStore;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Serializes every write a run makes
///
/// Step tasks write dispatch markers while the engine records results; the
/// journal lock keeps a single writer per run.
#[derive(Clone)]
pub struct RunJournal {
    run_id: Uuid,
    store: Arc<dyn StateStore>,
    lock: Arc<Mutex<()>>,
}

impl RunJournal {
    pub fn new(run_id: Uuid, store: Arc<dyn StateStore>) -> Self {
        Self {
            run_id,
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Durably note that `attempt` of `step` is about to run
    pub async fn mark_dispatched(
        &self,
        step: &Step,
        attempt: u32,
        invocation: &Invocation,
    ) -> PipelineResult<()> {
        let marker = DispatchMarker {
            run_id: self.run_id,
            step_id: step.id.clone(),
            attempt,
            target: step.target.clone(),
            invocation: invocation.clone(),
            dispatched_at: Utc::now(),
        };

        let _guard = self.lock.lock().await;
        self.store.mark_dispatched(&marker).await?;
        debug!("Marked {} attempt {} as dispatched", step.id, attempt);
        Ok(())
    }

    /// Append a step result
    pub async fn record(&self, result: &StepResult) -> PipelineResult<()> {
        let _guard = self.lock.lock().await;
        self.store.record(result).await?;
        debug!(
            "Recorded {} for step {} ({})",
            result.status.as_str(),
            result.step_id,
            self.run_id
        );
        Ok(())
    }
}
