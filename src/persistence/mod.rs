//! Persistence layer for runs, step results and the last-good index

pub mod journal;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod store;

pub use journal::RunJournal;
pub use memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

use crate::core::{DispatchMarker, GoodArtifact, Run, StepResult};
use crate::error::PipelineResult;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Good artifacts kept per target unless configured otherwise
pub const DEFAULT_RETENTION: usize = 5;

/// Durable record of runs
///
/// Step results are append-only. Recording a result resolves the dispatch
/// markers of its step and, for a succeeded deploy, pushes the artifact onto
/// the target's last-good history.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a newly triggered run
    async fn create_run(&self, run: &Run) -> PipelineResult<()>;

    /// Persist status, timestamps and rollback error of a run
    ///
    /// Never clears an abort request or moves the heartbeat.
    async fn update_run_status(&self, run: &Run) -> PipelineResult<()>;

    async fn load_run(&self, run_id: Uuid) -> PipelineResult<Option<Run>>;

    /// Refresh the heartbeat of a run; unknown runs are ignored
    async fn heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> PipelineResult<()>;

    /// Most recently created runs first
    async fn list_runs(&self, limit: usize) -> PipelineResult<Vec<Run>>;

    /// Runs that are still pending or running
    async fn active_runs(&self) -> PipelineResult<Vec<Run>>;

    /// Active run triggered with the given idempotency key
    async fn find_active_by_key(&self, key: &str) -> PipelineResult<Option<Run>>;

    /// Note that an attempt is about to be handed to a backend
    async fn mark_dispatched(&self, marker: &DispatchMarker) -> PipelineResult<()>;

    /// Markers whose step never got a recorded result
    async fn unresolved_dispatches(&self) -> PipelineResult<Vec<DispatchMarker>>;

    /// Append a step result
    async fn record(&self, result: &StepResult) -> PipelineResult<()>;

    /// Results of a run in the order they were recorded
    async fn results_for_run(&self, run_id: Uuid) -> PipelineResult<Vec<StepResult>>;

    /// Most recent deploy or rollback result recorded for a target
    async fn latest_deploy(&self, target: &str) -> PipelineResult<Option<StepResult>>;

    /// Most recent good artifact for a target
    async fn last_good(&self, target: &str) -> PipelineResult<Option<GoodArtifact>>;

    /// Retained good artifacts for a target, newest first
    async fn good_history(&self, target: &str) -> PipelineResult<Vec<GoodArtifact>>;

    /// Persist an abort request for a run
    async fn request_abort(&self, run_id: Uuid) -> PipelineResult<()>;

    async fn abort_requested(&self, run_id: Uuid) -> PipelineResult<bool>;
}
