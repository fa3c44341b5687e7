//! Run domain model

use crate::core::{
    context::StepContext,
    graph::DependencyGraph,
    state::RunStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// What a trigger asks to run: a validated graph plus variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub name: String,
    pub variables: HashMap<String, String>,
    pub graph: DependencyGraph,
}

/// One execution instance of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,

    pub pipeline_name: String,

    /// Key supplied by the trigger to deduplicate concurrent requests
    pub idempotency_key: Option<String>,

    pub status: RunStatus,

    /// Variables available to every step
    pub variables: HashMap<String, String>,

    /// Graph snapshot taken at trigger time
    pub graph: DependencyGraph,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Why the rollback attempt failed, when one was made and failed
    pub rollback_error: Option<String>,

    /// Last sign of life from the process executing the run
    pub heartbeat_at: DateTime<Utc>,
}

impl Run {
    pub fn new(spec: RunSpec, idempotency_key: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            pipeline_name: spec.name,
            idempotency_key,
            status: RunStatus::Pending,
            variables: spec.variables,
            graph: spec.graph,
            created_at: now,
            started_at: None,
            finished_at: None,
            rollback_error: None,
            heartbeat_at: now,
        }
    }

    /// Mark run as started
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Move to a terminal status
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Active, but nothing has refreshed its heartbeat for `stale_after`
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        let silent = now.signed_duration_since(self.heartbeat_at);
        self.is_active() && silent.to_std().is_ok_and(|silent| silent >= stale_after)
    }

    /// Create execution context for a step
    pub fn context_for_step(&self, step_id: &str, artifacts: &HashMap<String, String>) -> StepContext {
        let mut context = StepContext::new(self.id, step_id).with_variables(self.variables.clone());
        for (id, artifact) in artifacts {
            context.set_artifact(id, artifact.clone());
        }
        context
    }
}
