//! Execution state models

use crate::core::step::{Invocation, Step, StepKind, ARTIFACT_PARAM};
use crate::error::{ErrorClass, PipelineError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// Run is recorded but has not started
    Pending,
    /// Run is currently executing
    Running,
    /// Every step succeeded
    Succeeded,
    /// A step exhausted its retries, or the run was aborted
    Failed,
    /// A deploy failed and the target was reverted to a prior good artifact
    RolledBack,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::RolledBack
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::RolledBack => "rolled-back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "rolled-back" => Some(RunStatus::RolledBack),
            _ => None,
        }
    }
}

/// Final status of one step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Interrupted by an abort; never advances the graph
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "succeeded" => Some(StepStatus::Succeeded),
            "failed" => Some(StepStatus::Failed),
            "cancelled" => Some(StepStatus::Cancelled),
            _ => None,
        }
    }
}

/// Classified error attached to a failed step result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&PipelineError> for StepError {
    fn from(err: &PipelineError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one step within one run; immutable once recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub run_id: Uuid,
    pub step_id: String,
    pub kind: StepKind,
    pub target: Option<String>,
    pub status: StepStatus,

    /// Artifact reference reported by the backend (image digest, state version, ...)
    pub artifact: Option<String>,

    /// Captured backend output
    pub output: String,

    /// Exit status reported by the backend, when it has one
    #[serde(default)]
    pub exit_code: Option<i32>,

    pub error: Option<StepError>,

    /// Attempts used, including the first
    pub attempts: u32,

    /// The invocation as it was handed to the backend
    pub invocation: Invocation,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    pub fn succeeded(
        run_id: Uuid,
        step: &Step,
        invocation: Invocation,
        output: String,
        artifact: Option<String>,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            step_id: step.id.clone(),
            kind: step.kind(),
            target: step.target.clone(),
            status: StepStatus::Succeeded,
            artifact,
            output,
            exit_code: None,
            error: None,
            attempts,
            invocation,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        run_id: Uuid,
        step: &Step,
        invocation: Invocation,
        error: &PipelineError,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        let status = if matches!(error, PipelineError::Cancelled(_)) {
            StepStatus::Cancelled
        } else {
            StepStatus::Failed
        };
        let capture = match error {
            PipelineError::Backend(e) => e.capture(),
            _ => None,
        };

        Self {
            run_id,
            step_id: step.id.clone(),
            kind: step.kind(),
            target: step.target.clone(),
            status,
            artifact: None,
            output: capture.map(|c| c.output.clone()).unwrap_or_default(),
            exit_code: capture.and_then(|c| c.exit_code),
            error: Some(StepError::from(error)),
            attempts,
            invocation,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    /// Artifact reported by the backend, or the one the invocation asked for
    pub fn artifact_ref(&self) -> Option<&str> {
        self.artifact
            .as_deref()
            .or_else(|| self.invocation.parameter(ARTIFACT_PARAM))
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}

/// Durable note that a step attempt was handed to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMarker {
    pub run_id: Uuid,
    pub step_id: String,
    pub attempt: u32,
    pub target: Option<String>,
    pub invocation: Invocation,
    pub dispatched_at: DateTime<Utc>,
}

/// Entry of the per-target "last good artifact" index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodArtifact {
    pub target: String,
    pub artifact: String,
    pub run_id: Uuid,
    pub step_id: String,

    /// Deploy invocation that produced the artifact; replayed on rollback
    pub invocation: Invocation,

    pub recorded_at: DateTime<Utc>,
}

impl GoodArtifact {
    /// Index entry for a succeeded deploy result, if it carries target and artifact
    pub fn from_result(result: &StepResult) -> Option<Self> {
        if result.kind != StepKind::Deploy || !result.is_success() {
            return None;
        }
        Some(Self {
            target: result.target.clone()?,
            artifact: result.artifact.clone()?,
            run_id: result.run_id,
            step_id: result.step_id.clone(),
            invocation: result.invocation.clone(),
            recorded_at: result.finished_at,
        })
    }
}
