//! Error taxonomy for the orchestrator

use crate::backend::BackendError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result alias used across the library
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors raised while building, running or rolling back a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Adding a step would close a dependency cycle
    #[error("cycle detected: step '{step}' closes a dependency cycle through '{via}'")]
    Cycle { step: String, via: String },

    /// A step attempt exceeded its time budget
    #[error("step '{step}' timed out after {secs}s")]
    Timeout { step: String, secs: u64 },

    /// The backend reported a failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Rollback is impossible because nothing good was ever recorded
    #[error("no good artifact recorded for target '{target}'")]
    NoGoodArtifact { target: String },

    /// The state store could not durably record something
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The pipeline definition is malformed
    #[error("invalid pipeline spec: {0}")]
    InvalidSpec(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// The step was cancelled before it produced a result
    #[error("step '{0}' was cancelled")]
    Cancelled(String),

    /// The process died after dispatching the step and its outcome is unknown
    #[error("step '{step}' was interrupted before completion")]
    Interrupted { step: String },
}

impl PipelineError {
    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create an invalid spec error
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec(msg.into())
    }

    /// Whether the step executor may retry after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Timeout { .. } => true,
            PipelineError::Backend(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Classification stored alongside failed step results
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Timeout { .. } => ErrorClass::Timeout,
            PipelineError::Backend(e) if e.is_transient() => ErrorClass::Transient,
            PipelineError::Backend(_) => ErrorClass::Permanent,
            PipelineError::NoGoodArtifact { .. } => ErrorClass::NoGoodArtifact,
            PipelineError::Persistence(_) => ErrorClass::Persistence,
            PipelineError::Cancelled(_) => ErrorClass::Cancelled,
            PipelineError::Interrupted { .. } => ErrorClass::Interrupted,
            PipelineError::Cycle { .. }
            | PipelineError::InvalidSpec(_)
            | PipelineError::RunNotFound(_) => ErrorClass::Permanent,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Persistence(format!("serialization failed: {}", err))
    }
}

/// Error classification persisted with a failed step result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Transient,
    Permanent,
    Timeout,
    Cancelled,
    Persistence,
    NoGoodArtifact,
    /// The process died between dispatch and result recording
    Interrupted,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Persistence => "persistence",
            ErrorClass::NoGoodArtifact => "no-good-artifact",
            ErrorClass::Interrupted => "interrupted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transient" => Some(ErrorClass::Transient),
            "permanent" => Some(ErrorClass::Permanent),
            "timeout" => Some(ErrorClass::Timeout),
            "cancelled" => Some(ErrorClass::Cancelled),
            "persistence" => Some(ErrorClass::Persistence),
            "no-good-artifact" => Some(ErrorClass::NoGoodArtifact),
            "interrupted" => Some(ErrorClass::Interrupted),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
