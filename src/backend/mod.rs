//! Backends the step executor delegates work to

pub mod command;
pub mod registry;

use crate::core::Invocation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command::CommandBackend;
pub use registry::BackendRegistry;

/// Failure reported by a backend, classified for the retry policy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Worth retrying (network blip, registry 503, lock contention)
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Retrying will not help (bad manifest, permission denied)
    #[error("permanent backend error: {0}")]
    Permanent(String),

    /// The tool ran and reported failure; keeps what it printed
    #[error("{error}")]
    Exited {
        error: Box<BackendError>,
        capture: BackendOutcome,
    },
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Transient(_) => true,
            BackendError::Permanent(_) => false,
            BackendError::Exited { error, .. } => error.is_transient(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            BackendError::Transient(m) | BackendError::Permanent(m) => m,
            BackendError::Exited { error, .. } => error.message(),
        }
    }

    /// Attach the output and exit status of the failed invocation
    pub fn with_capture(self, capture: BackendOutcome) -> Self {
        let error = match self {
            BackendError::Exited { error, .. } => error,
            other => Box::new(other),
        };
        BackendError::Exited { error, capture }
    }

    /// Output and exit status captured from the failed invocation, if any
    pub fn capture(&self) -> Option<&BackendOutcome> {
        match self {
            BackendError::Exited { capture, .. } => Some(capture),
            _ => None,
        }
    }
}

/// Structured capture of a successful invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOutcome {
    /// Captured output
    pub output: String,

    /// Artifact reference, if the backend reported one
    pub artifact: Option<String>,

    pub exit_code: Option<i32>,
}

impl BackendOutcome {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            artifact: None,
            exit_code: Some(0),
        }
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }
}

/// Answer of a backend asked about an attempt whose result was never recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// The work is confirmed done
    Succeeded(BackendOutcome),
    /// The work is confirmed not done
    Failed(String),
    /// The backend cannot tell
    Unknown,
}

/// Capability interface implemented by builders, registries, provisioners and cluster APIs
#[async_trait]
pub trait Backend: Send + Sync {
    /// Perform the invocation; may block for as long as the external tool needs
    async fn execute(&self, invocation: &Invocation) -> Result<BackendOutcome, BackendError>;

    /// Check whether a previously dispatched invocation took effect
    async fn verify(&self, _invocation: &Invocation) -> Result<Verification, BackendError> {
        Ok(Verification::Unknown)
    }

    fn name(&self) -> &str {
        "backend"
    }
}
