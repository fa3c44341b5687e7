//! Maps step kinds to the backend that performs them

use crate::backend::{Backend, CommandBackend};
use crate::core::StepKind;
use crate::error::{PipelineError, PipelineResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Backend lookup by step kind
///
/// Rollback steps replay a deploy, so without a dedicated rollback backend
/// they go to whatever handles deploys.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<StepKind, Arc<dyn Backend>>,
    fallback: Option<Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every kind runs through the shell command backend
    pub fn command(backend: CommandBackend) -> Self {
        Self::new().with_fallback(Arc::new(backend))
    }

    pub fn register(mut self, kind: StepKind, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(kind, backend);
        self
    }

    /// Backend used for kinds without a registration
    pub fn with_fallback(mut self, backend: Arc<dyn Backend>) -> Self {
        self.fallback = Some(backend);
        self
    }

    pub fn backend_for(&self, kind: StepKind) -> PipelineResult<Arc<dyn Backend>> {
        let registered = self.backends.get(&kind).or_else(|| match kind {
            StepKind::Rollback => self.backends.get(&StepKind::Deploy),
            _ => None,
        });

        registered
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                PipelineError::invalid_spec(format!("no backend registered for kind '{}'", kind))
            })
    }
}
