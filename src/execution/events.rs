//! Execution events and the handlers that observe them

use crate::core::{RunStatus, StepKind};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Events that can occur during a run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        run_id: Uuid,
        pipeline_name: String,
        total_steps: usize,
    },
    StepDispatched {
        run_id: Uuid,
        step_id: String,
        kind: StepKind,
        attempt: u32,
    },
    StepRetrying {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        error: String,
    },
    StepSucceeded {
        run_id: Uuid,
        step_id: String,
        artifact: Option<String>,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
    },
    RollbackStarted {
        run_id: Uuid,
        target: String,
        artifact: String,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(&ExecutionEvent) + Send + Sync>;

/// Fan-out of events to registered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event handler
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(Arc::new(handler));
        }
    }

    /// Emit an event to all handlers
    pub fn emit(&self, event: ExecutionEvent) {
        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return,
        };
        for handler in handlers.iter() {
            handler(&event);
        }
    }
}
