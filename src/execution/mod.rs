//! Pipeline execution: step executor, engine, rollback and run management

pub mod engine;
pub mod events;
pub mod executor;
pub mod manager;
pub mod rollback;
pub mod scheduler;

pub use engine::{PipelineEngine, DEFAULT_ABORT_POLL};
pub use events::{EventBus, EventHandler, ExecutionEvent};
pub use executor::StepExecutor;
pub use manager::{ReconcileReport, RunManager, RunReport, Triggered, DEFAULT_STALE_AFTER};
pub use rollback::RollbackController;
pub use scheduler::{ExecutionScheduler, SchedulingStrategy};
