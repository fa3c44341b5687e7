//! deployline - a deployment pipeline orchestrator
//!
//! Runs a dependency graph of build, push, provision, deploy and verify
//! steps against pluggable backends, records every result durably, and
//! rolls a target back to its last good artifact when a deploy fails.

pub mod backend;
pub mod cli;
pub mod core;
pub mod error;
pub mod execution;
pub mod persistence;
pub mod settings;

// Re-export commonly used types
pub use backend::{Backend, BackendError, BackendOutcome, BackendRegistry, CommandBackend, Verification};
pub use core::{DependencyGraph, Invocation, Run, RunSpec, RunStatus, Step, StepKind, StepResult};
pub use error::{ErrorClass, PipelineError, PipelineResult};
pub use execution::{ExecutionEvent, PipelineEngine, RunManager, SchedulingStrategy, Triggered};
pub use persistence::{InMemoryStore, StateStore};
pub use settings::OrchestratorConfig;
