//! Operator settings and assembly of the orchestrator

use crate::backend::{BackendRegistry, CommandBackend};
use crate::error::PipelineResult;
use crate::execution::{
    PipelineEngine, RunManager, SchedulingStrategy, DEFAULT_ABORT_POLL, DEFAULT_STALE_AFTER,
};
use crate::persistence::{InMemoryStore, StateStore, DEFAULT_RETENTION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Settings for one orchestrator process
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// SQLite database path; `None` uses the per-user data directory
    pub db_path: Option<PathBuf>,

    /// Keep state in memory only
    pub ephemeral: bool,

    /// Good artifacts retained per target
    pub retention: usize,

    pub strategy: SchedulingStrategy,

    /// How often running engines look for persisted abort requests
    pub abort_poll: Duration,

    /// Shell used by the command backend
    pub shell: String,

    /// Silence after which another process's run is recovered
    pub stale_after: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            ephemeral: false,
            retention: DEFAULT_RETENTION,
            strategy: SchedulingStrategy::default(),
            abort_poll: DEFAULT_ABORT_POLL,
            shell: "sh".to_string(),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_abort_poll(mut self, interval: Duration) -> Self {
        self.abort_poll = interval;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Open the configured state store
    pub async fn open_store(&self) -> PipelineResult<Arc<dyn StateStore>> {
        if self.ephemeral {
            debug!("Using in-memory state store");
            return Ok(Arc::new(InMemoryStore::with_retention(self.retention)));
        }
        self.open_durable_store().await
    }

    #[cfg(feature = "sqlite")]
    async fn open_durable_store(&self) -> PipelineResult<Arc<dyn StateStore>> {
        use crate::persistence::SqliteStore;

        let store = match &self.db_path {
            Some(path) => SqliteStore::open(path).await?,
            None => SqliteStore::with_default_path().await?,
        };
        Ok(Arc::new(store.with_retention(self.retention)))
    }

    #[cfg(not(feature = "sqlite"))]
    async fn open_durable_store(&self) -> PipelineResult<Arc<dyn StateStore>> {
        tracing::warn!("Built without the sqlite feature; state will not survive this process");
        Ok(Arc::new(InMemoryStore::with_retention(self.retention)))
    }

    /// Backends for every step kind
    pub fn backends(&self) -> BackendRegistry {
        BackendRegistry::command(CommandBackend::new().with_shell(self.shell.clone()))
    }

    /// Assemble a run manager over the given store and backends
    pub fn build_manager(&self, store: Arc<dyn StateStore>, backends: BackendRegistry) -> RunManager {
        let backends = Arc::new(backends);
        let engine = PipelineEngine::new(backends.clone(), store, self.strategy)
            .with_abort_poll(self.abort_poll);
        RunManager::new(engine, backends).with_stale_after(self.stale_after)
    }

    /// Open the store and assemble a manager over the command backend
    pub async fn open_manager(&self) -> PipelineResult<RunManager> {
        self.open_manager_with(self.backends()).await
    }

    /// Open the store and assemble a manager over `backends`
    ///
    /// A durable store is reconciled before the manager is handed out, so
    /// runs orphaned by a dead process are settled on restart.
    pub async fn open_manager_with(&self, backends: BackendRegistry) -> PipelineResult<RunManager> {
        let store = self.open_store().await?;
        let manager = self.build_manager(store, backends);
        if !self.ephemeral {
            let report = manager.reconcile().await?;
            if !report.is_empty() {
                info!(
                    "Recovered {} run(s) left by a previous process",
                    report.failed_runs.len() + report.rolled_back.len()
                );
            }
        }
        Ok(manager)
    }
}
