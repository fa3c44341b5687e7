//! Main execution engine - orchestrates a run from dispatch to terminal status

use crate::{
    backend::{BackendError, BackendRegistry},
    core::{Progress, Run, RunStatus, Step, StepContext, StepKind, StepResult, StepStatus},
    error::{ErrorClass, PipelineError, PipelineResult},
    execution::{
        events::{EventBus, ExecutionEvent},
        executor::StepExecutor,
        rollback::RollbackController,
        scheduler::{ExecutionScheduler, SchedulingStrategy},
    },
    persistence::{RunJournal, StateStore},
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often a running engine checks the store for an abort request
pub const DEFAULT_ABORT_POLL: Duration = Duration::from_millis(500);

/// Main pipeline execution engine
pub struct PipelineEngine {
    executor: Arc<StepExecutor>,
    rollback: RollbackController,
    scheduler: ExecutionScheduler,
    store: Arc<dyn StateStore>,
    events: EventBus,
    abort_poll: Duration,
}

impl PipelineEngine {
    pub fn new(
        backends: Arc<BackendRegistry>,
        store: Arc<dyn StateStore>,
        strategy: SchedulingStrategy,
    ) -> Self {
        let events = EventBus::new();
        let executor = Arc::new(StepExecutor::new(backends, events.clone()));
        let rollback = RollbackController::new(executor.clone(), events.clone());

        Self {
            executor,
            rollback,
            scheduler: ExecutionScheduler::new(strategy),
            store,
            events,
            abort_poll: DEFAULT_ABORT_POLL,
        }
    }

    pub fn with_abort_poll(mut self, interval: Duration) -> Self {
        self.abort_poll = interval.max(Duration::from_millis(1));
        self
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler);
    }

    pub fn rollback_controller(&self) -> &RollbackController {
        &self.rollback
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Execute a run to its terminal status
    ///
    /// The run must already exist in the store. A persistence failure is
    /// fatal: the run is marked failed (best effort) and the error returned.
    pub async fn execute(&self, run: &mut Run, cancel: CancellationToken) -> PipelineResult<RunStatus> {
        let journal = RunJournal::new(run.id, self.store.clone());

        match self.drive(run, &journal, &cancel).await {
            Ok(status) => Ok(status),
            Err(e) => {
                error!("Run {} aborted by a persistence failure: {}", run.id, e);
                run.finish(RunStatus::Failed);
                if let Err(write_err) = self.store.update_run_status(run).await {
                    warn!("Could not mark run {} as failed: {}", run.id, write_err);
                }
                self.events.emit(ExecutionEvent::RunFinished {
                    run_id: run.id,
                    status: RunStatus::Failed,
                });
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        run: &mut Run,
        journal: &RunJournal,
        cancel: &CancellationToken,
    ) -> PipelineResult<RunStatus> {
        info!("Starting run {} of pipeline {}", run.id, run.pipeline_name);
        debug!("Scheduling run {} {}", run.id, self.scheduler.strategy());
        run.start();
        self.store.update_run_status(run).await?;
        self.events.emit(ExecutionEvent::RunStarted {
            run_id: run.id,
            pipeline_name: run.pipeline_name.clone(),
            total_steps: run.graph.len(),
        });

        // Steps must not outlive the run that dispatched them
        let run_cancel = cancel.child_token();
        let _cancel_on_drop = run_cancel.clone().drop_guard();

        let mut progress = Progress::new();
        let mut artifacts: HashMap<String, String> = HashMap::new();
        let mut in_flight: JoinSet<StepResult> = JoinSet::new();
        let mut failure: Option<StepResult> = None;
        let mut aborted = self.store.abort_requested(run.id).await? || run_cancel.is_cancelled();

        let mut poll = tokio::time::interval(self.abort_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !aborted && failure.is_none() {
                for step_id in self.scheduler.next_steps(&run.graph, &progress, in_flight.len()) {
                    let Some(step) = run.graph.step(&step_id).cloned() else {
                        continue;
                    };
                    debug!("Dispatching step {}", step.id);
                    progress.mark_dispatched(&step.id);
                    let context = run.context_for_step(&step.id, &artifacts);
                    in_flight.spawn(Self::supervise(
                        self.executor.clone(),
                        step,
                        context,
                        journal.clone(),
                        run_cancel.child_token(),
                    ));
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = run_cancel.cancelled(), if !aborted => {
                    info!("Run {} cancelled", run.id);
                    aborted = true;
                }
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else { continue };
                    let result = joined
                        .map_err(|e| PipelineError::persistence(format!("step task lost: {}", e)))?;

                    // A result that cannot be recorded fails the run
                    journal.record(&result).await?;
                    self.emit_result(&result);

                    if !aborted && (run_cancel.is_cancelled() || result.status == StepStatus::Cancelled) {
                        info!("Run {} cancelled", run.id);
                        aborted = true;
                    }

                    if aborted {
                        debug!("Run {} aborted; step {} does not advance the graph", run.id, result.step_id);
                    } else if result.is_success() {
                        progress.mark_succeeded(&result.step_id);
                        if let Some(artifact) = &result.artifact {
                            artifacts.insert(result.step_id.clone(), artifact.clone());
                        }
                    } else if failure.is_none() {
                        warn!("Step {} failed; no further steps will be dispatched", result.step_id);
                        failure = Some(result);
                    }
                }
                _ = poll.tick(), if !aborted => {
                    if self.store.abort_requested(run.id).await? {
                        info!("Abort requested for run {}", run.id);
                        aborted = true;
                        run_cancel.cancel();
                    }
                }
            }
        }

        let status = if aborted {
            RunStatus::Failed
        } else if let Some(failed) = failure {
            self.resolve_failure(run, journal, &failed, &run_cancel).await?
        } else if progress.succeeded_count() == run.graph.len() {
            RunStatus::Succeeded
        } else {
            error!("Run {} has no runnable steps left", run.id);
            RunStatus::Failed
        };

        run.finish(status);
        self.store.update_run_status(run).await?;
        info!("Run {} finished: {}", run.id, status.as_str());
        self.events.emit(ExecutionEvent::RunFinished {
            run_id: run.id,
            status,
        });

        Ok(status)
    }

    /// Decide the terminal status after a step failed, rolling back failed deploys
    async fn resolve_failure(
        &self,
        run: &mut Run,
        journal: &RunJournal,
        failed: &StepResult,
        cancel: &CancellationToken,
    ) -> PipelineResult<RunStatus> {
        let persistence_failure = failed
            .error
            .as_ref()
            .is_some_and(|e| e.class == ErrorClass::Persistence);

        let target = match (&failed.target, failed.kind) {
            (Some(target), StepKind::Deploy) if !persistence_failure => target.clone(),
            _ => return Ok(RunStatus::Failed),
        };

        match self.rollback.rollback(journal, &target, cancel).await {
            Ok(result) => {
                self.emit_result(&result);
                if result.is_success() {
                    Ok(RunStatus::RolledBack)
                } else {
                    run.rollback_error = Some(
                        result
                            .error_message()
                            .unwrap_or("rollback failed")
                            .to_string(),
                    );
                    Ok(RunStatus::Failed)
                }
            }
            Err(e @ PipelineError::NoGoodArtifact { .. }) => {
                run.rollback_error = Some(e.to_string());
                Ok(RunStatus::Failed)
            }
            Err(e) => Err(e),
        }
    }

    fn emit_result(&self, result: &StepResult) {
        let event = if result.is_success() {
            ExecutionEvent::StepSucceeded {
                run_id: result.run_id,
                step_id: result.step_id.clone(),
                artifact: result.artifact.clone(),
            }
        } else {
            ExecutionEvent::StepFailed {
                run_id: result.run_id,
                step_id: result.step_id.clone(),
                error: result.error_message().unwrap_or("unknown error").to_string(),
            }
        };
        self.events.emit(event);
    }

    /// Run one step in its own task so a panicking backend still yields a result
    async fn supervise(
        executor: Arc<StepExecutor>,
        step: Step,
        context: StepContext,
        journal: RunJournal,
        cancel: CancellationToken,
    ) -> StepResult {
        let run_id = context.run_id;
        let fallback = step.clone();
        let started_at = Utc::now();

        let handle = tokio::spawn(async move {
            executor.execute(&step, &context, &journal, &cancel).await
        });

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("Step {} task failed: {}", fallback.id, e);
                let err = PipelineError::Backend(BackendError::Permanent(format!(
                    "step task failed: {}",
                    e
                )));
                StepResult::failed(run_id, &fallback, fallback.invocation.clone(), &err, 1, started_at)
            }
        }
    }
}
