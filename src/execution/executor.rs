//! Step executor - runs individual steps against their backend

use crate::{
    backend::BackendRegistry,
    core::{Invocation, Step, StepContext, StepResult, ARTIFACT_PARAM, TARGET_PARAM},
    error::PipelineError,
    execution::events::{EventBus, ExecutionEvent},
    persistence::RunJournal,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Executes a single step, including its retries
pub struct StepExecutor {
    backends: Arc<BackendRegistry>,
    events: EventBus,
}

impl StepExecutor {
    pub fn new(backends: Arc<BackendRegistry>, events: EventBus) -> Self {
        Self { backends, events }
    }

    /// Render the step's invocation for this run
    pub fn prepare(&self, step: &Step, context: &StepContext) -> Invocation {
        let mut invocation = step.invocation.resolve(&context.rendering_variables());
        if let Some(target) = &step.target {
            if invocation.parameter(TARGET_PARAM).is_none() {
                invocation = invocation.with_parameter(TARGET_PARAM, target.clone());
            }
        }
        invocation
    }

    /// Execute a step and return its result
    ///
    /// A dispatch marker is written through `journal` before every attempt.
    /// The result is not recorded here; the caller owns that write.
    pub async fn execute(
        &self,
        step: &Step,
        context: &StepContext,
        journal: &RunJournal,
        cancel: &CancellationToken,
    ) -> StepResult {
        let started_at = Utc::now();
        let invocation = self.prepare(step, context);
        let policy = invocation.retry;
        let max_attempts = policy.max_attempts.max(1);

        info!("Executing step: {}", step.id);
        debug!("Command for step {}: {}", step.id, invocation.command_line());

        let backend = match self.backends.backend_for(step.kind()) {
            Ok(backend) => backend,
            Err(e) => {
                error!("No backend for step {}: {}", step.id, e);
                return StepResult::failed(context.run_id, step, invocation, &e, 0, started_at);
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;

            if cancel.is_cancelled() {
                let err = PipelineError::Cancelled(step.id.clone());
                return StepResult::failed(context.run_id, step, invocation, &err, attempt - 1, started_at);
            }

            if let Err(e) = journal.mark_dispatched(step, attempt, &invocation).await {
                error!("Could not mark step {} as dispatched: {}", step.id, e);
                return StepResult::failed(context.run_id, step, invocation, &e, attempt, started_at);
            }

            self.events.emit(ExecutionEvent::StepDispatched {
                run_id: context.run_id,
                step_id: step.id.clone(),
                kind: step.kind(),
                attempt,
            });

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PipelineError::Cancelled(step.id.clone())),
                res = timeout(invocation.timeout(), backend.execute(&invocation)) => match res {
                    Ok(Ok(outcome)) => Ok(outcome),
                    Ok(Err(e)) => Err(PipelineError::Backend(e)),
                    Err(_) => Err(PipelineError::Timeout {
                        step: step.id.clone(),
                        secs: invocation.timeout_secs,
                    }),
                },
            };

            let err = match outcome {
                Ok(outcome) => {
                    let exit_code = outcome.exit_code;
                    let artifact = outcome.artifact.or_else(|| {
                        invocation
                            .parameter(ARTIFACT_PARAM)
                            .filter(|value| !value.contains("{{"))
                            .map(str::to_string)
                    });
                    info!("Step {} completed successfully", step.id);
                    return StepResult::succeeded(
                        context.run_id,
                        step,
                        invocation,
                        outcome.output,
                        artifact,
                        attempt,
                        started_at,
                    )
                    .with_exit_code(exit_code);
                }
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                error!("Step {} failed after {} attempt(s): {}", step.id, attempt, err);
                return StepResult::failed(context.run_id, step, invocation, &err, attempt, started_at);
            }

            let delay = policy.backoff_after(attempt);
            warn!(
                "Step {} attempt {}/{} failed ({}), retrying in {:?}",
                step.id, attempt, max_attempts, err, delay
            );
            self.events.emit(ExecutionEvent::StepRetrying {
                run_id: context.run_id,
                step_id: step.id.clone(),
                attempt,
                max_attempts,
                delay,
                error: err.to_string(),
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    let err = PipelineError::Cancelled(step.id.clone());
                    return StepResult::failed(context.run_id, step, invocation, &err, attempt, started_at);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
