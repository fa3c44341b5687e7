//! Rollback controller - reverts a target to its last good artifact

use crate::{
    core::{Invocation, RetryPolicy, Step, StepContext, StepKind, StepResult, ARTIFACT_PARAM},
    error::{PipelineError, PipelineResult},
    execution::{
        events::{EventBus, ExecutionEvent},
        executor::StepExecutor,
    },
    persistence::RunJournal,
};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Replays recorded deploy invocations with an older artifact
pub struct RollbackController {
    executor: Arc<StepExecutor>,
    events: EventBus,
}

impl RollbackController {
    pub fn new(executor: Arc<StepExecutor>, events: EventBus) -> Self {
        Self { executor, events }
    }

    /// Step id used for rollbacks of `target`
    pub fn step_id(target: &str) -> String {
        format!("rollback-{}", target)
    }

    /// Revert `target` to its last good artifact
    ///
    /// When the latest deploy or rollback of the target failed, that is
    /// `last_good(target)` as recorded. When it succeeded, the target is
    /// already running last good, so the newest older entry is used instead.
    ///
    /// The rollback result is recorded through `journal`. `NoGoodArtifact` is
    /// returned (after recording a failed result) when there is nothing to go
    /// back to. A rollback that runs but fails is returned as `Ok` with a
    /// failed result.
    pub async fn rollback(
        &self,
        journal: &RunJournal,
        target: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<StepResult> {
        let store = journal.store();
        let latest = store.latest_deploy(target).await?;
        let exclude = latest
            .as_ref()
            .filter(|r| r.is_success())
            .and_then(|r| r.artifact_ref())
            .map(str::to_string);

        let history = store.good_history(target).await?;
        let candidate = history
            .into_iter()
            .find(|good| Some(good.artifact.as_str()) != exclude.as_deref());

        let Some(good) = candidate else {
            warn!("No good artifact to roll {} back to", target);
            let err = PipelineError::NoGoodArtifact {
                target: target.to_string(),
            };
            let invocation = latest
                .map(|r| r.invocation.with_kind(StepKind::Rollback))
                .unwrap_or_else(Self::empty_invocation);
            let step = Self::rollback_step(target, invocation);
            let result = StepResult::failed(
                journal.run_id(),
                &step,
                step.invocation.clone(),
                &err,
                0,
                Utc::now(),
            );
            journal.record(&result).await?;
            return Err(err);
        };

        info!("Rolling {} back to {}", target, good.artifact);
        self.events.emit(ExecutionEvent::RollbackStarted {
            run_id: journal.run_id(),
            target: target.to_string(),
            artifact: good.artifact.clone(),
        });

        let invocation = good
            .invocation
            .with_parameter(ARTIFACT_PARAM, good.artifact.clone())
            .with_kind(StepKind::Rollback);
        let step = Self::rollback_step(target, invocation);
        let context = StepContext::new(journal.run_id(), step.id.clone());

        let result = self.executor.execute(&step, &context, journal, cancel).await;
        journal.record(&result).await?;

        if result.is_success() {
            info!("Rolled {} back to {}", target, good.artifact);
        } else {
            error!(
                "Rollback of {} failed: {}",
                target,
                result.error_message().unwrap_or("unknown error")
            );
        }

        Ok(result)
    }

    fn rollback_step(target: &str, invocation: Invocation) -> Step {
        Step {
            id: Self::step_id(target),
            depends_on: vec![],
            target: Some(target.to_string()),
            invocation,
        }
    }

    fn empty_invocation() -> Invocation {
        Invocation {
            kind: StepKind::Rollback,
            command: String::new(),
            parameters: Default::default(),
            timeout_secs: 0,
            retry: RetryPolicy::default(),
        }
    }
}
