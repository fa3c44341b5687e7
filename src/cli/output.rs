//! CLI output formatting

use crate::{
    core::{config::PipelineConfig, Run, RunStatus, StepResult, StepStatus},
    error::PipelineResult,
    execution::ExecutionEvent,
};
use console::Emoji;
use std::time::Duration;
use uuid::Uuid;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static REWIND: Emoji<'_, '_> = Emoji("⏪ ", "< ");

/// First eight characters of a run id
pub fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Pending => style("PENDING").dim().to_string(),
        RunStatus::Running => style("RUNNING").yellow().to_string(),
        RunStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        RunStatus::Failed => style("FAILED").red().to_string(),
        RunStatus::RolledBack => style("ROLLED BACK").magenta().to_string(),
    }
}

/// Format a step status for display
pub fn format_step_status(status: StepStatus) -> String {
    match status {
        StepStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        StepStatus::Failed => style("FAILED").red().to_string(),
        StepStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// One line per run in history listings
pub fn format_run_summary(run: &Run) -> String {
    let icon = match run.status {
        RunStatus::Succeeded => CHECK,
        RunStatus::Failed => CROSS,
        RunStatus::RolledBack => REWIND,
        RunStatus::Running | RunStatus::Pending => SPINNER,
    };

    let key = run
        .idempotency_key
        .as_deref()
        .map(|k| format!(" [{}]", k))
        .unwrap_or_default();

    format!(
        "{} {} - {}{} - {} - {}",
        icon,
        style(short_id(&run.id)).dim(),
        style(&run.pipeline_name).bold(),
        style(key).dim(),
        format_status(run.status),
        style(run.created_at.format("%Y-%m-%d %H:%M:%S")).dim()
    )
}

/// One line per recorded step result
pub fn format_step_result(result: &StepResult) -> String {
    let mut line = format!(
        "{} {} ({}) {}",
        style(&result.step_id).cyan(),
        style(result.kind).dim(),
        style(format!("{} attempt(s)", result.attempts)).dim(),
        format_step_status(result.status)
    );
    if let Some(target) = &result.target {
        line.push_str(&format!(" -> {}", style(target).bold()));
    }
    if let Some(artifact) = &result.artifact {
        line.push_str(&format!(" [{}]", style(artifact).green()));
    }
    if let Some(error) = &result.error {
        line.push_str(&format!(
            "\n      {}: {}",
            style(error.class).yellow(),
            style(&error.message).dim()
        ));
    }
    line
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::RunStarted {
            run_id,
            pipeline_name,
            total_steps,
        } => format!(
            "{} Starting {} ({}, {} steps)",
            ROCKET,
            style(pipeline_name).bold(),
            style(short_id(run_id)).dim(),
            total_steps
        ),
        ExecutionEvent::StepDispatched {
            step_id,
            kind,
            attempt,
            ..
        } => {
            if *attempt > 1 {
                format!(
                    "{} {} {} (attempt {})",
                    SPINNER,
                    style(kind).dim(),
                    style(step_id).cyan(),
                    attempt
                )
            } else {
                format!("{} {} {}", SPINNER, style(kind).dim(), style(step_id).cyan())
            }
        }
        ExecutionEvent::StepRetrying {
            step_id,
            attempt,
            max_attempts,
            delay,
            error,
            ..
        } => format!(
            "{} {} failed attempt {}/{}, retrying in {}: {}",
            WARN,
            style(step_id).yellow(),
            attempt,
            max_attempts,
            format_duration(*delay),
            style(error).dim()
        ),
        ExecutionEvent::StepSucceeded {
            step_id, artifact, ..
        } => match artifact {
            Some(artifact) => format!(
                "{} {} [{}]",
                CHECK,
                style(step_id).green(),
                style(artifact).dim()
            ),
            None => format!("{} {}", CHECK, style(step_id).green()),
        },
        ExecutionEvent::StepFailed { step_id, error, .. } => {
            format!("{} {}: {}", CROSS, style(step_id).red(), style(error).dim())
        }
        ExecutionEvent::RollbackStarted {
            target, artifact, ..
        } => format!(
            "{} Rolling {} back to {}",
            REWIND,
            style(target).bold(),
            style(artifact).cyan()
        ),
        ExecutionEvent::RunFinished { run_id, status } => format!(
            "{} Run {} {}",
            INFO,
            style(short_id(run_id)).dim(),
            format_status(*status)
        ),
    }
}

/// Format step output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 && duration.subsec_millis() > 0 {
        format!("{}ms", duration.subsec_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Machine-readable outcome of `validate --json`
pub fn validation_json(outcome: &PipelineResult<PipelineConfig>) -> serde_json::Result<String> {
    let data = match outcome {
        Ok(config) => serde_json::json!({ "valid": true, "pipeline": config }),
        Err(e) => serde_json::json!({ "valid": false, "error": e.to_string() }),
    };
    serde_json::to_string_pretty(&data)
}
