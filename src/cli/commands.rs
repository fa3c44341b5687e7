//! CLI command definitions

use crate::execution::SchedulingStrategy;
use clap::Args;
use std::path::PathBuf;
use std::str::FromStr;

/// Trigger a run
#[derive(Debug, Args, Clone)]
pub struct TriggerCommand {
    /// Path to pipeline YAML file
    pub file: PathBuf,

    /// Idempotency key; an active run with the same key is reused
    #[arg(short, long)]
    pub key: Option<String>,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub var: Vec<(String, String)>,

    /// Scheduling strategy: sequential, parallel or parallel-limited:N
    #[arg(long, value_parser = SchedulingStrategy::from_str)]
    pub strategy: Option<SchedulingStrategy>,
}

/// Show one run
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    pub run_id: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct AbortCommand {
    pub run_id: String,
}

#[derive(Debug, Args, Clone)]
pub struct RollbackCommand {
    /// Deployment target to revert
    pub target: String,
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show recent runs
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid key=value pair: {}", s))?;
    if key.is_empty() {
        return Err(format!("Missing key in: {}", s));
    }
    Ok((key.to_string(), value.to_string()))
}
