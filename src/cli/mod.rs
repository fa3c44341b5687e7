//! Command-line interface

pub mod commands;
pub mod output;

use crate::error::PipelineError;
use crate::execution::DEFAULT_STALE_AFTER;
use crate::persistence::DEFAULT_RETENTION;
use crate::settings::OrchestratorConfig;
use clap::{Parser, Subcommand};
use commands::{
    AbortCommand, HistoryCommand, RollbackCommand, StatusCommand, TriggerCommand, ValidateCommand,
};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Run accepted or succeeded
pub const EXIT_OK: i32 = 0;
/// Run or rollback ended in failure
pub const EXIT_FAILED: i32 = 1;
/// Request rejected: invalid pipeline spec or unknown run
pub const EXIT_REJECTED: i32 = 2;
/// Rollback impossible: no good artifact recorded for the target
pub const EXIT_NO_GOOD_ARTIFACT: i32 = 3;

/// Deployment pipeline orchestrator
#[derive(Debug, Parser, Clone)]
#[command(name = "deployline")]
#[command(version)]
#[command(about = "Build, push, provision, deploy, verify and roll back", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the state database
    #[arg(long, global = true, env = "DEPLOYLINE_DB")]
    pub db: Option<PathBuf>,

    /// Keep state in memory only (nothing survives the process)
    #[arg(long, global = true)]
    pub ephemeral: bool,

    /// Good artifacts retained per target
    #[arg(long, global = true, env = "DEPLOYLINE_RETENTION", default_value_t = DEFAULT_RETENTION)]
    pub retention: usize,

    /// Seconds without a heartbeat before another process's run is recovered
    #[arg(
        long,
        global = true,
        env = "DEPLOYLINE_STALE_AFTER",
        default_value_t = DEFAULT_STALE_AFTER.as_secs()
    )]
    pub stale_after: u64,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Trigger a run and follow it to completion
    Trigger(TriggerCommand),

    /// Show a run and its step results
    Status(StatusCommand),

    /// Abort a running run
    Abort(AbortCommand),

    /// Roll a target back to its last good artifact
    Rollback(RollbackCommand),

    /// Validate a pipeline file
    Validate(ValidateCommand),

    /// Show recent runs
    History(HistoryCommand),

    /// Settle runs left behind by a process that died (also done on every start)
    Recover,
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }

    /// Orchestrator settings selected by the global flags
    pub fn settings(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::new()
            .ephemeral(self.ephemeral)
            .with_retention(self.retention)
            .with_stale_after(Duration::from_secs(self.stale_after));
        if let Some(db) = &self.db {
            config = config.with_db_path(db);
        }
        config
    }
}

/// Process exit code for an error that ended a command
pub fn exit_code_for(err: &PipelineError) -> i32 {
    match err {
        PipelineError::InvalidSpec(_) | PipelineError::Cycle { .. } | PipelineError::RunNotFound(_) => {
            EXIT_REJECTED
        }
        PipelineError::NoGoodArtifact { .. } => EXIT_NO_GOOD_ARTIFACT,
        _ => EXIT_FAILED,
    }
}
