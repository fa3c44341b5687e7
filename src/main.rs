use anyhow::{Context, Result};
use deployline::cli::commands::{
    AbortCommand, HistoryCommand, RollbackCommand, StatusCommand, TriggerCommand, ValidateCommand,
};
use deployline::cli::output::*;
use deployline::cli::{
    exit_code_for, Cli, Command, EXIT_FAILED, EXIT_NO_GOOD_ARTIFACT, EXIT_OK, EXIT_REJECTED,
};
use deployline::core::config::PipelineConfig;
use deployline::error::{ErrorClass, PipelineError};
use deployline::execution::{RunManager, RunReport, Triggered};
use deployline::settings::OrchestratorConfig;
use deployline::RunStatus;
use tracing::{error, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    let settings = cli.settings();
    let code = match &cli.command {
        Command::Trigger(cmd) => trigger(cmd, settings).await?,
        Command::Status(cmd) => status(cmd, &settings).await?,
        Command::Abort(cmd) => abort(cmd, &settings).await?,
        Command::Rollback(cmd) => rollback(cmd, &settings).await?,
        Command::Validate(cmd) => validate(cmd)?,
        Command::History(cmd) => history(cmd, &settings).await?,
        Command::Recover => recover(&settings).await?,
    };

    if code != EXIT_OK {
        std::process::exit(code);
    }
    Ok(())
}

async fn open_manager(settings: &OrchestratorConfig) -> Result<RunManager> {
    settings
        .open_manager()
        .await
        .context("Failed to open state store")
}

fn parse_run_id(raw: &str) -> Option<Uuid> {
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id),
        Err(_) => {
            println!("{} Invalid run id: {}", CROSS, style(raw).red());
            None
        }
    }
}

fn report_error(err: &PipelineError) -> i32 {
    println!("{} {}", CROSS, style(err).red());
    exit_code_for(err)
}

async fn trigger(cmd: &TriggerCommand, settings: OrchestratorConfig) -> Result<i32> {
    let config = match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => config,
        Err(e) => return Ok(report_error(&e)),
    };
    println!("{} Loaded pipeline: {}", INFO, style(&config.name).bold());

    let mut spec = config
        .to_run_spec()
        .context("Failed to build run from pipeline")?;
    for (key, value) in &cmd.var {
        spec.variables.insert(key.clone(), value.clone());
        println!(
            "{} Variable override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }

    let settings = match cmd.strategy {
        Some(strategy) => settings.with_strategy(strategy),
        None => settings,
    };
    let manager = open_manager(&settings).await?;
    manager
        .engine()
        .add_event_handler(|event| println!("{}", format_execution_event(event)));

    let run_id = match manager.trigger(spec, cmd.key.clone()).await {
        Ok(Triggered::Started(run_id)) => run_id,
        Ok(Triggered::Existing(run_id)) => {
            println!(
                "{} A run with this key is already active: {}",
                INFO,
                style(run_id).cyan()
            );
            return Ok(EXIT_OK);
        }
        Err(e) => return Ok(report_error(&e)),
    };
    println!("{} Run accepted: {}", INFO, style(run_id).cyan());

    let wait = manager.wait(run_id);
    tokio::pin!(wait);
    let mut interrupted = false;
    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                println!("{} Interrupted, aborting run", WARN);
                manager.abort(run_id).await?;
            }
        }
    };

    let status = match outcome {
        Ok(status) => status,
        Err(e) => {
            error!("Run {} failed: {}", run_id, e);
            return Ok(report_error(&e));
        }
    };

    let report = manager.status(run_id).await?;
    println!();
    match status {
        RunStatus::Succeeded => {
            println!(
                "{} {} completed {}",
                CHECK,
                style(&report.run.pipeline_name).bold(),
                style("successfully").green()
            );
            Ok(EXIT_OK)
        }
        RunStatus::RolledBack => {
            println!(
                "{} {} failed; target rolled back",
                REWIND,
                style(&report.run.pipeline_name).bold()
            );
            Ok(EXIT_FAILED)
        }
        _ => {
            println!(
                "{} {} {}",
                CROSS,
                style(&report.run.pipeline_name).bold(),
                style("failed").red()
            );
            if let Some(reason) = &report.run.rollback_error {
                println!("  Rollback: {}", style(reason).red());
            }
            Ok(failure_code(&report))
        }
    }
}

/// Failed runs whose rollback found nothing to go back to get their own exit code
fn failure_code(report: &RunReport) -> i32 {
    let no_good = report.results.iter().any(|r| {
        r.error
            .as_ref()
            .is_some_and(|e| e.class == ErrorClass::NoGoodArtifact)
    });
    if no_good {
        EXIT_NO_GOOD_ARTIFACT
    } else {
        EXIT_FAILED
    }
}

async fn status(cmd: &StatusCommand, settings: &OrchestratorConfig) -> Result<i32> {
    let Some(run_id) = parse_run_id(&cmd.run_id) else {
        return Ok(EXIT_REJECTED);
    };
    let manager = open_manager(settings).await?;

    let report = match manager.status(run_id).await {
        Ok(report) => report,
        Err(e) => return Ok(report_error(&e)),
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_details(&report);
    }
    Ok(EXIT_OK)
}

fn print_run_details(report: &RunReport) {
    let run = &report.run;
    println!("{} Run Details", INFO);
    println!("  ID: {}", style(run.id).cyan());
    println!("  Pipeline: {}", style(&run.pipeline_name).bold());
    println!("  Status: {}", format_status(run.status));
    if let Some(key) = &run.idempotency_key {
        println!("  Key: {}", style(key).dim());
    }
    if let Some(started) = run.started_at {
        println!("  Started: {}", style(started.to_rfc3339()).dim());
        if let Some(finished) = run.finished_at {
            println!("  Finished: {}", style(finished.to_rfc3339()).dim());
            if let Ok(duration) = finished.signed_duration_since(started).to_std() {
                println!("  Duration: {}", style(format_duration(duration)).dim());
            }
        }
    }
    if let Some(reason) = &run.rollback_error {
        println!("  Rollback error: {}", style(reason).red());
    }

    println!(
        "\n  {} ({}/{} steps recorded)",
        style("Steps:").bold(),
        report.results.len(),
        run.graph.len()
    );
    for result in &report.results {
        println!("    {}", format_step_result(result));
        if let Some(code) = result.exit_code.filter(|_| !result.is_success()) {
            println!("        {}", style(format!("exit status {}", code)).dim());
        }
        if !result.is_success() && !result.output.trim().is_empty() {
            for line in format_output(result.output.trim_end(), 5).lines() {
                println!("        {}", style(line).dim());
            }
        }
    }
}

async fn abort(cmd: &AbortCommand, settings: &OrchestratorConfig) -> Result<i32> {
    let Some(run_id) = parse_run_id(&cmd.run_id) else {
        return Ok(EXIT_REJECTED);
    };
    let manager = open_manager(settings).await?;

    match manager.abort(run_id).await {
        Ok(true) => {
            println!("{} Abort requested for {}", CHECK, style(run_id).cyan());
            Ok(EXIT_OK)
        }
        Ok(false) => {
            println!("{} Run {} has already finished", WARN, style(run_id).cyan());
            Ok(EXIT_REJECTED)
        }
        Err(e) => Ok(report_error(&e)),
    }
}

async fn rollback(cmd: &RollbackCommand, settings: &OrchestratorConfig) -> Result<i32> {
    let manager = open_manager(settings).await?;
    manager
        .engine()
        .add_event_handler(|event| println!("{}", format_execution_event(event)));

    match manager.rollback(&cmd.target).await {
        Ok(report) if report.run.status == RunStatus::RolledBack => {
            println!(
                "{} {} rolled back ({})",
                CHECK,
                style(&cmd.target).bold(),
                style(report.run.id).dim()
            );
            Ok(EXIT_OK)
        }
        Ok(report) => {
            println!(
                "{} Rollback of {} failed: {}",
                CROSS,
                style(&cmd.target).bold(),
                style(report.run.rollback_error.as_deref().unwrap_or("unknown error")).red()
            );
            Ok(EXIT_FAILED)
        }
        Err(e) => Ok(report_error(&e)),
    }
}

fn validate(cmd: &ValidateCommand) -> Result<i32> {
    let outcome = PipelineConfig::from_file(&cmd.file);

    // Only the JSON document goes to stdout
    if cmd.json {
        println!("{}", validation_json(&outcome)?);
        return Ok(match &outcome {
            Ok(_) => EXIT_OK,
            Err(e) => exit_code_for(e),
        });
    }

    let config = match outcome {
        Ok(config) => config,
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(&e).red());
            return Ok(exit_code_for(&e));
        }
    };

    println!("{} Pipeline configuration is valid!", CHECK);
    println!("  Name: {}", style(&config.name).bold());
    println!("  Steps: {}", style(config.steps.len()).cyan());
    println!(
        "  Variables: {}",
        style(config.variables_as_string_map().len()).cyan()
    );

    let spec = config.to_run_spec()?;
    println!("  {}", style("Dispatch order:").bold());
    for id in spec.graph.topological_order() {
        let dependents: Vec<&str> = spec
            .graph
            .dependents_of(id)
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        if dependents.is_empty() {
            println!("    {}", style(id).cyan());
        } else {
            println!(
                "    {} {}",
                style(id).cyan(),
                style(format!("(unblocks {})", dependents.join(", "))).dim()
            );
        }
    }
    Ok(EXIT_OK)
}

async fn history(cmd: &HistoryCommand, settings: &OrchestratorConfig) -> Result<i32> {
    let manager = open_manager(settings).await?;
    let runs = manager.history(cmd.limit).await?;

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(EXIT_OK);
    }

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(EXIT_OK);
    }

    println!("{} Run history (showing latest {}):", INFO, cmd.limit);
    for run in &runs {
        println!("  {}", format_run_summary(run));
    }
    Ok(EXIT_OK)
}

async fn recover(settings: &OrchestratorConfig) -> Result<i32> {
    // Reconcile explicitly so the report covers this pass
    let store = settings
        .open_store()
        .await
        .context("Failed to open state store")?;
    let manager = settings.build_manager(store, settings.backends());
    let report = manager.reconcile().await?;

    println!(
        "{} Recovered {} step(s): {} confirmed by their backend, {} interrupted",
        INFO,
        report.verified + report.interrupted,
        style(report.verified).green(),
        style(report.interrupted).yellow()
    );
    for run_id in &report.rolled_back {
        println!("  {} {} rolled back", REWIND, style(run_id).cyan());
    }
    for run_id in &report.failed_runs {
        println!("  {} {} marked failed", WARN, style(run_id).cyan());
    }
    Ok(EXIT_OK)
}
