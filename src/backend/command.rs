//! Shell command backend - runs the invocation through `sh -c`

use crate::backend::{Backend, BackendError, BackendOutcome, Verification};
use crate::core::{Invocation, ARTIFACT_PARAM};
use async_trait::async_trait;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

/// Stdout line prefix a command uses to report its artifact reference
pub const ARTIFACT_MARKER: &str = "::artifact::";

/// Parameter naming a command that checks whether an attempt took effect
pub const VERIFY_PARAM: &str = "verify_command";

/// `EX_TEMPFAIL` from sysexits.h
pub const EXIT_TEMPFAIL: i32 = 75;

/// Backend for executing invocations as shell commands
#[derive(Debug, Clone)]
pub struct CommandBackend {
    /// Shell used to interpret the command line
    shell: String,

    /// Prefix for the environment variables carrying parameters
    env_prefix: String,

    /// Exit codes classified as transient
    transient_exit_codes: Vec<i32>,
}

impl Default for CommandBackend {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            env_prefix: "DEPLOYLINE_".to_string(),
            transient_exit_codes: vec![EXIT_TEMPFAIL],
        }
    }
}

impl CommandBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_transient_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.transient_exit_codes = codes;
        self
    }

    fn env_name(&self, key: &str) -> String {
        let sanitized: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}{}", self.env_prefix, sanitized)
    }

    async fn run(&self, command_line: &str, invocation: &Invocation) -> Result<Output, BackendError> {
        debug!("Spawning {} -c with command length: {}", self.shell, command_line.len());

        let mut command = Command::new(&self.shell);
        command.arg("-c").arg(command_line).kill_on_drop(true);
        for (key, value) in &invocation.parameters {
            command.env(self.env_name(key), value);
        }

        // Failing to spawn means the shell itself is missing
        command
            .output()
            .await
            .map_err(|e| BackendError::Permanent(format!("failed to spawn {}: {}", self.shell, e)))
    }

    fn classify_failure(&self, output: &Output) -> BackendError {
        let stderr = String::from_utf8_lossy(&output.stderr);
        match output.status.code() {
            Some(code) => {
                let message = format!("command exited with code {}: {}", code, stderr.trim());
                if self.transient_exit_codes.contains(&code) {
                    BackendError::Transient(message)
                } else {
                    BackendError::Permanent(message)
                }
            }
            // Killed by a signal (OOM killer, runner preemption)
            None => BackendError::Transient(format!("command terminated by signal: {}", stderr.trim())),
        }
    }
}

/// Last `::artifact::<ref>` line of the output, if any
pub fn parse_artifact(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(ARTIFACT_MARKER))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .last()
}

#[async_trait]
impl Backend for CommandBackend {
    async fn execute(&self, invocation: &Invocation) -> Result<BackendOutcome, BackendError> {
        let output = self.run(&invocation.command_line(), invocation).await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if !output.status.success() {
            let error = self.classify_failure(&output);
            warn!("{}", error);
            return Err(error.with_capture(BackendOutcome {
                artifact: parse_artifact(&stdout),
                output: stdout,
                exit_code: output.status.code(),
            }));
        }

        let artifact = parse_artifact(&stdout);

        debug!("command returned {} bytes of output", stdout.len());

        Ok(BackendOutcome {
            output: stdout,
            artifact,
            exit_code: output.status.code(),
        })
    }

    async fn verify(&self, invocation: &Invocation) -> Result<Verification, BackendError> {
        let Some(check) = invocation.parameter(VERIFY_PARAM) else {
            return Ok(Verification::Unknown);
        };

        let output = self.run(check, invocation).await?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let artifact = parse_artifact(&stdout)
                .or_else(|| invocation.parameter(ARTIFACT_PARAM).map(str::to_string));
            Ok(Verification::Succeeded(BackendOutcome {
                output: stdout,
                artifact,
                exit_code: output.status.code(),
            }))
        } else {
            Ok(Verification::Failed(
                self.classify_failure(&output).message().to_string(),
            ))
        }
    }

    fn name(&self) -> &str {
        "command"
    }
}
