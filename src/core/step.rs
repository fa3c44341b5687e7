//! Step domain model

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;
use std::time::Duration;

/// Upper bound for a single backoff sleep
pub const MAX_BACKOFF_SECS: f64 = 300.0;

/// Parameter carrying the artifact reference a deploy step ships
pub const ARTIFACT_PARAM: &str = "artifact";

/// Parameter carrying the deployment target name
pub const TARGET_PARAM: &str = "target";

/// What kind of work a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Build,
    Push,
    Provision,
    Deploy,
    Verify,
    /// Only produced by the rollback controller, never declared in a pipeline
    Rollback,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Build => "build",
            StepKind::Push => "push",
            StepKind::Provision => "provision",
            StepKind::Deploy => "deploy",
            StepKind::Verify => "verify",
            StepKind::Rollback => "rollback",
        }
    }

    /// Whether steps of this kind change what a target is running
    pub fn touches_target(&self) -> bool {
        matches!(self, StepKind::Deploy | StepKind::Rollback)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "build" => Some(StepKind::Build),
            "push" => Some(StepKind::Push),
            "provision" => Some(StepKind::Provision),
            "deploy" => Some(StepKind::Deploy),
            "verify" => Some(StepKind::Verify),
            "rollback" => Some(StepKind::Rollback),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How often and how patiently a step is retried
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Base of the exponential backoff, in seconds
    pub backoff_base_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_secs: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) attempt failed
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let secs = (self.backoff_base_secs * 2f64.powi(exponent)).min(MAX_BACKOFF_SECS);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Backend invocation descriptor
///
/// `parameters` are rendered against pipeline variables and prerequisite
/// artifacts; `command` placeholders are then filled from the parameters, so
/// a stored invocation can be replayed with a different `artifact`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub kind: StepKind,

    /// Command line or endpoint handed to the backend
    pub command: String,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    pub timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Invocation {
    /// Resolve placeholders for one execution
    ///
    /// Parameter values see `variables`. The command sees `variables` except
    /// names shadowed by a parameter; those stay in place for [`Self::command_line`].
    pub fn resolve(&self, variables: &HashMap<String, String>) -> Invocation {
        let parameters: BTreeMap<String, String> = self
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), render_template(v, |name| variables.get(name).cloned())))
            .collect();

        let command = render_template(&self.command, |name| {
            if parameters.contains_key(name) {
                None
            } else {
                variables.get(name).cloned()
            }
        });

        Invocation {
            kind: self.kind,
            command,
            parameters,
            timeout_secs: self.timeout_secs,
            retry: self.retry,
        }
    }

    /// The command with parameter placeholders filled in
    pub fn command_line(&self) -> String {
        render_template(&self.command, |name| self.parameters.get(name).cloned())
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn with_parameter(mut self, key: &str, value: impl Into<String>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// Replace `{{ name }}` placeholders; unknown names are left untouched
pub fn render_template<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    placeholder_regex()
        .replace_all(template, |caps: &Captures| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// A single step in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique step identifier
    pub id: String,

    /// Step IDs that must succeed first, in declaration order
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Deployment target (required for deploy steps)
    #[serde(default)]
    pub target: Option<String>,

    pub invocation: Invocation,
}

impl Step {
    /// Create a step from a step config
    pub fn from_config(config: &crate::core::config::StepConfig, defaults: &StepDefaults) -> Self {
        let retry = match &config.retry {
            Some(r) => RetryPolicy {
                max_attempts: r.max_attempts.unwrap_or(defaults.retry.max_attempts),
                backoff_base_secs: r.backoff_base_secs.unwrap_or(defaults.retry.backoff_base_secs),
            },
            None => defaults.retry,
        };

        Step {
            id: config.id.clone(),
            depends_on: config.depends_on.clone(),
            target: config.target.clone(),
            invocation: Invocation {
                kind: config.kind,
                command: config.command.clone(),
                parameters: config.parameters.clone(),
                timeout_secs: config.timeout_secs.unwrap_or(defaults.timeout_secs),
                retry,
            },
        }
    }

    pub fn kind(&self) -> StepKind {
        self.invocation.kind
    }

    pub fn retry(&self) -> RetryPolicy {
        self.invocation.retry
    }

    /// Check if all dependencies have succeeded
    pub fn dependencies_met(&self, succeeded: &HashSet<String>) -> bool {
        self.depends_on.iter().all(|dep| succeeded.contains(dep))
    }
}

#[derive(Debug, Clone)]
pub struct StepDefaults {
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: 600, // 10 minutes
            retry: RetryPolicy::default(),
        }
    }
}
