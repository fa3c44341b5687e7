//! Pipeline configuration from YAML

use crate::core::{
    graph::DependencyGraph,
    run::RunSpec,
    step::{RetryPolicy, Step, StepDefaults, StepKind},
};
use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Pipeline version (optional)
    #[serde(default)]
    pub version: Option<String>,

    /// Global variables available to all steps
    #[serde(default)]
    variables: HashMap<String, Value>,

    /// Defaults applied to steps that don't override them
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Pipeline steps, in declaration order
    pub steps: Vec<StepConfig>,
}

/// Pipeline-wide step defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

/// Retry settings; missing fields fall back to the pipeline defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default)]
    pub backoff_base_secs: Option<f64>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Unique step identifier
    pub id: String,

    /// Human-readable step name
    #[serde(default)]
    pub name: Option<String>,

    /// Optional step description
    #[serde(default)]
    pub description: Option<String>,

    pub kind: StepKind,

    /// Command or endpoint the backend runs
    pub command: String,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// List of step IDs this step depends on
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Deployment target; required for deploy steps
    #[serde(default)]
    pub target: Option<String>,

    /// Timeout for this step (overrides defaults)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Retry policy for this step (overrides defaults)
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::invalid_spec(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> PipelineResult<Self> {
        let config: PipelineConfig =
            serde_yaml::from_str(yaml).map_err(|e| PipelineError::invalid_spec(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> PipelineResult<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::invalid_spec("pipeline name must not be empty"));
        }

        let mut seen_ids = HashSet::new();
        for step in &self.steps {
            if !seen_ids.insert(&step.id) {
                return Err(PipelineError::invalid_spec(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }

            if step.kind == StepKind::Rollback {
                return Err(PipelineError::invalid_spec(format!(
                    "step '{}' uses kind 'rollback', which is reserved for the rollback controller",
                    step.id
                )));
            }

            if step.kind == StepKind::Deploy && step.target.as_deref().map_or(true, str::is_empty) {
                return Err(PipelineError::invalid_spec(format!(
                    "deploy step '{}' must name a target",
                    step.id
                )));
            }

            if step.command.trim().is_empty() {
                return Err(PipelineError::invalid_spec(format!(
                    "step '{}' has an empty command",
                    step.id
                )));
            }
        }

        let defaults = self.step_defaults();
        for step in &self.steps {
            let step = Step::from_config(step, &defaults);
            let retry = step.retry();
            if step.invocation.timeout_secs == 0 {
                return Err(PipelineError::invalid_spec(format!(
                    "step '{}' has a zero timeout",
                    step.id
                )));
            }
            if retry.max_attempts == 0 {
                return Err(PipelineError::invalid_spec(format!(
                    "step '{}' must allow at least one attempt",
                    step.id
                )));
            }
            if !retry.backoff_base_secs.is_finite() || retry.backoff_base_secs < 0.0 {
                return Err(PipelineError::invalid_spec(format!(
                    "step '{}' has an invalid backoff base",
                    step.id
                )));
            }
        }

        // Cycles and dangling prerequisites
        self.build_graph()?;

        Ok(())
    }

    fn step_defaults(&self) -> StepDefaults {
        let fallback = StepDefaults::default();
        let retry = match &self.defaults.retry {
            Some(r) => RetryPolicy {
                max_attempts: r.max_attempts.unwrap_or(fallback.retry.max_attempts),
                backoff_base_secs: r.backoff_base_secs.unwrap_or(fallback.retry.backoff_base_secs),
            },
            None => fallback.retry,
        };

        StepDefaults {
            timeout_secs: self.defaults.timeout_secs.unwrap_or(fallback.timeout_secs),
            retry,
        }
    }

    fn build_graph(&self) -> PipelineResult<DependencyGraph> {
        let defaults = self.step_defaults();
        DependencyGraph::from_steps(
            self.steps
                .iter()
                .map(|s| Step::from_config(s, &defaults))
                .collect(),
        )
    }

    /// Get variables as string map
    ///
    /// Non-string scalars are rendered the way YAML prints them.
    pub fn variables_as_string_map(&self) -> HashMap<String, String> {
        self.variables
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    other => serde_yaml::to_string(other)
                        .unwrap_or_default()
                        .trim_end()
                        .to_string(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }

    /// Convert config to a run specification
    pub fn to_run_spec(&self) -> PipelineResult<RunSpec> {
        Ok(RunSpec {
            name: self.name.clone(),
            variables: self.variables_as_string_map(),
            graph: self.build_graph()?,
        })
    }
}
