//! Step context - variables and upstream artifacts visible to a step

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Execution context for one step dispatch
///
/// Contains pipeline variables and the artifacts reported by steps that
/// already succeeded in the same run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepContext {
    pub run_id: Uuid,

    /// Global and user-defined variables
    pub variables: HashMap<String, String>,

    /// Artifacts from succeeded steps (step_id -> artifact reference)
    pub artifacts: HashMap<String, String>,

    /// The step being executed
    pub step_id: String,
}

impl StepContext {
    pub fn new(run_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            run_id,
            variables: HashMap::new(),
            artifacts: HashMap::new(),
            step_id: step_id.into(),
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn set_artifact(&mut self, step_id: &str, artifact: String) {
        self.artifacts.insert(step_id.to_string(), artifact);
    }

    pub fn get_artifact(&self, step_id: &str) -> Option<&String> {
        self.artifacts.get(step_id)
    }

    /// Get all variables available for placeholder rendering
    pub fn rendering_variables(&self) -> HashMap<String, String> {
        let mut vars = self.variables.clone();

        for (step_id, artifact) in &self.artifacts {
            vars.insert(format!("steps.{}.artifact", step_id), artifact.clone());
        }

        vars.insert("run_id".to_string(), self.run_id.to_string());
        vars.insert("current_step".to_string(), self.step_id.clone());

        vars
    }
}
