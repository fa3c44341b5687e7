//! Dependency graph over pipeline steps

use crate::core::step::Step;
use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Steps in declaration order, indexed by id
///
/// Prerequisites may name steps that are added later; cycles are rejected at
/// the moment the closing step is added. [`DependencyGraph::ensure_complete`]
/// rejects prerequisites that never got declared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Step>", into = "Vec<Step>")]
pub struct DependencyGraph {
    steps: Vec<Step>,
    index: HashMap<String, usize>,
}

/// Which steps of a run have been handed out and which have succeeded
#[derive(Debug, Clone, Default)]
pub struct Progress {
    dispatched: HashSet<String>,
    succeeded: HashSet<String>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dispatched(&mut self, step_id: &str) {
        self.dispatched.insert(step_id.to_string());
    }

    pub fn mark_succeeded(&mut self, step_id: &str) {
        self.dispatched.insert(step_id.to_string());
        self.succeeded.insert(step_id.to_string());
    }

    pub fn is_dispatched(&self, step_id: &str) -> bool {
        self.dispatched.contains(step_id)
    }

    pub fn succeeded(&self) -> &HashSet<String> {
        &self.succeeded
    }

    pub fn succeeded_count(&self) -> usize {
        self.succeeded.len()
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a complete graph from steps in declaration order
    pub fn from_steps(steps: Vec<Step>) -> PipelineResult<Self> {
        let mut graph = Self::new();
        for step in steps {
            graph.add_step(step)?;
        }
        graph.ensure_complete()?;
        Ok(graph)
    }

    /// Add a step, failing with [`PipelineError::Cycle`] if its edges close a cycle
    pub fn add_step(&mut self, step: Step) -> PipelineResult<()> {
        if self.index.contains_key(&step.id) {
            return Err(PipelineError::invalid_spec(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }

        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(PipelineError::Cycle {
                    step: step.id.clone(),
                    via: step.id.clone(),
                });
            }
            if self.reaches(dep, &step.id) {
                return Err(PipelineError::Cycle {
                    step: step.id.clone(),
                    via: dep.clone(),
                });
            }
        }

        self.index.insert(step.id.clone(), self.steps.len());
        self.steps.push(step);
        Ok(())
    }

    /// Whether following `depends_on` edges from `from` arrives at `to`
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from.to_string()];
        let mut seen = HashSet::new();

        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(step) = self.step(&current) {
                stack.extend(step.depends_on.iter().cloned());
            }
        }

        false
    }

    /// Reject prerequisites that name undeclared steps
    pub fn ensure_complete(&self) -> PipelineResult<()> {
        for step in &self.steps {
            for dep in &step.depends_on {
                if !self.index.contains_key(dep) {
                    return Err(PipelineError::invalid_spec(format!(
                        "step '{}' depends on non-existent step '{}'",
                        step.id, dep
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    /// Steps in declaration order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps whose prerequisites all succeeded and which were not dispatched yet
    ///
    /// Returned in declaration order so identical graphs dispatch identically.
    pub fn ready_steps(&self, progress: &Progress) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| !progress.is_dispatched(&s.id) && s.dependencies_met(progress.succeeded()))
            .collect()
    }

    /// Steps that list `id` as a prerequisite
    pub fn dependents_of(&self, id: &str) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d == id))
            .collect()
    }

    /// Topological order, breaking ties by declaration order
    pub fn topological_order(&self) -> Vec<&str> {
        let mut progress = Progress::new();
        let mut order = Vec::with_capacity(self.steps.len());

        loop {
            let next = self
                .ready_steps(&progress)
                .first()
                .map(|s| s.id.clone());
            match next {
                Some(id) => {
                    progress.mark_succeeded(&id);
                    if let Some(step) = self.step(&id) {
                        order.push(step.id.as_str());
                    }
                }
                None => break,
            }
        }

        order
    }
}

impl TryFrom<Vec<Step>> for DependencyGraph {
    type Error = PipelineError;

    fn try_from(steps: Vec<Step>) -> Result<Self, Self::Error> {
        Self::from_steps(steps)
    }
}

impl From<DependencyGraph> for Vec<Step> {
    fn from(graph: DependencyGraph) -> Self {
        graph.steps
    }
}
