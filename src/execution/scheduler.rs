//! Execution scheduler - determines which steps to run next

use crate::core::{DependencyGraph, Progress};
use std::fmt;
use std::str::FromStr;

/// Strategy for scheduling step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// Execute steps in dependency order, one at a time
    Sequential,

    /// Execute all ready steps in parallel
    #[default]
    Parallel,

    /// Limited parallelism (max N concurrent steps)
    LimitedParallel(usize),
}

impl FromStr for SchedulingStrategy {
    type Err = String;

    /// Accepts `sequential`, `parallel` or `parallel-limited:N`
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sequential" => Ok(SchedulingStrategy::Sequential),
            "parallel" => Ok(SchedulingStrategy::Parallel),
            other => {
                let limit = other
                    .strip_prefix("parallel-limited:")
                    .ok_or_else(|| format!("unknown scheduling strategy '{}'", other))?;
                match limit.parse::<usize>() {
                    Ok(n) if n > 0 => Ok(SchedulingStrategy::LimitedParallel(n)),
                    _ => Err(format!("invalid parallelism limit '{}'", limit)),
                }
            }
        }
    }
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingStrategy::Sequential => f.write_str("sequential"),
            SchedulingStrategy::Parallel => f.write_str("parallel"),
            SchedulingStrategy::LimitedParallel(n) => write!(f, "parallel-limited:{}", n),
        }
    }
}

/// Scheduler for determining which steps to run
#[derive(Debug, Clone, Default)]
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Ready steps to dispatch now, given how many are already in flight
    pub fn next_steps(&self, graph: &DependencyGraph, progress: &Progress, in_flight: usize) -> Vec<String> {
        let capacity = match self.strategy {
            SchedulingStrategy::Sequential => 1usize.saturating_sub(in_flight),
            SchedulingStrategy::Parallel => usize::MAX,
            SchedulingStrategy::LimitedParallel(max) => max.saturating_sub(in_flight),
        };

        if capacity == 0 {
            return vec![];
        }

        graph
            .ready_steps(progress)
            .into_iter()
            .take(capacity)
            .map(|s| s.id.clone())
            .collect()
    }
}
