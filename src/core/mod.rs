//! Core domain models for deployment pipelines
//!
//! This module defines the fundamental data structures that represent
//! steps, their dependency graph, runs and recorded results.

pub mod config;
pub mod context;
pub mod graph;
pub mod run;
pub mod state;
pub mod step;

pub use context::*;
pub use graph::*;
pub use run::*;
pub use state::*;
pub use step::*;
