//! Scenario-based tests for deployline

mod helpers;

#[cfg(feature = "sqlite")]
mod durability;
mod idempotency;
mod operator_rollback;
mod ordering;
mod reconciliation;
mod rollback_on_failure;
mod success_chain;
