//! Core orchestration logic.
//!
//! This module contains:
//! - Router: trigger classification to actions and outward responses
//! - Planner: step selection and the ordering guard
//! - Orchestrator: the execution loop
//! - Guard: one run at a time
//! - EventStore: append-only run journal
//! - Safety: budgets and retry policy

pub mod event_store;
pub mod guard;
pub mod orchestrator;
pub mod planner;
pub mod router;
pub mod safety;

// Re-export commonly used types
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use guard::{ConcurrencyGuard, GuardError, Lease};
pub use orchestrator::Orchestrator;
pub use planner::{Decision, DeterministicPlanner, FailReason, GuardedPlanner, Planner};
pub use router::{route, Action, Response};
pub use safety::{BudgetViolation, RetryPolicy, SafetyLimits, SafetyTracker};
