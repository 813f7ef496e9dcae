//! docflow - document pipeline orchestrator
//!
//! Takes a newly uploaded document through extraction, validation and
//! posting to a system of record, notifying a human channel at the start
//! and end of every run.
//!
//! # Architecture
//!
//! - A trigger is classified and routed: storage events start a run, HTTP
//!   calls get a fixed reply, anything else is rejected
//! - A concurrency guard admits one run at a time per deployment
//! - The execution loop asks a planner for the next tool, invokes it with
//!   retries and timeouts, and folds the result into pipeline state
//! - Every transition is appended to a per-run JSONL journal
//!
//! # Modules
//!
//! - `adapters`: tool adapters and the model-driven planner
//! - `core`: router, planner, execution loop, guard, journal, budgets
//! - `domain`: triggers, capabilities, run state, journal events
//! - `handler`: one trigger in, one response out
//! - `server`: HTTP host
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Handle a storage notification
//! docflow invoke --event s3-event.json
//!
//! # Run one document directly
//! docflow run --bucket docs-bucket --key invoice-42.pdf
//!
//! # Inspect a run
//! docflow status <process-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod handler;
pub mod server;

// Re-export main types at crate root for convenience
pub use config::Config;
pub use core::{ConcurrencyGuard, Orchestrator, Response};
pub use domain::{ProcessId, RunResult, RunStatus, TriggerEvent};
pub use error::ToolError;
pub use handler::DocumentHandler;
