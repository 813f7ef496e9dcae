//! Domain types for the docflow orchestrator.
//!
//! This module contains the core data structures:
//! - Trigger: classified inbound events
//! - Capability: declared tools and their output keys
//! - Run: process ids, pipeline state, step outcomes, run results
//! - Events: journal records

pub mod capability;
pub mod events;
pub mod run;
pub mod trigger;

// Re-export commonly used types
pub use capability::{Capability, CapabilitySet};
pub use events::{Event, EventType, StepStatus};
pub use run::{PipelineState, ProcessId, RunResult, RunStatus, StepOutcome};
pub use trigger::TriggerEvent;
