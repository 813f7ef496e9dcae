//! Journal events for pipeline runs.
//!
//! Every run-level and step-level transition is recorded as an immutable
//! event in an append-only log, giving operators an audit trail per run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::ProcessId;

/// A single event in the append-only run journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub process_id: ProcessId,

    /// Tool name (if applicable)
    pub tool: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{process_id}:{tool}:{args_hash}"
    pub idempotency_key: String,

    /// Human-readable summary (NO document contents)
    pub payload_summary: String,

    /// Current status of the step/run
    pub status: StepStatus,

    /// Time taken in milliseconds (for finished steps)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        process_id: ProcessId,
        tool: Option<String>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: StepStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            process_id,
            tool,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    /// Whether this event closes the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type,
            EventType::RunCompleted | EventType::RunFailed | EventType::RunAborted
        )
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunCompleted,
    RunFailed,

    /// Step or wall-clock budget exhausted
    RunAborted,

    StepStarted,
    StepCompleted,

    /// A step failed permanently
    StepFailed,

    /// A step failed and will be attempted again
    StepRetrying,

    /// A bracketing notification could not be delivered (never fatal)
    NotificationFailed,
}

/// Status of a step or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}
