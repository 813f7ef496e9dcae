//! Run-scoped state: process identifiers, pipeline state, step outcomes and
//! the terminal run result.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ToolError;

use super::capability::SEND_NOTIFICATION;

/// Identifier correlating every tool call and log line of one run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    /// Derive an id from the triggering object and a per-run nonce.
    ///
    /// Same inputs give the same id; a fresh nonce per run keeps ids unique
    /// across runs on the same object.
    pub fn derive(bucket: &str, key: &str, nonce: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bucket.as_bytes());
        hasher.update(b"/");
        hasher.update(key.as_bytes());
        hasher.update(b":");
        hasher.update(nonce.as_bytes());
        let digest = hasher.finalize();
        Self(format!("proc-{}", hex::encode(&digest[..16])))
    }

    /// Wrap an externally supplied id (test runs)
    pub fn external(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named outputs of completed steps, in insertion order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub bucket: String,
    pub key: String,
    outputs: IndexMap<String, Value>,
}

impl PipelineState {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            outputs: IndexMap::new(),
        }
    }

    pub fn get(&self, output_key: &str) -> Option<&Value> {
        self.outputs.get(output_key)
    }

    pub fn contains(&self, output_key: &str) -> bool {
        self.outputs.contains_key(output_key)
    }

    /// Merge a step payload. Re-inserting an existing key keeps its position.
    pub fn merge(&mut self, output_key: impl Into<String>, payload: Value) {
        self.outputs.insert(output_key.into(), payload);
    }

    /// Output keys in the order they were first produced
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    pub fn outputs(&self) -> &IndexMap<String, Value> {
        &self.outputs
    }
}

/// Result of one tool invocation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub tool_name: String,

    /// 1-based attempt number for this invocation
    pub attempt: u32,

    pub success: bool,

    /// Arguments the tool was called with
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,

    pub duration_ms: u64,

    pub started_at: DateTime<Utc>,
}

impl StepOutcome {
    pub fn succeeded(
        tool_name: impl Into<String>,
        attempt: u32,
        payload: Value,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            attempt,
            success: true,
            args: Value::Null,
            payload: Some(payload),
            error: None,
            duration_ms,
            started_at,
        }
    }

    pub fn failed(
        tool_name: impl Into<String>,
        attempt: u32,
        error: ToolError,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            attempt,
            success: false,
            args: Value::Null,
            payload: None,
            error: Some(error),
            duration_ms,
            started_at,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Same tool, same arguments
    pub fn same_call(&self, tool_name: &str, args: &Value) -> bool {
        self.tool_name == tool_name && &self.args == args
    }

    pub fn is_notification(&self) -> bool {
        self.tool_name == SEND_NOTIFICATION
    }
}

/// Terminal status of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    /// Every step succeeded and the planner declared completion
    Completed,

    /// A tool failed permanently or the planner gave up
    Failed { reason: String },

    /// A step or wall-clock budget ran out
    Aborted { reason: String },
}

impl RunStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Aborted { .. } => "aborted",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Completed => None,
            Self::Failed { reason } | Self::Aborted { reason } => Some(reason),
        }
    }
}

/// Terminal value of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub process_id: ProcessId,
    pub bucket: String,
    pub key: String,
    pub status: RunStatus,
    pub step_history: Vec<StepOutcome>,
    pub final_summary: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// Number of recorded attempts for one tool
    pub fn attempts_of(&self, tool_name: &str) -> usize {
        self.step_history
            .iter()
            .filter(|o| o.tool_name == tool_name)
            .count()
    }

    /// Position of the first successful outcome of a tool
    pub fn first_success_of(&self, tool_name: &str) -> Option<usize> {
        self.step_history
            .iter()
            .position(|o| o.tool_name == tool_name && o.success)
    }
}
