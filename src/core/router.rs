//! Trigger routing and outward responses.
//!
//! `route` is a pure function of the classified event: the same event always
//! produces the same action, and nothing is executed here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::{RunResult, RunStatus, TriggerEvent};

/// Informational reply to synchronous HTTP calls
pub const STATIC_BODY: &str = "Thank you for connecting me. However, I am expected to process a document when a document is upload to S3 bucket.";

/// Reply to triggers that are neither storage events nor HTTP calls
pub const UNKNOWN_SOURCE: &str = "Unknown invocation source.";

/// Message attached to a completed run's response
pub const RUN_MESSAGE: &str = "S3 event processed successfully.";

pub const RUN_FAILED_MESSAGE: &str = "S3 event processing failed.";

pub const RUN_ABORTED_MESSAGE: &str = "S3 event processing aborted.";

/// Seconds a rejected caller should wait before retrying
pub const BUSY_RETRY_AFTER_SECS: u64 = 30;

/// What the router decided to do with a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RunPipeline { bucket: String, key: String },
    RespondStatic { status: u16, body: String },
    RespondError { status: u16, body: String },
}

/// Classify-then-decide for one trigger
pub fn route(event: &TriggerEvent) -> Action {
    match event {
        TriggerEvent::ObjectCreated { bucket, key, .. } => Action::RunPipeline {
            bucket: bucket.clone(),
            key: key.clone(),
        },
        TriggerEvent::HttpRequest { .. } => Action::RespondStatic {
            status: 200,
            body: STATIC_BODY.to_string(),
        },
        TriggerEvent::Unrecognized { .. } => Action::RespondError {
            status: 400,
            body: Value::String(UNKNOWN_SOURCE.to_string()).to_string(),
        },
    }
}

/// Outward `{statusCode, headers?, body}` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status_code: u16,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    pub body: String,
}

impl Response {
    pub fn new(status_code: u16, body: impl Into<String>) -> Self {
        Self {
            status_code,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    fn json(status_code: u16, body: &Value) -> Self {
        Self::new(status_code, body.to_string()).with_header("Content-Type", "application/json")
    }

    /// Informational reply to an HTTP call
    pub fn static_reply(status_code: u16, body: impl Into<String>) -> Self {
        Self::new(status_code, body).with_header("Content-Type", "text/plain")
    }

    /// Rejection of an unroutable trigger; `body` is already JSON
    pub fn error_reply(status_code: u16, body: impl Into<String>) -> Self {
        Self::new(status_code, body).with_header("Content-Type", "application/json")
    }

    /// Another run holds the lease; the caller should retry later
    pub fn busy() -> Self {
        Self::json(
            503,
            &json!({
                "message": "Another document is being processed. Retry later.",
                "retryable": true,
            }),
        )
        .with_header("Retry-After", BUSY_RETRY_AFTER_SECS.to_string())
    }

    /// Report a finished run. Every terminal status maps to 200.
    pub fn from_run(result: &RunResult, ignored_records: usize) -> Self {
        let steps: Vec<Value> = result
            .step_history
            .iter()
            .map(|o| {
                json!({
                    "tool": o.tool_name,
                    "attempt": o.attempt,
                    "success": o.success,
                })
            })
            .collect();

        Self::json(
            200,
            &json!({
                "message": run_message(&result.status),
                "processId": result.process_id,
                "bucket": result.bucket,
                "key": result.key,
                "status": result.status.label(),
                "summary": result.final_summary,
                "ignoredRecords": ignored_records,
                "steps": steps,
            }),
        )
    }

    /// The engine could not start a run (journal or lock I/O)
    pub fn internal_error(detail: &str) -> Self {
        Self::json(500, &json!({ "message": detail, "retryable": true }))
    }

    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }
}

fn run_message(status: &RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => RUN_MESSAGE,
        RunStatus::Failed { .. } => RUN_FAILED_MESSAGE,
        RunStatus::Aborted { .. } => RUN_ABORTED_MESSAGE,
    }
}
