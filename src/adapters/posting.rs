//! Posting adapter: submits validated invoice data to the downstream system
//! of record.
//!
//! A 4xx answer is a structured rejection (`accepted: false`) that the
//! planner acts on; 5xx answers and transport problems are tool failures
//! subject to retry. Without a configured endpoint the adapter acknowledges
//! in dry-run mode.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::domain::capability::{POSTING_RESULT, POST_INVOICE};
use crate::error::{ToolError, ToolErrorKind};

use super::{body_to_value, required_arg, Tool, ToolContext};

pub struct PostingAdapter {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl PostingAdapter {
    pub fn new(client: reqwest::Client, endpoint: Option<String>) -> Self {
        Self { client, endpoint }
    }

    pub fn is_dry_run(&self) -> bool {
        self.endpoint.is_none()
    }
}

/// Interpret the system of record's answer
pub fn interpret_response(status: u16, body: &str) -> Result<Value, ToolError> {
    match status {
        200..=299 => Ok(json!({
            "accepted": true,
            "acknowledgement": body_to_value(body),
        })),
        400..=499 => Ok(json!({
            "accepted": false,
            "status": status,
            "reason": body_to_value(body),
        })),
        _ => Err(ToolError::new(
            ToolErrorKind::Status,
            format!("system of record returned {}", status),
        )),
    }
}

#[async_trait]
impl Tool for PostingAdapter {
    fn name(&self) -> &str {
        POST_INVOICE
    }

    fn output_key(&self) -> &str {
        POSTING_RESULT
    }

    fn description(&self) -> &str {
        "Post validated invoice data to the system of record. Args: {extracted_data, validation_result}."
    }

    #[instrument(skip(self, args, ctx), fields(process_id = %ctx.process_id))]
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let extracted = required_arg(&args, "extracted_data")?;

        let Some(endpoint) = self.endpoint.as_deref() else {
            info!("Posting endpoint not configured, acknowledging in dry-run mode");
            return Ok(json!({
                "accepted": true,
                "dry_run": true,
                "acknowledgement": "Invoice posting skipped: no posting endpoint configured",
            }));
        };

        let response = self
            .client
            .post(endpoint)
            .header("Idempotency-Key", &ctx.idempotency_key)
            .json(&json!({
                "processId": ctx.process_id,
                "extracted_data": extracted,
            }))
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        interpret_response(status, &body)
    }
}
