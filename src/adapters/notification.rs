//! Notification adapter: tells a human channel how a run is going.
//!
//! Talks to the invoice-notifier service (`POST /notify`). Callers treat
//! every failure here as a warning; a run never fails because a
//! notification did not go out.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::domain::capability::{NOTIFICATION_RESULT, SEND_NOTIFICATION};
use crate::error::{ToolError, ToolErrorKind};

use super::{body_to_value, required_str, Tool, ToolContext};

pub struct NotificationAdapter {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl NotificationAdapter {
    pub fn new(client: reqwest::Client, endpoint: Option<String>) -> Self {
        Self { client, endpoint }
    }
}

/// Build the notifier request body
pub fn request_payload(process_id: &str, args: &Value, message: &str) -> Value {
    let invoice_id = match args.get("invoice_id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "unknown".to_string(),
    };
    let status = args.get("status").and_then(Value::as_str).unwrap_or("info");

    json!({
        "processId": process_id,
        "invoice_id": invoice_id,
        "status": status,
        "message": message,
    })
}

#[async_trait]
impl Tool for NotificationAdapter {
    fn name(&self) -> &str {
        SEND_NOTIFICATION
    }

    fn output_key(&self) -> &str {
        NOTIFICATION_RESULT
    }

    fn description(&self) -> &str {
        "Send a progress notification to the operator channel. Args: {message, status?, invoice_id?}."
    }

    #[instrument(skip(self, args, ctx), fields(process_id = %ctx.process_id))]
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let message = required_str(&args, "message")?;

        let Some(endpoint) = self.endpoint.as_deref() else {
            info!(%message, "Notification (no notifier endpoint configured)");
            return Ok(json!({ "delivered": false, "channel": "log" }));
        };

        let response = self
            .client
            .post(endpoint)
            .json(&request_payload(ctx.process_id.as_str(), &args, message))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ToolError::new(
                ToolErrorKind::Status,
                format!("notifier returned {}: {}", status.as_u16(), body),
            ));
        }

        Ok(json!({ "delivered": true, "response": body_to_value(&body) }))
    }
}
