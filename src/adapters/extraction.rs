//! Extraction adapter: dispatches a document to the sibling extraction
//! service and returns its structured content.
//!
//! The service is reached through the function-invocation REST path
//! (`/2015-03-31/functions/{name}/invocations`), which is what local
//! function runtimes and invoke proxies expose.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::domain::capability::{EXTRACTED_DATA, EXTRACT_DOCUMENT};
use crate::error::{ToolError, ToolErrorKind};

use super::{required_str, Tool, ToolContext};

/// Header set by function runtimes when the invoked function raised
const FUNCTION_ERROR_HEADER: &str = "x-amz-function-error";

pub struct ExtractionAdapter {
    client: reqwest::Client,
    invoke_url: String,
    image_output_path: String,
}

impl ExtractionAdapter {
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        function_name: &str,
        image_output_path: &str,
    ) -> Self {
        Self {
            client,
            invoke_url: invoke_url(endpoint, function_name),
            image_output_path: image_output_path.to_string(),
        }
    }

    pub fn invoke_url(&self) -> &str {
        &self.invoke_url
    }
}

fn invoke_url(endpoint: &str, function_name: &str) -> String {
    format!(
        "{}/2015-03-31/functions/{}/invocations",
        endpoint.trim_end_matches('/'),
        function_name
    )
}

/// Build the request the extraction service expects
pub fn request_payload(process_id: &str, bucket: &str, key: &str, image_output_path: &str) -> Value {
    json!({
        "processId": process_id,
        "tool": "extract_document",
        "parameters": {
            "bucket": bucket,
            "key": key,
            "imageOutputPath": image_output_path,
        }
    })
}

/// Interpret the extraction service's answer.
///
/// Proxy-style `{statusCode, body}` envelopes are unwrapped first. The
/// document comes from `extracted_table`, else `output`.
pub fn interpret_response(
    status: u16,
    function_error: Option<&str>,
    body: &str,
    source: &str,
) -> Result<Value, ToolError> {
    if !(200..300).contains(&status) {
        return Err(ToolError::new(
            ToolErrorKind::Status,
            format!("extraction service returned {}: {}", status, truncate(body)),
        ));
    }

    if let Some(kind) = function_error {
        return Err(ToolError::new(
            ToolErrorKind::Remote,
            format!("extraction function error ({}): {}", kind, truncate(body)),
        ));
    }

    let mut parsed: Value = serde_json::from_str(body)
        .map_err(|e| ToolError::malformed(format!("extraction response is not JSON: {}", e)))?;

    if let (Some(code), Some(inner)) = (
        parsed.get("statusCode").and_then(Value::as_u64),
        parsed.get("body").cloned(),
    ) {
        if !(200..300).contains(&code) {
            return Err(ToolError::new(
                ToolErrorKind::Remote,
                format!("extraction function answered {}: {}", code, inner),
            ));
        }
        parsed = match inner {
            Value::String(s) => serde_json::from_str(&s).map_err(|e| {
                ToolError::malformed(format!("extraction body is not JSON: {}", e))
            })?,
            other => other,
        };
    }

    let document = parsed
        .get("extracted_table")
        .or_else(|| parsed.get("output"))
        .filter(|v| !v.is_null())
        .cloned()
        .ok_or_else(|| {
            ToolError::malformed("extraction response has neither 'extracted_table' nor 'output'")
        })?;

    let kv = parsed.get("kv").cloned().unwrap_or_else(|| json!({}));

    Ok(json!({
        "source": source,
        "document": document,
        "kv": kv,
    }))
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[async_trait]
impl Tool for ExtractionAdapter {
    fn name(&self) -> &str {
        EXTRACT_DOCUMENT
    }

    fn output_key(&self) -> &str {
        EXTRACTED_DATA
    }

    fn description(&self) -> &str {
        "Extract text and structured data from the uploaded document. Args: {bucket, key}."
    }

    #[instrument(skip(self, args, ctx), fields(process_id = %ctx.process_id))]
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let bucket = required_str(&args, "bucket")?;
        let key = required_str(&args, "key")?;
        let payload = request_payload(ctx.process_id.as_str(), bucket, key, &self.image_output_path);

        debug!(url = %self.invoke_url, "Invoking extraction service");

        let response = self
            .client
            .post(&self.invoke_url)
            .json(&payload)
            .send()
            .await?;

        let status = response.status().as_u16();
        let function_error = response
            .headers()
            .get(FUNCTION_ERROR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        let source = format!("{}/{}", bucket, key);
        interpret_response(status, function_error.as_deref(), &body, &source)
    }
}
