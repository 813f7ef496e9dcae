//! Inbound trigger events.
//!
//! A trigger arrives once per invocation as raw JSON. It is classified into
//! one of three shapes before anything else happens.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `eventSource` values that mark an object-storage creation record
pub const OBJECT_STORAGE_SOURCES: &[&str] = &["object-storage", "aws:s3"];

/// A classified inbound event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TriggerEvent {
    /// A document was created in a bucket
    ObjectCreated {
        bucket: String,
        key: String,
        /// Records after the first one in the same batch (not processed)
        ignored_records: usize,
    },

    /// A synchronous HTTP call
    HttpRequest {
        method: String,
        path: String,
        body: Option<String>,
    },

    /// Anything else
    Unrecognized { raw: Value },
}

impl TriggerEvent {
    /// Classify a raw JSON event.
    ///
    /// Object-storage records win over HTTP fields when both are present.
    pub fn classify(raw: &Value) -> Self {
        if let Some(event) = Self::object_created(raw) {
            return event;
        }

        if let Some(method) = http_method(raw) {
            let path = raw
                .get("path")
                .or_else(|| raw.get("rawPath"))
                .and_then(Value::as_str)
                .unwrap_or("/")
                .to_string();
            let body = match raw.get("body") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Null) | None => None,
                Some(other) => Some(other.to_string()),
            };
            return Self::HttpRequest { method, path, body };
        }

        Self::Unrecognized { raw: raw.clone() }
    }

    fn object_created(raw: &Value) -> Option<Self> {
        let records = raw.get("Records")?.as_array()?;
        let first = records.first()?;

        let source = first.get("eventSource")?.as_str()?;
        if !OBJECT_STORAGE_SOURCES.contains(&source) {
            return None;
        }

        let s3 = first.get("s3")?;
        let bucket = s3.pointer("/bucket/name")?.as_str()?;
        let key = s3.pointer("/object/key")?.as_str()?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }

        Some(Self::ObjectCreated {
            bucket: bucket.to_string(),
            key: key.to_string(),
            ignored_records: records.len() - 1,
        })
    }

    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ObjectCreated { .. } => "object_created",
            Self::HttpRequest { .. } => "http_request",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }
}

/// REST-style `httpMethod` or function-URL style `requestContext.http.method`
fn http_method(raw: &Value) -> Option<String> {
    raw.get("httpMethod")
        .or_else(|| raw.pointer("/requestContext/http/method"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Build the JSON shape of an HTTP trigger (used by the HTTP host)
pub fn http_event(method: &str, path: &str, body: Option<String>) -> Value {
    serde_json::json!({
        "httpMethod": method,
        "path": path,
        "body": body,
    })
}
