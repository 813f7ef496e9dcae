//! Shared fixtures for integration tests: scripted tools and trigger events.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use docflow::adapters::{Tool, ToolContext, ToolRegistry, ValidationAdapter};
use docflow::core::{DeterministicPlanner, Orchestrator, RetryPolicy, SafetyLimits};
use docflow::domain::capability::{
    EXTRACTED_DATA, EXTRACT_DOCUMENT, NOTIFICATION_RESULT, POSTING_RESULT, POST_INVOICE,
    SEND_NOTIFICATION,
};
use docflow::error::ToolError;

type Behavior = Box<dyn Fn(u32, &Value) -> Result<Value, ToolError> + Send + Sync>;

/// One recorded tool call
#[derive(Debug, Clone)]
pub struct Call {
    pub args: Value,
    pub idempotency_key: String,
    pub process_id: String,
}

/// Tool whose answers are scripted per call number (1-based)
pub struct FakeTool {
    name: &'static str,
    output_key: &'static str,
    delay: Duration,
    behavior: Behavior,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTool {
    pub fn new<F>(name: &'static str, output_key: &'static str, behavior: F) -> Self
    where
        F: Fn(u32, &Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self {
            name,
            output_key,
            delay: Duration::ZERO,
            behavior: Box::new(behavior),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn ok(name: &'static str, output_key: &'static str, payload: Value) -> Self {
        Self::new(name, output_key, move |_, _| Ok(payload.clone()))
    }

    pub fn failing(name: &'static str, output_key: &'static str, error: ToolError) -> Self {
        Self::new(name, output_key, move |_, _| Err(error.clone()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of overlapping invocations seen
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for FakeTool {
    fn name(&self) -> &str {
        self.name
    }

    fn output_key(&self) -> &str {
        self.output_key
    }

    fn description(&self) -> &str {
        "scripted test tool"
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                args: args.clone(),
                idempotency_key: ctx.idempotency_key.clone(),
                process_id: ctx.process_id.to_string(),
            });
            calls.len() as u32
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.behavior)(call_number, &args)
    }
}

/// Extraction payload carrying every required invoice field
pub fn invoice_document() -> Value {
    json!({
        "source": "docs-bucket/invoice-42.pdf",
        "document": {
            "invoice_number": "INV-42",
            "date": "2024-03-01",
            "total_amount": "1200.00",
            "vendor_name": "ACME GmbH"
        },
        "kv": {}
    })
}

pub fn extract_ok() -> FakeTool {
    FakeTool::ok(EXTRACT_DOCUMENT, EXTRACTED_DATA, invoice_document())
}

pub fn post_ok() -> FakeTool {
    FakeTool::ok(
        POST_INVOICE,
        POSTING_RESULT,
        json!({ "accepted": true, "acknowledgement": { "document_id": "5100000042" } }),
    )
}

pub fn notify_ok() -> FakeTool {
    FakeTool::ok(SEND_NOTIFICATION, NOTIFICATION_RESULT, json!({ "delivered": true }))
}

/// Scripted extraction, posting and notification around the real validator
pub struct Fixture {
    pub extract: Arc<FakeTool>,
    pub post: Arc<FakeTool>,
    pub notify: Arc<FakeTool>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(extract_ok(), post_ok(), notify_ok())
    }

    pub fn with(extract: FakeTool, post: FakeTool, notify: FakeTool) -> Self {
        Self {
            extract: Arc::new(extract),
            post: Arc::new(post),
            notify: Arc::new(notify),
        }
    }

    pub fn registry(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register_arc(self.extract.clone());
        registry.register(ValidationAdapter::new());
        registry.register_arc(self.post.clone());
        registry.register_arc(self.notify.clone());
        registry
    }

    pub fn orchestrator(&self, limits: SafetyLimits) -> Orchestrator {
        Orchestrator::new(
            self.registry(),
            Arc::new(DeterministicPlanner::new()),
            limits,
            RetryPolicy::immediate(2),
        )
    }

    /// `status` argument of every notification, in order
    pub fn notification_statuses(&self) -> Vec<String> {
        self.notify
            .calls()
            .iter()
            .map(|c| c.args["status"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

/// Generous budgets for tests that are not about budgets
pub fn test_limits() -> SafetyLimits {
    SafetyLimits {
        max_steps: 16,
        step_timeout_ms: 2_000,
        run_timeout_ms: 10_000,
    }
}

pub fn s3_record(bucket: &str, key: &str) -> Value {
    json!({
        "eventSource": "object-storage",
        "eventName": "ObjectCreated:Put",
        "s3": { "bucket": { "name": bucket }, "object": { "key": key } }
    })
}

pub fn s3_event(bucket: &str, key: &str) -> Value {
    json!({ "Records": [s3_record(bucket, key)] })
}

pub fn s3_batch(bucket: &str, keys: &[&str]) -> Value {
    let records: Vec<Value> = keys.iter().map(|k| s3_record(bucket, k)).collect();
    json!({ "Records": records })
}
