//! Tool adapters for external collaborators.
//!
//! Every capability (extraction, validation, posting, notification) sits
//! behind the same [`Tool`] contract so the execution loop never sees
//! transport details.

pub mod extraction;
pub mod model;
pub mod notification;
pub mod posting;
pub mod validation;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::domain::{Capability, CapabilitySet, ProcessId};
use crate::error::ToolError;

pub use extraction::ExtractionAdapter;
pub use model::ModelPlanner;
pub use notification::NotificationAdapter;
pub use posting::PostingAdapter;
pub use validation::ValidationAdapter;

/// Per-call context handed to a tool
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub process_id: ProcessId,

    /// Stable key for this invocation; identical across retries
    pub idempotency_key: String,
}

impl ToolContext {
    pub fn new(process_id: ProcessId, idempotency_key: impl Into<String>) -> Self {
        Self {
            process_id,
            idempotency_key: idempotency_key.into(),
        }
    }
}

/// Trait for external capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the planner selects this tool by
    fn name(&self) -> &str;

    /// Pipeline state key the payload is merged under
    fn output_key(&self) -> &str;

    /// Human-readable description
    fn description(&self) -> &str;

    /// Invoke the capability with structured arguments
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Registry of the tools one deployment declares
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if !self.order.contains(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// The declared capability set, in registration order
    pub fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::new(
            self.order
                .iter()
                .filter_map(|name| self.tools.get(name))
                .map(|tool| Capability {
                    name: tool.name().to_string(),
                    output_key: tool.output_key().to_string(),
                    description: tool.description().to_string(),
                })
                .collect(),
        )
    }

    /// Build the four standard adapters from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = http_client(config.limits.step_timeout())?;

        let mut registry = Self::new();
        registry.register(ExtractionAdapter::new(
            client.clone(),
            &config.extraction_endpoint,
            &config.extraction_function,
            &config.image_output_path,
        ));
        registry.register(ValidationAdapter::new());
        registry.register(PostingAdapter::new(
            client.clone(),
            config.posting_endpoint.clone(),
        ));
        registry.register(NotificationAdapter::new(
            client,
            config.notification_endpoint.clone(),
        ));
        Ok(registry)
    }
}

/// Shared HTTP client for collaborator calls
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("docflow/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

/// Parse a response body as JSON, falling back to a JSON string
pub(crate) fn body_to_value(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

/// Fetch a required argument
pub(crate) fn required_arg<'a>(args: &'a Value, name: &str) -> Result<&'a Value, ToolError> {
    match args.get(name) {
        Some(Value::Null) | None => Err(ToolError::invalid_arguments(format!(
            "missing required argument '{}'",
            name
        ))),
        Some(value) => Ok(value),
    }
}

/// Fetch a required non-empty string argument
pub(crate) fn required_str<'a>(args: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    required_arg(args, name)?
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ToolError::invalid_arguments(format!("argument '{}' must be a non-empty string", name))
        })
}
