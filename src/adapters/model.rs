//! Model-driven planner.
//!
//! Sends the run's state, history and capability set to a planning endpoint
//! (a model gateway configured with `MODEL_ID` and the prompt at
//! `PROMPT_BUCKET`/`PROMPT_KEY`) and reads back one decision:
//!
//! ```json
//! {"action": "invoke", "tool": "extract_document", "args": {"bucket": "b", "key": "k"}}
//! {"action": "complete"}
//! {"action": "fail", "reason": "document is not an invoice"}
//! ```
//!
//! Transport and parse problems become `Fail` decisions. The engine wraps
//! this planner in the ordering guard like any other.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::core::planner::{Decision, FailReason, Planner};
use crate::domain::{Capability, CapabilitySet, PipelineState, StepOutcome};

use super::http_client;

pub struct ModelPlanner {
    client: reqwest::Client,
    endpoint: String,
    model_id: String,
    region: String,
    prompt_ref: Option<String>,
}

/// Body sent to the planning endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest<'a> {
    pub model_id: &'a str,
    pub region: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_ref: Option<&'a str>,
    pub bucket: &'a str,
    pub key: &'a str,
    pub capabilities: Vec<&'a Capability>,
    pub state: Value,
    pub history: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ModelDecision {
    Invoke {
        tool: String,
        #[serde(default)]
        args: Value,
    },
    Complete,
    Fail {
        #[serde(default)]
        reason: String,
    },
}

impl ModelPlanner {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        model_id: impl Into<String>,
        region: impl Into<String>,
        prompt_ref: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            model_id: model_id.into(),
            region: region.into(),
            prompt_ref,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let endpoint = config
            .planner_endpoint
            .clone()
            .context("PLANNER_ENDPOINT is required for the model planner")?;
        let model_id = config
            .model_id
            .clone()
            .context("MODEL_ID is required for the model planner")?;
        let client = http_client(config.limits.step_timeout())?;

        Ok(Self::new(
            client,
            endpoint,
            model_id,
            config.region.clone(),
            config.prompt.as_ref().map(|p| p.uri()),
        ))
    }

    /// Build the request body for one planning call
    pub fn request<'a>(
        &'a self,
        state: &'a PipelineState,
        capabilities: &'a CapabilitySet,
        history: &[StepOutcome],
    ) -> PlanRequest<'a> {
        PlanRequest {
            model_id: &self.model_id,
            region: &self.region,
            prompt_ref: self.prompt_ref.as_deref(),
            bucket: &state.bucket,
            key: &state.key,
            capabilities: capabilities.iter().collect(),
            state: json!(state.outputs()),
            // Payloads are already folded into state
            history: history
                .iter()
                .map(|o| {
                    json!({
                        "tool": o.tool_name,
                        "attempt": o.attempt,
                        "success": o.success,
                        "error": o.error.as_ref().map(|e| e.to_string()),
                    })
                })
                .collect(),
        }
    }
}

/// Parse the planning endpoint's answer.
///
/// Accepts the decision object itself, a JSON string holding it, or text
/// with one JSON object embedded (raw model output).
pub fn parse_decision(body: &str) -> Decision {
    let candidate = match serde_json::from_str::<Value>(body) {
        Ok(Value::String(text)) => embedded_object(&text).map(str::to_string),
        Ok(value) => Some(value.to_string()),
        Err(_) => embedded_object(body).map(str::to_string),
    };

    let Some(candidate) = candidate else {
        return Decision::Fail(FailReason::PlannerError(
            "planner answer holds no JSON object".to_string(),
        ));
    };

    match serde_json::from_str::<ModelDecision>(&candidate) {
        Ok(ModelDecision::Invoke { tool, args }) => {
            let args = if args.is_null() { json!({}) } else { args };
            Decision::Invoke { tool, args }
        }
        Ok(ModelDecision::Complete) => Decision::Complete,
        Ok(ModelDecision::Fail { reason }) => Decision::Fail(FailReason::PlannerError(
            if reason.is_empty() {
                "planner gave up without a reason".to_string()
            } else {
                reason
            },
        )),
        Err(e) => Decision::Fail(FailReason::PlannerError(format!(
            "unreadable planner decision: {}",
            e
        ))),
    }
}

fn embedded_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

#[async_trait]
impl Planner for ModelPlanner {
    fn name(&self) -> &str {
        "model"
    }

    #[instrument(skip_all, fields(model_id = %self.model_id))]
    async fn next(
        &self,
        state: &PipelineState,
        capabilities: &CapabilitySet,
        history: &[StepOutcome],
    ) -> Decision {
        let request = self.request(state, capabilities, history);

        let response = match self.client.post(&self.endpoint).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Planner endpoint unreachable");
                return Decision::Fail(FailReason::PlannerError(format!(
                    "planner endpoint unreachable: {}",
                    e
                )));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Decision::Fail(FailReason::PlannerError(format!(
                    "failed to read planner answer: {}",
                    e
                )))
            }
        };

        if !status.is_success() {
            warn!(status = status.as_u16(), "Planner endpoint returned an error");
            return Decision::Fail(FailReason::PlannerError(format!(
                "planner endpoint returned {}",
                status.as_u16()
            )));
        }

        let decision = parse_decision(&body);
        debug!(?decision, "Planner decision");
        decision
    }
}
