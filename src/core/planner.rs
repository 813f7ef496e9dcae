//! Step planning.
//!
//! A [`Planner`] looks at what a run has produced so far and picks the next
//! tool, or declares the run complete or failed. Planners are stateless:
//! everything they decide on is passed in, so a fixed state machine and a
//! model-driven planner are interchangeable.
//!
//! The engine never runs a planner directly. It always wraps it in a
//! [`GuardedPlanner`], which enforces the step budget and the
//! extract → validate → post ordering no matter what the inner planner says.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::domain::capability::{
    EXTRACTED_DATA, EXTRACT_DOCUMENT, POSTING_RESULT, POST_INVOICE, SEND_NOTIFICATION,
    VALIDATE_INVOICE_DATA, VALIDATION_RESULT,
};
use crate::domain::{CapabilitySet, PipelineState, StepOutcome};

/// What to do next
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Call a tool with the given arguments
    Invoke { tool: String, args: Value },

    /// The run is done
    Complete,

    /// The run cannot continue
    Fail(FailReason),
}

impl Decision {
    pub fn invoke(tool: &str, args: Value) -> Self {
        Self::Invoke {
            tool: tool.to_string(),
            args,
        }
    }
}

/// Why a planner gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// Too many steps planned; the run is aborted rather than failed
    StepBudgetExceeded { limit: u32 },

    /// A required tool is not in the capability set
    MissingCapability(String),

    /// The planner picked a tool outside the capability set
    UnknownTool(String),

    /// Extracted data lacks required fields
    ValidationFailed { missing_fields: Vec<String> },

    /// The system of record refused the posting
    PostingRejected(String),

    /// The planner's choice broke the step ordering
    OrderingViolation(String),

    /// The planner re-issued a call that just failed, with the same arguments
    RepeatedFailure(String),

    /// The planner itself could not produce a decision
    PlannerError(String),
}

impl FailReason {
    /// Budget exhaustion aborts the run instead of failing it
    pub fn is_budget(&self) -> bool {
        matches!(self, Self::StepBudgetExceeded { .. })
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepBudgetExceeded { limit } => {
                write!(f, "step_budget_exceeded: more than {} steps planned", limit)
            }
            Self::MissingCapability(tool) => write!(f, "missing_capability: {}", tool),
            Self::UnknownTool(tool) => write!(f, "unknown_tool: {}", tool),
            Self::ValidationFailed { missing_fields } => write!(
                f,
                "validation_failed: missing {}",
                missing_fields.join(", ")
            ),
            Self::PostingRejected(reason) => write!(f, "posting_rejected: {}", reason),
            Self::OrderingViolation(detail) => write!(f, "ordering_violation: {}", detail),
            Self::RepeatedFailure(tool) => write!(
                f,
                "repeated_failure: {} already failed with the same arguments",
                tool
            ),
            Self::PlannerError(detail) => write!(f, "planner_error: {}", detail),
        }
    }
}

/// Chooses the next step of a run
#[async_trait]
pub trait Planner: Send + Sync {
    /// Human-readable planner name
    fn name(&self) -> &str;

    /// Decide the next action from the run's state and history
    async fn next(
        &self,
        state: &PipelineState,
        capabilities: &CapabilitySet,
        history: &[StepOutcome],
    ) -> Decision;
}

/// `validation_result.is_valid`, if validation ran
pub fn validation_passed(state: &PipelineState) -> Option<bool> {
    state
        .get(VALIDATION_RESULT)
        .and_then(|v| v.get("is_valid"))
        .and_then(Value::as_bool)
}

/// `posting_result.accepted`, if posting ran
pub fn posting_accepted(state: &PipelineState) -> Option<bool> {
    state
        .get(POSTING_RESULT)
        .and_then(|v| v.get("accepted"))
        .and_then(Value::as_bool)
}

fn missing_fields(state: &PipelineState) -> Vec<String> {
    state
        .get(VALIDATION_RESULT)
        .and_then(|v| v.get("missing_fields"))
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn rejection_reason(state: &PipelineState) -> String {
    match state.get(POSTING_RESULT).and_then(|v| v.get("reason")) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "no reason given".to_string(),
    }
}

/// Fixed extract → validate → post state machine
#[derive(Debug, Default, Clone)]
pub struct DeterministicPlanner;

impl DeterministicPlanner {
    pub fn new() -> Self {
        Self
    }

    fn decide(&self, state: &PipelineState, capabilities: &CapabilitySet) -> Decision {
        let step = |tool: &str, args: Value| {
            if capabilities.contains(tool) {
                Decision::invoke(tool, args)
            } else {
                Decision::Fail(FailReason::MissingCapability(tool.to_string()))
            }
        };

        let Some(extracted) = state.get(EXTRACTED_DATA) else {
            return step(
                EXTRACT_DOCUMENT,
                json!({ "bucket": state.bucket, "key": state.key }),
            );
        };

        let Some(validation) = state.get(VALIDATION_RESULT) else {
            return step(VALIDATE_INVOICE_DATA, json!({ "extracted_data": extracted }));
        };

        match validation_passed(state) {
            Some(true) => {}
            Some(false) => {
                return Decision::Fail(FailReason::ValidationFailed {
                    missing_fields: missing_fields(state),
                })
            }
            None => {
                return Decision::Fail(FailReason::PlannerError(
                    "validation_result has no is_valid flag".to_string(),
                ))
            }
        }

        if !state.contains(POSTING_RESULT) {
            return step(
                POST_INVOICE,
                json!({ "extracted_data": extracted, "validation_result": validation }),
            );
        }

        match posting_accepted(state) {
            Some(true) => Decision::Complete,
            _ => Decision::Fail(FailReason::PostingRejected(rejection_reason(state))),
        }
    }
}

#[async_trait]
impl Planner for DeterministicPlanner {
    fn name(&self) -> &str {
        "deterministic"
    }

    async fn next(
        &self,
        state: &PipelineState,
        capabilities: &CapabilitySet,
        _history: &[StepOutcome],
    ) -> Decision {
        self.decide(state, capabilities)
    }
}

/// Wraps any planner with the step budget and ordering rules.
///
/// The budget counts planned invocations in `history`; callers pass only
/// the planned part of a run's history. An invocation identical to the one
/// that just failed is refused: a failed call leaves the state unchanged, so
/// the retry policy is the only place a call gets repeated.
pub struct GuardedPlanner {
    inner: Arc<dyn Planner>,
    max_steps: u32,
}

impl GuardedPlanner {
    pub fn new(inner: Arc<dyn Planner>, max_steps: u32) -> Self {
        Self { inner, max_steps }
    }

    /// Check a decision against the ordering rules
    pub fn check(&self, decision: Decision, state: &PipelineState, capabilities: &CapabilitySet) -> Decision {
        let violation = match &decision {
            Decision::Invoke { tool, .. } => {
                if !capabilities.contains(tool) {
                    return Decision::Fail(FailReason::UnknownTool(tool.clone()));
                }
                invoke_violation(tool, state, capabilities)
            }
            Decision::Complete => match posting_accepted(state) {
                Some(true) => None,
                _ => Some("run declared complete before an accepted posting".to_string()),
            },
            Decision::Fail(_) => None,
        };

        match violation {
            Some(detail) => {
                warn!(planner = self.inner.name(), %detail, "Planner decision rejected");
                Decision::Fail(FailReason::OrderingViolation(detail))
            }
            None => decision,
        }
    }
}

fn invoke_violation(tool: &str, state: &PipelineState, capabilities: &CapabilitySet) -> Option<String> {
    if tool == SEND_NOTIFICATION {
        return None;
    }

    if let Some(key) = capabilities.output_key(tool) {
        if state.contains(key) {
            return Some(format!("{} already produced {}", tool, key));
        }
    }

    match tool {
        VALIDATE_INVOICE_DATA if !state.contains(EXTRACTED_DATA) => {
            Some("validation requested before extraction".to_string())
        }
        POST_INVOICE if validation_passed(state) != Some(true) => {
            Some("posting requested without a passing validation".to_string())
        }
        _ => None,
    }
}

#[async_trait]
impl Planner for GuardedPlanner {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn next(
        &self,
        state: &PipelineState,
        capabilities: &CapabilitySet,
        history: &[StepOutcome],
    ) -> Decision {
        // Retries share a step; only first attempts count against the budget
        let steps = history.iter().filter(|o| o.attempt == 1).count();
        if steps >= self.max_steps as usize {
            return Decision::Fail(FailReason::StepBudgetExceeded {
                limit: self.max_steps,
            });
        }

        let decision = self.inner.next(state, capabilities, history).await;
        if let Decision::Invoke { tool, args } = &decision {
            if history
                .last()
                .is_some_and(|last| !last.success && last.same_call(tool, args))
            {
                warn!(planner = self.inner.name(), %tool, "Planner repeated a failed call");
                return Decision::Fail(FailReason::RepeatedFailure(tool.clone()));
            }
        }
        self.check(decision, state, capabilities)
    }
}
