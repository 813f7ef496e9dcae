//! Execution loop for one document.
//!
//! Asks the planner for the next step, invokes the tool with retry and
//! timeouts, folds payloads into pipeline state, and brackets the run with
//! start and end notifications. Every transition is journaled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{ModelPlanner, Tool, ToolContext, ToolRegistry};
use crate::config::{Config, PlannerKind};
use crate::domain::capability::{EXTRACTED_DATA, POSTING_RESULT, SEND_NOTIFICATION};
use crate::domain::{
    CapabilitySet, Event, EventType, PipelineState, ProcessId, RunResult, RunStatus, StepOutcome,
    StepStatus,
};
use crate::error::ToolError;

use super::event_store::{generate_idempotency_key, EventStore};
use super::planner::{Decision, DeterministicPlanner, GuardedPlanner, Planner};
use super::safety::{BudgetViolation, RetryPolicy, SafetyLimits, SafetyTracker};

/// Main pipeline orchestrator
pub struct Orchestrator {
    tools: ToolRegistry,
    capabilities: CapabilitySet,
    planner: GuardedPlanner,
    limits: SafetyLimits,
    retry: RetryPolicy,
    journal_dir: Option<PathBuf>,
}

/// Why an invocation did not produce a payload
enum StepFailure {
    /// Every allowed attempt failed
    Exhausted { attempts: u32, error: ToolError },

    /// The run's wall-clock budget ran out
    Deadline(BudgetViolation),
}

/// Mutable state of one run
struct RunContext {
    process_id: ProcessId,
    journal: Journal,
    tracker: SafetyTracker,
    state: PipelineState,
    history: Vec<StepOutcome>,

    /// History entries before this index are bracketing notifications
    planned_from: usize,
}

impl Orchestrator {
    /// Create an orchestrator; the planner is always wrapped in the ordering guard
    pub fn new(
        tools: ToolRegistry,
        planner: Arc<dyn Planner>,
        limits: SafetyLimits,
        retry: RetryPolicy,
    ) -> Self {
        let capabilities = tools.capabilities();
        let planner = GuardedPlanner::new(planner, limits.max_steps);
        Self {
            tools,
            capabilities,
            planner,
            limits,
            retry,
            journal_dir: None,
        }
    }

    /// Journal every run under `dir`
    pub fn with_journal(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    /// Wire adapters and planner from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let tools = ToolRegistry::from_config(config)?;
        let planner: Arc<dyn Planner> = match config.planner {
            PlannerKind::Deterministic => Arc::new(DeterministicPlanner::new()),
            PlannerKind::Model => Arc::new(ModelPlanner::from_config(config)?),
        };

        Ok(Self::new(tools, planner, config.limits.clone(), config.retry.clone())
            .with_journal(config.journal_dir.clone()))
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn planner_name(&self) -> &str {
        self.planner.name()
    }

    pub fn journal_dir(&self) -> Option<&Path> {
        self.journal_dir.as_deref()
    }

    /// Run the pipeline for one document. Never fails: every problem ends
    /// up in the returned status and history.
    #[instrument(skip(self, process_id), fields(process_id = %process_id))]
    pub async fn run(&self, bucket: &str, key: &str, process_id: ProcessId) -> RunResult {
        let started_at = Utc::now();
        info!(bucket, key, planner = self.planner.name(), "Pipeline run started");

        let journal = Journal::open(self.journal_dir.as_deref(), &process_id).await;
        journal
            .record(Event::new(
                process_id.clone(),
                None,
                EventType::RunStarted,
                format!("{}:start", process_id),
                format!("Processing {}/{}", bucket, key),
                StepStatus::Running,
            ))
            .await;

        let mut run = RunContext {
            process_id,
            journal,
            tracker: SafetyTracker::new(),
            state: PipelineState::new(bucket, key),
            history: Vec::new(),
            planned_from: 0,
        };

        self.notify(&mut run, format!("Processing started for {}", key), "started")
            .await;
        run.planned_from = run.history.len();

        let status = self.drive(&mut run).await;
        let summary = summarize(&status, &run);

        self.finish(&run, &status, &summary).await;
        self.notify(
            &mut run,
            format!("Processing {} for {}: {}", status.label(), key, summary),
            status.label(),
        )
        .await;

        RunResult {
            process_id: run.process_id,
            bucket: bucket.to_string(),
            key: key.to_string(),
            status,
            step_history: run.history,
            final_summary: summary,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// The planner loop
    async fn drive(&self, run: &mut RunContext) -> RunStatus {
        loop {
            if let Err(violation) = self.limits.check(&run.tracker) {
                return aborted(violation);
            }

            let remaining = run.tracker.remaining(&self.limits);
            let planned = &run.history[run.planned_from..];
            let decision = match tokio::time::timeout(
                remaining,
                self.planner.next(&run.state, &self.capabilities, planned),
            )
            .await
            {
                Ok(decision) => decision,
                Err(_) => {
                    return aborted(BudgetViolation::RunTimeout {
                        elapsed_ms: run.tracker.elapsed().as_millis() as u64,
                        limit_ms: self.limits.run_timeout_ms,
                    })
                }
            };

            let (tool_name, args) = match decision {
                Decision::Complete => return RunStatus::Completed,
                Decision::Fail(reason) if reason.is_budget() => {
                    warn!(%reason, "Run aborted");
                    return RunStatus::Aborted {
                        reason: reason.to_string(),
                    };
                }
                Decision::Fail(reason) => {
                    warn!(%reason, "Planner gave up");
                    return RunStatus::Failed {
                        reason: reason.to_string(),
                    };
                }
                Decision::Invoke { tool, args } => (tool, args),
            };

            let Some(tool) = self.tools.get(&tool_name) else {
                return RunStatus::Failed {
                    reason: format!("missing_capability: {}", tool_name),
                };
            };

            match self.invoke_with_retry(run, tool.as_ref(), args).await {
                Ok(payload) => {
                    run.state.merge(tool.output_key(), payload);
                }
                Err(StepFailure::Deadline(violation)) => return aborted(violation),
                Err(StepFailure::Exhausted { error, .. }) if tool_name == SEND_NOTIFICATION => {
                    self.notification_failed(run, &error).await;
                }
                Err(StepFailure::Exhausted { attempts, error }) => {
                    return RunStatus::Failed {
                        reason: format!("{} failed after {} attempts: {}", tool_name, attempts, error),
                    };
                }
            }
        }
    }

    /// Invoke one tool, retrying with the same arguments
    async fn invoke_with_retry(
        &self,
        run: &mut RunContext,
        tool: &dyn Tool,
        args: Value,
    ) -> Result<Value, StepFailure> {
        let name = tool.name().to_string();
        let idem_key = generate_idempotency_key(&run.process_id, &name, &args.to_string());
        let ctx = ToolContext::new(run.process_id.clone(), idem_key.clone());

        let mut attempt = 0u32;

        loop {
            attempt += 1;

            self.limits
                .check(&run.tracker)
                .map_err(StepFailure::Deadline)?;

            let timeout = self.limits.call_timeout(&run.tracker);
            run.journal
                .record(Event::new(
                    run.process_id.clone(),
                    Some(name.clone()),
                    EventType::StepStarted,
                    idem_key.clone(),
                    format!("Tool '{}' attempt {}", name, attempt),
                    StepStatus::Running,
                ))
                .await;
            debug!(tool = %name, attempt, timeout_ms = timeout.as_millis() as u64, "Invoking tool");

            let started_at = Utc::now();
            let clock = Instant::now();
            let result = match tokio::time::timeout(timeout, tool.invoke(args.clone(), &ctx)).await {
                Ok(result) => result,
                Err(_) => Err(ToolError::timeout(format!(
                    "no answer within {}ms",
                    timeout.as_millis()
                ))),
            };
            let duration_ms = clock.elapsed().as_millis() as u64;

            match result {
                Ok(payload) => {
                    run.history.push(
                        StepOutcome::succeeded(&name, attempt, payload.clone(), started_at, duration_ms)
                            .with_args(args),
                    );
                    run.journal
                        .record(
                            Event::new(
                                run.process_id.clone(),
                                Some(name.clone()),
                                EventType::StepCompleted,
                                idem_key,
                                format!("Tool '{}' completed in {}ms", name, duration_ms),
                                StepStatus::Completed,
                            )
                            .with_duration(duration_ms),
                        )
                        .await;
                    info!(tool = %name, attempt, duration_ms, "Tool completed");
                    return Ok(payload);
                }
                Err(e) => {
                    run.history.push(
                        StepOutcome::failed(&name, attempt, e.clone(), started_at, duration_ms)
                            .with_args(args.clone()),
                    );

                    if e.is_retryable() && self.retry.should_retry(attempt) {
                        let delay = self
                            .retry
                            .delay_for_attempt(attempt)
                            .min(run.tracker.remaining(&self.limits));

                        run.journal
                            .record(
                                Event::new(
                                    run.process_id.clone(),
                                    Some(name.clone()),
                                    EventType::StepRetrying,
                                    format!("{}:retry:{}", idem_key, attempt),
                                    format!("Tool '{}' failed, retrying in {:?}", name, delay),
                                    StepStatus::Running,
                                )
                                .with_duration(duration_ms)
                                .with_error(e.to_string()),
                            )
                            .await;

                        warn!(
                            tool = %name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Tool failed, retrying"
                        );

                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    run.journal
                        .record(
                            Event::new(
                                run.process_id.clone(),
                                Some(name.clone()),
                                EventType::StepFailed,
                                idem_key,
                                format!("Tool '{}' failed after {} attempts", name, attempt),
                                StepStatus::Failed,
                            )
                            .with_duration(duration_ms)
                            .with_error(e.to_string()),
                        )
                        .await;

                    // A call cut short by the run deadline aborts rather than fails
                    if let Err(violation) = self.limits.check(&run.tracker) {
                        return Err(StepFailure::Deadline(violation));
                    }

                    error!(tool = %name, attempt, error = %e, "Tool failed permanently");
                    return Err(StepFailure::Exhausted {
                        attempts: attempt,
                        error: e,
                    });
                }
            }
        }
    }

    /// Best-effort bracketing notification; one attempt, never fatal
    async fn notify(&self, run: &mut RunContext, message: String, status: &str) {
        let Some(tool) = self.tools.get(SEND_NOTIFICATION) else {
            debug!("No notification tool registered");
            return;
        };

        let args = json!({
            "message": message,
            "status": status,
            "invoice_id": invoice_id(&run.state),
        });
        let idem_key = generate_idempotency_key(&run.process_id, SEND_NOTIFICATION, &args.to_string());
        let ctx = ToolContext::new(run.process_id.clone(), idem_key);

        let timeout = self.limits.step_timeout();
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = match tokio::time::timeout(timeout, tool.invoke(args.clone(), &ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::timeout(format!(
                "no answer within {}ms",
                timeout.as_millis()
            ))),
        };
        let duration_ms = clock.elapsed().as_millis() as u64;

        match result {
            Ok(payload) => {
                run.history.push(
                    StepOutcome::succeeded(SEND_NOTIFICATION, 1, payload.clone(), started_at, duration_ms)
                        .with_args(args),
                );
                run.state.merge(tool.output_key(), payload);
            }
            Err(e) => {
                run.history.push(
                    StepOutcome::failed(SEND_NOTIFICATION, 1, e.clone(), started_at, duration_ms)
                        .with_args(args),
                );
                self.notification_failed(run, &e).await;
            }
        }
    }

    async fn notification_failed(&self, run: &RunContext, error: &ToolError) {
        warn!(error = %error, "Notification failed, continuing");
        run.journal
            .record(
                Event::new(
                    run.process_id.clone(),
                    Some(SEND_NOTIFICATION.to_string()),
                    EventType::NotificationFailed,
                    format!("{}:{}", run.process_id, SEND_NOTIFICATION),
                    "Notification could not be delivered".to_string(),
                    StepStatus::Failed,
                )
                .with_error(error.to_string()),
            )
            .await;
    }

    /// Journal the terminal event
    async fn finish(&self, run: &RunContext, status: &RunStatus, summary: &str) {
        let (event_type, step_status) = match status {
            RunStatus::Completed => (EventType::RunCompleted, StepStatus::Completed),
            RunStatus::Failed { .. } => (EventType::RunFailed, StepStatus::Failed),
            RunStatus::Aborted { .. } => (EventType::RunAborted, StepStatus::Aborted),
        };

        match status {
            RunStatus::Completed => info!(%summary, "Pipeline run completed"),
            _ => error!(status = status.label(), %summary, "Pipeline run did not complete"),
        }

        let mut event = Event::new(
            run.process_id.clone(),
            None,
            event_type,
            format!("{}:complete", run.process_id),
            summary.to_string(),
            step_status,
        )
        .with_duration(run.tracker.elapsed().as_millis() as u64);
        if let Some(reason) = status.reason() {
            event = event.with_error(reason.to_string());
        }
        run.journal.record(event).await;
    }
}

fn aborted(violation: BudgetViolation) -> RunStatus {
    warn!(%violation, "Run budget exhausted");
    RunStatus::Aborted {
        reason: violation.to_string(),
    }
}

/// Invoice number from extracted data, once known
fn invoice_id(state: &PipelineState) -> Value {
    let Some(extracted) = state.get(EXTRACTED_DATA) else {
        return Value::Null;
    };
    ["document", "kv"]
        .iter()
        .filter_map(|section| extracted.get(section)?.get("invoice_number"))
        .find(|v| !v.is_null())
        .cloned()
        .unwrap_or(Value::Null)
}

fn summarize(status: &RunStatus, run: &RunContext) -> String {
    match status {
        RunStatus::Completed => {
            let steps = run.history[run.planned_from..]
                .iter()
                .filter(|o| o.success)
                .count();
            let dry_run = run
                .state
                .get(POSTING_RESULT)
                .and_then(|p| p.get("dry_run"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            format!(
                "Processed {}/{} in {} step(s){}",
                run.state.bucket,
                run.state.key,
                steps,
                if dry_run { " (posting dry run)" } else { "" }
            )
        }
        RunStatus::Failed { reason } | RunStatus::Aborted { reason } => reason.clone(),
    }
}

/// Best-effort run journal; failures are logged and never affect the run
struct Journal {
    store: Option<EventStore>,
}

impl Journal {
    async fn open(dir: Option<&Path>, process_id: &ProcessId) -> Self {
        let store = match dir {
            None => None,
            Some(dir) => match EventStore::open(dir, process_id).await {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!(error = %e, "Run journal unavailable, continuing without it");
                    None
                }
            },
        };
        Self { store }
    }

    async fn record(&self, event: Event) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append(&event).await {
                warn!(error = %e, event_type = ?event.event_type, "Failed to journal event");
            }
        }
    }
}
