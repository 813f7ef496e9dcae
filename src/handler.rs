//! Invocation handler: one trigger in, one response out.
//!
//! Classifies the raw event, routes it, and for document triggers runs the
//! pipeline under the concurrency lease.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use crate::config::Config;
use crate::core::{route, Action, ConcurrencyGuard, GuardError, Orchestrator, Response};
use crate::domain::{ProcessId, RunResult, TriggerEvent};

/// Entry point shared by the CLI and the HTTP host
#[derive(Clone)]
pub struct DocumentHandler {
    orchestrator: Arc<Orchestrator>,
    guard: ConcurrencyGuard,
    lease_wait: Duration,
}

impl DocumentHandler {
    pub fn new(orchestrator: Orchestrator, guard: ConcurrencyGuard, lease_wait: Duration) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            guard,
            lease_wait,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            Orchestrator::from_config(config)?,
            ConcurrencyGuard::with_lock_file(&config.lock_file),
            config.lease_wait(),
        ))
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    /// Handle one raw trigger event
    #[instrument(skip_all)]
    pub async fn handle(&self, raw: &Value) -> Response {
        let event = TriggerEvent::classify(raw);
        debug!(kind = event.kind(), "Trigger classified");

        let ignored_records = match &event {
            TriggerEvent::ObjectCreated { ignored_records, .. } => *ignored_records,
            _ => 0,
        };

        match route(&event) {
            Action::RespondStatic { status, body } => Response::static_reply(status, body),
            Action::RespondError { status, body } => {
                warn!("Unknown invocation source");
                Response::error_reply(status, body)
            }
            Action::RunPipeline { bucket, key } => {
                if ignored_records > 0 {
                    warn!(
                        ignored_records,
                        %bucket,
                        %key,
                        "Batch trigger: only the first record is processed"
                    );
                }

                match self.run(&bucket, &key, None).await {
                    Ok(result) => Response::from_run(&result, ignored_records),
                    Err(GuardError::Busy) => {
                        warn!(%bucket, %key, "Rejected: another run is in progress");
                        Response::busy()
                    }
                    Err(e) => {
                        error!(error = %e, "Could not acquire the run lease");
                        Response::internal_error(&e.to_string())
                    }
                }
            }
        }
    }

    /// Run the pipeline for one object under the lease.
    ///
    /// Without an explicit process id one is derived from the object and
    /// the lease id.
    pub async fn run(
        &self,
        bucket: &str,
        key: &str,
        process_id: Option<ProcessId>,
    ) -> Result<RunResult, GuardError> {
        let lease = self.guard.acquire_within(self.lease_wait).await?;
        let process_id =
            process_id.unwrap_or_else(|| ProcessId::derive(bucket, key, &lease.id().to_string()));

        let result = self.orchestrator.run(bucket, key, process_id).await;
        drop(lease);
        Ok(result)
    }
}
