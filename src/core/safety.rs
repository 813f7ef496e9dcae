//! Budgets and retry policy for pipeline execution.
//!
//! Prevents runaway execution through configurable limits on:
//! - Number of planned steps
//! - Per-call timeouts
//! - Total run wall-clock time
//! - Attempts per tool invocation

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Budgets for one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum planner-selected steps per run (default: 16)
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Per tool call timeout in milliseconds (default: 120s)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_ms: u64,

    /// Total run timeout in milliseconds (default: 600s, the host's invocation limit)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_ms: u64,
}

fn default_max_steps() -> u32 {
    16
}
fn default_step_timeout() -> u64 {
    120_000
}
fn default_run_timeout() -> u64 {
    600_000
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            step_timeout_ms: default_step_timeout(),
            run_timeout_ms: default_run_timeout(),
        }
    }
}

impl SafetyLimits {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Check current tracker state against the wall-clock budget
    pub fn check(&self, tracker: &SafetyTracker) -> Result<(), BudgetViolation> {
        let elapsed = tracker.elapsed();
        if elapsed >= self.run_timeout() {
            return Err(BudgetViolation::RunTimeout {
                elapsed_ms: elapsed.as_millis() as u64,
                limit_ms: self.run_timeout_ms,
            });
        }
        Ok(())
    }

    /// Timeout for the next call: the step timeout, capped by what is left of the run
    pub fn call_timeout(&self, tracker: &SafetyTracker) -> Duration {
        self.step_timeout().min(tracker.remaining(self))
    }
}

/// Tracks wall-clock usage during a run
#[derive(Debug, Clone)]
pub struct SafetyTracker {
    started_at: Instant,
}

impl Default for SafetyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyTracker {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time left before the run budget is exhausted
    pub fn remaining(&self, limits: &SafetyLimits) -> Duration {
        limits.run_timeout().saturating_sub(self.elapsed())
    }
}

/// Wall-clock violations; these abort a run rather than fail it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetViolation {
    #[error("run timeout: {elapsed_ms}ms >= {limit_ms}ms")]
    RunTimeout { elapsed_ms: u64, limit_ms: u64 },
}

/// Retry policy for failed tool calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (default: 2, so 3 attempts in total)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    2
}
fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    5000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, up to `max_retries` times
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Total attempts allowed per invocation
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Calculate delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if another attempt is allowed after `attempt` failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = SafetyLimits::default();
        assert_eq!(limits.max_steps, 16);
        assert_eq!(limits.step_timeout(), Duration::from_secs(120));
        assert_eq!(limits.run_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_run_timeout_violation() {
        let limits = SafetyLimits {
            run_timeout_ms: 0,
            ..Default::default()
        };
        let tracker = SafetyTracker::new();

        assert!(matches!(
            limits.check(&tracker),
            Err(BudgetViolation::RunTimeout { limit_ms: 0, .. })
        ));
    }

    #[test]
    fn test_call_timeout_capped_by_run_budget() {
        let limits = SafetyLimits {
            step_timeout_ms: 60_000,
            run_timeout_ms: 1_000,
            ..Default::default()
        };
        let tracker = SafetyTracker::new();

        assert!(limits.call_timeout(&tracker) <= Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_retry_bound() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
