//! Failure classification, retry/backoff and the batch circuit breaker.
//!
//! Every attempt that does not end in success is turned into a
//! [`TaskFailure`] by the [`FailureClassifier`]. The [`FailureHandler`]
//! then decides whether the task is retried after a backoff or fails for
//! good, and tracks the batch-wide failure rate.
//!
//! ## Classes
//!
//! - **Transient**: timeouts, crashed or lost processes, and non-zero
//!   exits whose log tail matches one of the configured patterns.
//! - **Permanent**: everything else, including spawn failures and any
//!   failure whose retry budget is spent.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;

use crate::config::Config;
use crate::core::record::ExecutionOutcome;
use crate::core::task::{ErrorKind, TaskFailure, TaskId};
use crate::{wlog_debug, wlog_warn, Error, Result};

/// Retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Retries used so far, per task.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: HashMap<TaskId, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_retries(&self, task_id: &TaskId) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    /// Returns the new count.
    pub fn increment(&mut self, task_id: &TaskId) -> u32 {
        let count = self.retries.entry(task_id.clone()).or_insert(0);
        *count += 1;
        *count
    }
}

/// Turns execution outcomes into classified failures.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    patterns: Vec<Regex>,
}

impl FailureClassifier {
    /// # Errors
    /// Returns `Error::Pattern` if a pattern is not a valid regex.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| Error::Pattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    fn transient_match(&self, log_tail: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| p.is_match(log_tail))
            .map(Regex::as_str)
    }

    /// Classify an outcome. Returns `None` for outcomes that count as success.
    pub fn classify(&self, outcome: &ExecutionOutcome, log_tail: &str) -> Option<TaskFailure> {
        let failure = match outcome {
            ExecutionOutcome::Succeeded | ExecutionOutcome::ExitedUnobserved => return None,
            ExecutionOutcome::TimedOut { after_ms } => TaskFailure::transient(
                ErrorKind::ProcessError,
                format!("worker timed out after {}s", after_ms / 1000),
                "raise task_timeout_secs or split the task",
            ),
            ExecutionOutcome::Crashed { reason } => TaskFailure::transient(
                ErrorKind::ProcessError,
                format!("worker crashed: {}", reason),
                "inspect the worker log",
            ),
            ExecutionOutcome::Lost { reason } => TaskFailure::transient(
                ErrorKind::ProcessError,
                format!("worker lost: {}", reason),
                "the supervisor restarted while the worker ran",
            ),
            ExecutionOutcome::Exited { code } => match self.transient_match(log_tail) {
                Some(pattern) => TaskFailure::transient(
                    ErrorKind::ProcessError,
                    format!("worker exited with status {}", code),
                    format!("log matched transient pattern '{}'", pattern),
                ),
                None => TaskFailure::permanent(
                    ErrorKind::ProcessError,
                    format!("worker exited with status {}", code),
                    "inspect the worker log",
                ),
            },
            ExecutionOutcome::SpawnFailed { reason } => TaskFailure::permanent(
                ErrorKind::ProcessError,
                format!("worker could not be started: {}", reason),
                "check the configured worker command",
            ),
            ExecutionOutcome::Cancelled => TaskFailure::permanent(
                ErrorKind::Cancelled,
                "worker was cancelled",
                "re-run the task",
            ),
        };
        Some(failure)
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDecision {
    /// Run again after `delay`; `retry` is the 1-based retry number.
    Retry { retry: u32, delay: Duration },
    /// Terminal failure.
    Fail(TaskFailure),
}

/// Trips once when the terminal failure rate gets too high.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: f64,
    min_samples: usize,
    succeeded: usize,
    failed: usize,
    tripped: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: f64, min_samples: usize) -> Self {
        Self {
            threshold,
            min_samples: min_samples.max(1),
            succeeded: 0,
            failed: 0,
            tripped: false,
        }
    }

    pub fn failure_rate(&self) -> f64 {
        let total = self.succeeded + self.failed;
        if total == 0 {
            0.0
        } else {
            self.failed as f64 / total as f64
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    /// Record a terminal result. Returns the failure rate if this sample
    /// tripped the breaker.
    pub fn record(&mut self, success: bool) -> Option<f64> {
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        let rate = self.failure_rate();
        let samples = self.succeeded + self.failed;
        if !self.tripped && samples >= self.min_samples && rate > self.threshold {
            self.tripped = true;
            return Some(rate);
        }
        None
    }
}

/// Retry decisions and batch failure-rate tracking.
#[derive(Debug, Clone)]
pub struct FailureHandler {
    policy: RetryPolicy,
    tracker: RetryTracker,
    breaker: CircuitBreaker,
}

impl FailureHandler {
    pub fn new(policy: RetryPolicy, breaker: CircuitBreaker) -> Self {
        Self {
            policy,
            tracker: RetryTracker::new(),
            breaker,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            RetryPolicy::from_config(config),
            CircuitBreaker::new(config.failure_rate_threshold, config.circuit_min_samples),
        )
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn retries(&self, task_id: &TaskId) -> u32 {
        self.tracker.get_retries(task_id)
    }

    /// Decide between a retry and a terminal failure.
    pub fn on_failure(&mut self, task_id: &TaskId, failure: TaskFailure) -> FailureDecision {
        if !failure.is_transient() {
            return FailureDecision::Fail(failure);
        }

        let used = self.tracker.get_retries(task_id);
        if used < self.policy.max_retries {
            let retry = self.tracker.increment(task_id);
            let delay = self.policy.backoff(retry);
            wlog_debug!(
                "Task {} failed transiently ({}); retry {} in {:?}",
                task_id,
                failure,
                retry,
                delay
            );
            return FailureDecision::Retry { retry, delay };
        }

        wlog_warn!("Task {} exhausted {} retries", task_id, used);
        FailureDecision::Fail(TaskFailure::permanent(
            failure.kind,
            format!("{} (gave up after {} attempts)", failure.message, used + 1),
            failure.hint,
        ))
    }

    /// Record a task reaching Completed or Failed. Returns the failure rate
    /// when the batch should switch to sequential execution.
    pub fn record_terminal(&mut self, success: bool) -> Option<f64> {
        self.breaker.record(success)
    }

    pub fn is_sequential(&self) -> bool {
        self.breaker.is_tripped()
    }

    pub fn failure_rate(&self) -> f64 {
        self.breaker.failure_rate()
    }
}
