//! Execution records: one per attempt, never mutated once logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::task::TaskId;

/// A point-in-time resource sample for a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

impl ResourceUsage {
    /// Keep the larger of each dimension.
    pub fn peak(self, other: ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu_percent: self.cpu_percent.max(other.cpu_percent),
            memory_bytes: self.memory_bytes.max(other.memory_bytes),
        }
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExecutionOutcome {
    /// Exit status zero.
    Succeeded,
    /// Non-zero exit status.
    Exited { code: i32 },
    /// Killed by the supervisor after exceeding the task timeout.
    TimedOut { after_ms: u64 },
    /// Died from a signal the supervisor did not send.
    Crashed { reason: String },
    /// Terminated because the task or the batch was cancelled.
    Cancelled,
    /// The process could not be started.
    SpawnFailed { reason: String },
    /// The process vanished while the supervisor was not watching.
    Lost { reason: String },
    /// A re-adopted process exited; its exit status is not observable.
    ExitedUnobserved,
}

impl ExecutionOutcome {
    /// Whether the worker reported (or may have reported) success.
    pub fn may_have_succeeded(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::Succeeded | ExecutionOutcome::ExitedUnobserved
        )
    }
}

/// The durable record of one task-execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Attempt this one retries, if any.
    pub retry_of: Option<u32>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
    pub log_path: Option<PathBuf>,
    pub peak_usage: Option<ResourceUsage>,
    /// The process was picked up again after a supervisor restart.
    #[serde(default)]
    pub adopted: bool,
}

impl ExecutionRecord {
    /// A record for an attempt that ended without a process being observed.
    pub fn without_process(
        task_id: TaskId,
        attempt: u32,
        started_at: DateTime<Utc>,
        outcome: ExecutionOutcome,
    ) -> Self {
        Self {
            task_id,
            attempt,
            retry_of: attempt.checked_sub(1).filter(|prev| *prev > 0),
            pid: None,
            started_at,
            finished_at: Utc::now(),
            outcome,
            log_path: None,
            peak_usage: None,
            adopted: false,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Append-only log of execution records for a batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionLog {
    records: Vec<ExecutionRecord>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: ExecutionRecord) {
        self.records.push(record);
    }

    pub fn for_task<'a>(&'a self, id: &'a TaskId) -> impl Iterator<Item = &'a ExecutionRecord> {
        self.records.iter().filter(move |r| &r.task_id == id)
    }

    pub fn attempts(&self, id: &TaskId) -> usize {
        self.for_task(id).count()
    }

    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<ExecutionRecord> {
        self.records
    }
}
