//! Batch report.
//!
//! Built once every task is terminal. Lists each task's terminal status
//! and, for anything that did not complete, the error class and a
//! remediation hint.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::record::ExecutionRecord;
use crate::core::task::{ErrorClass, ErrorKind, Task, TaskId, TaskStatus};
use crate::orchestration::aggregator::ManualResolution;
use crate::orchestration::scheduler::SchedulerOutcome;
use crate::Result;

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub status: String,
    pub duration_ms: Option<i64>,
    pub attempts: u32,
    pub artifacts: Vec<String>,
    pub commit: Option<String>,
    /// Integration branch tip right after this task was merged.
    pub integrated_as: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_class: Option<ErrorClass>,
    pub error: Option<String>,
    pub remediation: Option<String>,
}

impl TaskSummary {
    fn from_task(task: &Task, outcome: &SchedulerOutcome) -> Self {
        let integration = outcome.integrations.get(&task.id);
        let mut summary = Self {
            task_id: task.id.clone(),
            status: task.status.name().to_string(),
            duration_ms: task.duration().map(|d| d.num_milliseconds()),
            attempts: task.attempts,
            artifacts: integration.map(|d| d.files.clone()).unwrap_or_default(),
            commit: task.commit_hash.clone(),
            integrated_as: integration.map(|d| d.integrated_as.clone()),
            error_kind: None,
            error_class: None,
            error: None,
            remediation: None,
        };

        match &task.status {
            TaskStatus::Failed { failure } => {
                summary.error_kind = Some(failure.kind);
                summary.error_class = Some(failure.class);
                summary.error = Some(failure.message.clone());
                summary.remediation = Some(failure.hint.clone());
            }
            TaskStatus::Cancelled { reason } => {
                summary.error_kind = Some(ErrorKind::Cancelled);
                summary.error_class = Some(ErrorClass::Permanent);
                summary.error = Some(reason.clone());
                summary.remediation = Some(if reason.starts_with("dependency") {
                    "fix the failed dependency and re-run".to_string()
                } else {
                    "re-run the task".to_string()
                });
            }
            _ => {}
        }
        summary
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed.name()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub integration_branch: String,
    pub counts: Counts,
    pub sequential_fallback: bool,
    pub failure_rate: f64,
    pub aborted: bool,
    pub tasks: Vec<TaskSummary>,
    pub records: Vec<ExecutionRecord>,
    pub manual_queue: Vec<ManualResolution>,
    pub retained_workspaces: Vec<PathBuf>,
}

impl Report {
    pub fn build(
        outcome: &SchedulerOutcome,
        manual_queue: Vec<ManualResolution>,
        integration_branch: impl Into<String>,
    ) -> Self {
        let tasks: Vec<TaskSummary> = outcome
            .tasks
            .iter()
            .map(|t| TaskSummary::from_task(t, outcome))
            .collect();

        let mut counts = Counts {
            total: tasks.len(),
            ..Counts::default()
        };
        for task in &outcome.tasks {
            match task.status {
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed { .. } => counts.failed += 1,
                TaskStatus::Cancelled { .. } => counts.cancelled += 1,
                _ => {}
            }
        }

        Self {
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
            integration_branch: integration_branch.into(),
            counts,
            sequential_fallback: outcome.sequential_fallback,
            failure_rate: outcome.failure_rate,
            aborted: outcome.aborted,
            tasks,
            records: outcome.records.clone(),
            manual_queue,
            retained_workspaces: outcome
                .retained_workspaces
                .iter()
                .map(|w| w.path.clone())
                .collect(),
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskSummary> {
        self.tasks.iter().find(|t| &t.task_id == id)
    }

    /// True when every task completed.
    pub fn is_success(&self) -> bool {
        self.counts.completed == self.counts.total
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
