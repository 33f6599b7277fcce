//! Task data model for the execution DAG.
//!
//! Tasks arrive as pre-parsed [`TaskSpec`] records and are turned into
//! [`Task`]s that carry scheduling state. Only the scheduler moves a task
//! between statuses, and every move goes through [`Task::transition`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Identifier of a task, as supplied by the task-definition source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// A task record as supplied by the external task-definition source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    /// Opaque reference to the task description (a path, URL or issue key).
    #[serde(default)]
    pub description_ref: String,
    /// Files or globs the task is expected to modify.
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub complexity_hint: u32,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(id),
            description_ref: String::new(),
            target_files: Vec::new(),
            depends_on: Vec::new(),
            priority: 0,
            complexity_hint: 0,
        }
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_files = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(|d| TaskId::new(d)).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.complexity_hint = complexity;
        self
    }

    pub fn with_description(mut self, description_ref: impl Into<String>) -> Self {
        self.description_ref = description_ref.into();
        self
    }
}

/// Broad category of a task failure, as shown in the batch report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SpecError,
    WorkspaceError,
    ProcessError,
    ValidationError,
    MergeConflict,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::SpecError => "spec_error",
            ErrorKind::WorkspaceError => "workspace_error",
            ErrorKind::ProcessError => "process_error",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::MergeConflict => "merge_conflict",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// A classified task failure with a remediation hint for the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub class: ErrorClass,
    pub message: String,
    pub hint: String,
}

impl TaskFailure {
    pub fn transient(kind: ErrorKind, message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            kind,
            class: ErrorClass::Transient,
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn permanent(kind: ErrorKind, message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            kind,
            class: ErrorClass::Permanent,
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting for dependencies or for a retry backoff to elapse.
    #[default]
    Queued,
    /// All dependencies completed; eligible to start.
    Ready,
    Running,
    Completed,
    Failed {
        failure: TaskFailure,
    },
    /// An ancestor failed; about to be cancelled.
    Blocked {
        reason: String,
    },
    Cancelled {
        reason: String,
    },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled { .. }
        )
    }

    /// Short name without payload, used in events and transition errors.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Blocked { .. } => "blocked",
            TaskStatus::Cancelled { .. } => "cancelled",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Queued, Ready | Blocked { .. } | Cancelled { .. } | Failed { .. }) => true,
            (Ready, Running | Blocked { .. } | Cancelled { .. }) => true,
            // Running -> Queued is a retry waiting out its backoff.
            (Running, Completed | Failed { .. } | Cancelled { .. } | Queued) => true,
            (Blocked { .. }, Cancelled { .. }) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { failure } => write!(f, "failed: {}", failure),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            TaskStatus::Cancelled { reason } => write!(f, "cancelled: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// A single task in the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description_ref: String,
    pub target_files: Vec<String>,
    pub depends_on: Vec<TaskId>,
    pub priority: i32,
    pub complexity: u32,
    /// Position in the input batch; the final scheduling tie-breaker.
    pub seq: usize,
    pub status: TaskStatus,
    /// Number of attempts started so far.
    pub attempts: u32,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub commit_hash: Option<String>,
}

impl Task {
    pub fn from_spec(spec: TaskSpec, seq: usize) -> Self {
        Self {
            id: spec.id,
            description_ref: spec.description_ref,
            target_files: spec.target_files,
            depends_on: spec.depends_on,
            priority: spec.priority,
            complexity: spec.complexity_hint,
            seq,
            status: TaskStatus::Queued,
            attempts: 0,
            worktree_path: None,
            branch_name: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            commit_hash: None,
        }
    }

    /// Move to `next`, stamping start and completion times.
    ///
    /// # Errors
    /// Returns `Error::InvalidTransition` if the state machine forbids the move.
    pub fn transition(&mut self, next: TaskStatus) -> Result<TaskStatus> {
        if !self.status.can_transition_to(&next) {
            return Err(Error::InvalidTransition {
                task: self.id.clone(),
                from: self.status.name().to_string(),
                to: next.name().to_string(),
            });
        }
        if next == TaskStatus::Running {
            self.attempts += 1;
            if self.started_at.is_none() {
                self.started_at = Some(Utc::now());
            }
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(std::mem::replace(&mut self.status, next))
    }

    pub fn set_worktree(&mut self, path: PathBuf, branch: &str) {
        self.worktree_path = Some(path);
        self.branch_name = Some(branch.to_string());
    }

    pub fn set_commit(&mut self, hash: &str) {
        self.commit_hash = Some(hash.to_string());
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock time between first start and terminal state, if both happened.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }

    /// The record handed to the worker process.
    pub fn spec(&self) -> TaskSpec {
        TaskSpec {
            id: self.id.clone(),
            description_ref: self.description_ref.clone(),
            target_files: self.target_files.clone(),
            depends_on: self.depends_on.clone(),
            priority: self.priority,
            complexity_hint: self.complexity,
        }
    }
}
