use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::task::TaskId;

/// Problems with the task batch itself, detected before anything runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("dependency cycle: {}", format_cycle(.path))]
    Cycle { path: Vec<TaskId> },

    #[error("task {0} depends on itself")]
    SelfDependency(TaskId),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("task id must not be empty")]
    EmptyId,

    #[error("task {task} has invalid target pattern '{pattern}': {reason}")]
    InvalidPattern {
        task: TaskId,
        pattern: String,
        reason: String,
    },
}

impl SpecError {
    /// Whether this error invalidates the whole batch rather than one task.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self,
            SpecError::Cycle { .. } | SpecError::DuplicateTask(_) | SpecError::EmptyId
        )
    }
}

fn format_cycle(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("workspace name already in use: {0}")]
    NameCollision(String),

    #[error("branch already exists: {0}")]
    BranchConflict(String),

    #[error("no workspace registered for task {0}")]
    NotFound(TaskId),

    #[error("failed to provision workspace {name}: {reason}")]
    Provision { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("worker command is empty")]
    EmptyCommand,

    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("process {pid} timed out after {after:?}")]
    Timeout { pid: u32, after: Duration },

    #[error("process {pid} is not running")]
    NotRunning { pid: u32 },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid task: {0}")]
    Spec(#[from] SpecError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Invalid pattern {pattern}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Scheduler is no longer running")]
    SchedulerClosed,

    #[error("Unsupported batch file: {0}")]
    UnsupportedBatch(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;
