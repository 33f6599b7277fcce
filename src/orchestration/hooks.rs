//! Callbacks into external collaborators (issue trackers, chat, CI).
//!
//! Implementations must be idempotent: the engine may call them again
//! for the same task after a restart.

use async_trait::async_trait;
use serde::Serialize;

use crate::core::task::{TaskFailure, TaskId};

/// What a task contributed to the integration branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrationDiff {
    /// The task's own commit.
    pub commit: String,
    /// Integration branch tip after folding the task in.
    pub integrated_as: String,
    pub files: Vec<String>,
}

#[async_trait]
pub trait IntegrationHooks: Send + Sync + 'static {
    async fn on_task_integrated(&self, _task: &TaskId, _diff: &IntegrationDiff) {}

    async fn on_task_failed(&self, _task: &TaskId, _failure: &TaskFailure) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl IntegrationHooks for NoopHooks {}
