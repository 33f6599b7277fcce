//! The worker boundary.
//!
//! The engine only sees an [`Executor`]: something that prepares a
//! workspace, runs a task in it and reports what it produced. What the
//! worker actually does is opaque.

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::core::record::{ExecutionOutcome, ExecutionRecord};
use crate::core::task::TaskSpec;
use crate::orchestration::supervisor::{ProcessHandle, ProcessSupervisor, ATTEMPT_HEADER};
use crate::util::tail_file;
use crate::workspace::{Workspace, WorkspaceManager};
use crate::Result;

/// Bytes of worker log inspected when classifying a failure.
pub const LOG_TAIL_BYTES: u64 = 8 * 1024;

#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Called once per attempt before [`Executor::run`].
    async fn prepare(&self, task: &TaskSpec, workspace: &Workspace) -> Result<()>;

    /// Run one attempt to completion. Failures to start are reported in
    /// the record's outcome, not as an error.
    async fn run(
        &self,
        task: &TaskSpec,
        workspace: &Workspace,
        attempt: u32,
        cancel: CancellationToken,
    ) -> ExecutionRecord;

    /// Files the attempt produced, relative to the workspace root.
    async fn collect_artifacts(
        &self,
        task: &TaskSpec,
        workspace: &Workspace,
    ) -> Result<Vec<String>>;

    /// Keep watching a process adopted after a supervisor restart.
    async fn resume(&self, handle: ProcessHandle, _cancel: CancellationToken) -> ExecutionRecord {
        ExecutionRecord::without_process(
            handle.task_id().clone(),
            handle.attempt(),
            handle.marker().started_at,
            ExecutionOutcome::Lost {
                reason: "executor cannot resume adopted processes".into(),
            },
        )
    }

    /// Tail of the attempt's output, used to spot transient errors. Output
    /// of earlier attempts sharing the log is cut off.
    fn log_tail(&self, record: &ExecutionRecord) -> String {
        let tail = record
            .log_path
            .as_deref()
            .map(|p| tail_file(p, LOG_TAIL_BYTES))
            .unwrap_or_default();
        match tail.rfind(ATTEMPT_HEADER) {
            Some(i) => tail[i..].to_string(),
            None => tail,
        }
    }
}

/// Runs the configured worker command under a [`ProcessSupervisor`].
#[derive(Clone)]
pub struct CommandExecutor {
    supervisor: ProcessSupervisor,
    workspaces: WorkspaceManager,
}

impl CommandExecutor {
    pub fn new(supervisor: ProcessSupervisor, workspaces: WorkspaceManager) -> Self {
        Self {
            supervisor,
            workspaces,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn prepare(&self, _task: &TaskSpec, workspace: &Workspace) -> Result<()> {
        tokio::fs::create_dir_all(self.supervisor.config().logs_dir()).await?;
        if !workspace.path.is_dir() {
            return Err(crate::error::WorkspaceError::NotFound(workspace.task_id.clone()).into());
        }
        Ok(())
    }

    async fn run(
        &self,
        task: &TaskSpec,
        workspace: &Workspace,
        attempt: u32,
        cancel: CancellationToken,
    ) -> ExecutionRecord {
        let started_at = Utc::now();
        match self.supervisor.spawn(task, workspace, attempt) {
            Ok(handle) => self.supervisor.monitor(handle, cancel).await,
            Err(e) => {
                let mut record = ExecutionRecord::without_process(
                    task.id.clone(),
                    attempt,
                    started_at,
                    ExecutionOutcome::SpawnFailed {
                        reason: e.to_string(),
                    },
                );
                record.log_path = Some(self.supervisor.log_path(workspace));
                record
            }
        }
    }

    async fn collect_artifacts(
        &self,
        _task: &TaskSpec,
        workspace: &Workspace,
    ) -> Result<Vec<String>> {
        Ok(self.workspaces.capture(workspace).await?.changed_files)
    }

    async fn resume(&self, handle: ProcessHandle, cancel: CancellationToken) -> ExecutionRecord {
        self.supervisor.monitor(handle, cancel).await
    }
}
