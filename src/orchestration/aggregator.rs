//! Result aggregation: validate a finished task's output and fold it into
//! the integration branch.
//!
//! Integration is serialized behind one lock. Before merging, the files a
//! task changed are compared with what landed on the integration branch
//! since the task's base commit, including work integrated by an earlier
//! run. Any overlap escalates the task for manual resolution instead of
//! merging it. Each integration also bumps a sequence number, which names
//! the tasks a conflict came from.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::core::record::ExecutionRecord;
use crate::core::task::{ErrorKind, TaskFailure, TaskId};
use crate::git::{GitOps, IntegrateResult};
use crate::orchestration::hooks::IntegrationDiff;
use crate::util::blocking;
use crate::workspace::{Workspace, WorkspaceManager};
use crate::{wlog, wlog_debug, wlog_warn, Result};

/// A consistent view of the integration branch for provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseSnapshot {
    pub commit: String,
    pub seq: u64,
}

/// A task waiting for a human to resolve its merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualResolution {
    pub task_id: TaskId,
    pub branch: String,
    pub workspace: PathBuf,
    pub commit: String,
    pub files: Vec<String>,
    pub conflicts_with: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntegrationOutcome {
    Integrated(IntegrationDiff),
    /// The worker reported success but its output is unusable.
    Invalid(TaskFailure),
    Escalated {
        failure: TaskFailure,
        resolution: ManualResolution,
    },
}

#[derive(Debug, Clone)]
struct IntegratedEntry {
    seq: u64,
    task_id: TaskId,
    files: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    seq: u64,
    integrated: Vec<IntegratedEntry>,
    manual_queue: Vec<ManualResolution>,
}

#[derive(Clone)]
pub struct ResultAggregator {
    git: GitOps,
    workspaces: WorkspaceManager,
    branch: String,
    state: Arc<Mutex<State>>,
}

impl ResultAggregator {
    pub fn new(git: GitOps, workspaces: WorkspaceManager, branch: impl Into<String>) -> Self {
        Self {
            git,
            workspaces,
            branch: branch.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Make sure the integration branch exists and return its tip.
    pub async fn init(&self) -> Result<String> {
        let git = self.git.clone();
        let branch = self.branch.clone();
        blocking(move || git.ensure_branch(&branch)).await
    }

    /// Integration branch tip together with the matching sequence number.
    pub async fn snapshot(&self) -> Result<BaseSnapshot> {
        let state = self.state.lock().await;
        let git = self.git.clone();
        let branch = self.branch.clone();
        let commit = blocking(move || git.ensure_branch(&branch)).await?;
        Ok(BaseSnapshot {
            commit,
            seq: state.seq,
        })
    }

    pub async fn manual_queue(&self) -> Vec<ManualResolution> {
        self.state.lock().await.manual_queue.clone()
    }

    pub async fn integrated_count(&self) -> u64 {
        self.state.lock().await.seq
    }

    /// Validate a successful attempt and integrate it.
    ///
    /// # Errors
    /// Only infrastructure failures (git, I/O) are errors. Validation
    /// failures and conflicts are reported through [`IntegrationOutcome`].
    pub async fn finalize(
        &self,
        task: &TaskId,
        record: &ExecutionRecord,
        workspace: &Workspace,
        artifacts: &[String],
    ) -> Result<IntegrationOutcome> {
        if artifacts.is_empty() {
            return Ok(IntegrationOutcome::Invalid(TaskFailure::permanent(
                ErrorKind::ValidationError,
                format!("attempt {} succeeded but produced no artifacts", record.attempt),
                "check that the worker writes its changes into the workspace",
            )));
        }

        let capture = self.workspaces.capture(workspace).await?;
        if capture.changed_files.is_empty() {
            return Ok(IntegrationOutcome::Invalid(TaskFailure::permanent(
                ErrorKind::ValidationError,
                "worker output left no changes against the base revision",
                "check that the worker writes its changes into the workspace",
            )));
        }

        let mut state = self.state.lock().await;

        let git = self.git.clone();
        let branch = self.branch.clone();
        let base = workspace.base_commit.clone();
        let landed = blocking(move || {
            let tip = git.ensure_branch(&branch)?;
            git.changed_files(&base, &tip)
        })
        .await?;
        let files: Vec<String> = capture
            .changed_files
            .iter()
            .filter(|f| landed.contains(f))
            .cloned()
            .collect();
        if !files.is_empty() {
            let with: Vec<TaskId> = state
                .integrated
                .iter()
                .filter(|e| e.seq > workspace.base_seq)
                .filter(|e| e.files.iter().any(|f| files.contains(f)))
                .map(|e| e.task_id.clone())
                .collect();
            return Ok(self.escalate(&mut state, task, workspace, capture.head, files, with));
        }

        let git = self.git.clone();
        let branch = self.branch.clone();
        let head = capture.head.clone();
        let message = format!("weft: integrate task {}", task);
        let result = blocking(move || git.integrate(&branch, &head, &message)).await?;

        let integrated_as = match result {
            IntegrateResult::Conflict(paths) => {
                let with: Vec<TaskId> = state
                    .integrated
                    .iter()
                    .filter(|e| e.files.iter().any(|f| paths.contains(f)))
                    .map(|e| e.task_id.clone())
                    .collect();
                return Ok(self.escalate(&mut state, task, workspace, capture.head, paths, with));
            }
            IntegrateResult::FastForward(oid) | IntegrateResult::Merged(oid) => oid,
            IntegrateResult::UpToDate => capture.head.clone(),
        };

        state.seq += 1;
        let seq = state.seq;
        state.integrated.push(IntegratedEntry {
            seq,
            task_id: task.clone(),
            files: capture.changed_files.clone(),
        });
        wlog!("Integrated task {} into {} (seq {})", task, self.branch, seq);

        Ok(IntegrationOutcome::Integrated(IntegrationDiff {
            commit: capture.head,
            integrated_as,
            files: capture.changed_files,
        }))
    }

    fn escalate(
        &self,
        state: &mut State,
        task: &TaskId,
        workspace: &Workspace,
        commit: String,
        files: Vec<String>,
        conflicts_with: Vec<TaskId>,
    ) -> IntegrationOutcome {
        let hint = if conflicts_with.is_empty() {
            "merge conflict; requires manual resolution".to_string()
        } else {
            let names: Vec<&str> = conflicts_with.iter().map(TaskId::as_str).collect();
            format!(
                "merge conflict with task {}; requires manual resolution",
                names.join(", ")
            )
        };
        wlog_warn!("Escalating task {}: {} on {}", task, hint, files.join(", "));

        let resolution = ManualResolution {
            task_id: task.clone(),
            branch: workspace.branch.clone(),
            workspace: workspace.path.clone(),
            commit,
            files: files.clone(),
            conflicts_with,
        };
        state.manual_queue.push(resolution.clone());
        wlog_debug!("Manual queue length: {}", state.manual_queue.len());

        IntegrationOutcome::Escalated {
            failure: TaskFailure::permanent(
                ErrorKind::MergeConflict,
                format!("changes to {} overlap already-integrated work", files.join(", ")),
                hint,
            ),
            resolution,
        }
    }
}
