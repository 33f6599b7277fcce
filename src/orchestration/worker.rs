//! Per-task workers.
//!
//! A worker owns one attempt of one task: provision (or reset) the
//! workspace, run the executor, classify the outcome, and integrate a
//! success. It reports to the scheduler by message and never touches the
//! task table.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::record::{ExecutionOutcome, ExecutionRecord};
use crate::core::task::{ErrorKind, TaskFailure, TaskId, TaskSpec};
use crate::orchestration::aggregator::{IntegrationOutcome, ResultAggregator};
use crate::orchestration::executor::Executor;
use crate::orchestration::failure::FailureClassifier;
use crate::orchestration::hooks::{IntegrationDiff, IntegrationHooks};
use crate::orchestration::supervisor::ProcessHandle;
use crate::workspace::{Workspace, WorkspaceManager};
use crate::{wlog_debug, wlog_error, wlog_warn};

/// Shared collaborators every worker needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub executor: Arc<dyn Executor>,
    pub workspaces: WorkspaceManager,
    pub aggregator: ResultAggregator,
    pub classifier: Arc<FailureClassifier>,
    pub hooks: Arc<dyn IntegrationHooks>,
}

pub enum WorkerStart {
    /// Spawn a new process.
    Fresh,
    /// Keep watching a process found alive after a restart.
    Adopted(ProcessHandle),
}

pub struct WorkerJob {
    pub task: TaskSpec,
    pub attempt: u32,
    /// Workspace from an earlier attempt, reused after a reset.
    pub workspace: Option<Workspace>,
    pub start: WorkerStart,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResult {
    Succeeded(IntegrationDiff),
    Failed(TaskFailure),
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub task_id: TaskId,
    pub attempt: u32,
    pub record: ExecutionRecord,
    pub result: WorkerResult,
}

#[derive(Debug)]
pub enum WorkerMessage {
    /// Sent as soon as the task has a workspace, so the scheduler can
    /// clean it up even if the worker dies afterwards.
    WorkspaceReady { task_id: TaskId, workspace: Workspace },
    Finished(WorkerReport),
}

/// Spawn a worker. A panic inside it is reported as a crashed attempt.
pub fn spawn_worker(
    ctx: WorkerContext,
    job: WorkerJob,
    tx: mpsc::Sender<WorkerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let task_id = job.task.id.clone();
        let attempt = job.attempt;
        let started_at = Utc::now();

        let report = match AssertUnwindSafe(run_worker(ctx, job, tx.clone()))
            .catch_unwind()
            .await
        {
            Ok(report) => report,
            Err(panic) => {
                let reason = panic_message(panic);
                wlog_error!("Worker for task {} panicked: {}", task_id, reason);
                WorkerReport {
                    task_id: task_id.clone(),
                    attempt,
                    record: ExecutionRecord::without_process(
                        task_id,
                        attempt,
                        started_at,
                        ExecutionOutcome::Crashed {
                            reason: reason.clone(),
                        },
                    ),
                    result: WorkerResult::Failed(TaskFailure::transient(
                        ErrorKind::ProcessError,
                        format!("worker panicked: {}", reason),
                        "inspect the weft log",
                    )),
                }
            }
        };

        let _ = tx.send(WorkerMessage::Finished(report)).await;
    })
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn failed(
    task: &TaskSpec,
    attempt: u32,
    started_at: chrono::DateTime<Utc>,
    outcome: ExecutionOutcome,
    failure: TaskFailure,
) -> WorkerReport {
    WorkerReport {
        task_id: task.id.clone(),
        attempt,
        record: ExecutionRecord::without_process(task.id.clone(), attempt, started_at, outcome),
        result: WorkerResult::Failed(failure),
    }
}

async fn acquire_workspace(ctx: &WorkerContext, job: &WorkerJob) -> crate::Result<Workspace> {
    match (&job.workspace, &job.start) {
        (Some(ws), WorkerStart::Adopted(_)) => Ok(ws.clone()),
        (Some(ws), WorkerStart::Fresh) => {
            ctx.workspaces.reset(ws).await?;
            Ok(ws.clone())
        }
        (None, _) => {
            let base = ctx.aggregator.snapshot().await?;
            ctx.workspaces
                .provision(&job.task.id, &base.commit, base.seq)
                .await
        }
    }
}

async fn run_worker(
    ctx: WorkerContext,
    job: WorkerJob,
    tx: mpsc::Sender<WorkerMessage>,
) -> WorkerReport {
    let task = job.task.clone();
    let attempt = job.attempt;
    let started_at = Utc::now();
    wlog_debug!("Worker started for task {} attempt {}", task.id, attempt);

    let workspace = match acquire_workspace(&ctx, &job).await {
        Ok(ws) => ws,
        Err(e) => {
            wlog_warn!("Workspace for task {} unavailable: {}", task.id, e);
            return failed(
                &task,
                attempt,
                started_at,
                ExecutionOutcome::SpawnFailed {
                    reason: e.to_string(),
                },
                TaskFailure::permanent(
                    ErrorKind::WorkspaceError,
                    e.to_string(),
                    "remove the conflicting worktree or branch and re-run",
                ),
            );
        }
    };
    let _ = tx
        .send(WorkerMessage::WorkspaceReady {
            task_id: task.id.clone(),
            workspace: workspace.clone(),
        })
        .await;

    let record = match job.start {
        WorkerStart::Adopted(handle) => ctx.executor.resume(handle, job.cancel.clone()).await,
        WorkerStart::Fresh => {
            if let Err(e) = ctx.executor.prepare(&task, &workspace).await {
                return failed(
                    &task,
                    attempt,
                    started_at,
                    ExecutionOutcome::SpawnFailed {
                        reason: e.to_string(),
                    },
                    TaskFailure::permanent(
                        ErrorKind::ProcessError,
                        format!("prepare failed: {}", e),
                        "check the worker environment",
                    ),
                );
            }
            ctx.executor
                .run(&task, &workspace, attempt, job.cancel.clone())
                .await
        }
    };

    let log_tail = match record.outcome {
        ExecutionOutcome::Exited { .. } => ctx.executor.log_tail(&record),
        _ => String::new(),
    };
    if let Some(failure) = ctx.classifier.classify(&record.outcome, &log_tail) {
        return WorkerReport {
            task_id: task.id.clone(),
            attempt,
            record,
            result: WorkerResult::Failed(failure),
        };
    }

    let result = match integrate(&ctx, &task, &record, &workspace).await {
        Ok(diff) => {
            ctx.hooks.on_task_integrated(&task.id, &diff).await;
            WorkerResult::Succeeded(diff)
        }
        Err(failure) => WorkerResult::Failed(failure),
    };
    WorkerReport {
        task_id: task.id.clone(),
        attempt,
        record,
        result,
    }
}

async fn integrate(
    ctx: &WorkerContext,
    task: &TaskSpec,
    record: &ExecutionRecord,
    workspace: &Workspace,
) -> std::result::Result<IntegrationDiff, TaskFailure> {
    let artifacts = ctx
        .executor
        .collect_artifacts(task, workspace)
        .await
        .map_err(|e| {
            TaskFailure::permanent(
                ErrorKind::ValidationError,
                format!("could not collect artifacts: {}", e),
                "inspect the workspace",
            )
        })?;

    match ctx
        .aggregator
        .finalize(&task.id, record, workspace, &artifacts)
        .await
    {
        Ok(IntegrationOutcome::Integrated(diff)) => Ok(diff),
        Ok(IntegrationOutcome::Invalid(failure)) => Err(failure),
        Ok(IntegrationOutcome::Escalated { failure, .. }) => Err(failure),
        Err(e) => {
            wlog_error!("Integration of task {} failed: {}", task.id, e);
            Err(TaskFailure::permanent(
                ErrorKind::MergeConflict,
                format!("integration failed: {}", e),
                "integrate the task branch manually",
            ))
        }
    }
}
