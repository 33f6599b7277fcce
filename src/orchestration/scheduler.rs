//! Task scheduler.
//!
//! The `Scheduler` owns the task table. It promotes tasks whose
//! dependencies have completed, starts workers up to the effective
//! concurrency limit, and folds worker reports back into the graph.
//!
//! ## Effective concurrency
//!
//! `min(max_parallel, resource slots)`, or 1 once the circuit breaker has
//! switched the batch to sequential execution. Resource slots halve on a
//! pressure signal and double back on relief.
//!
//! ## Events
//!
//! Every status change goes through one transition function, which
//! validates the move and broadcasts a [`SchedulerEvent`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::dag::{schedule_order, TaskDAG};
use crate::core::record::{ExecutionLog, ExecutionOutcome, ExecutionRecord};
use crate::core::task::{ErrorKind, Task, TaskFailure, TaskId, TaskStatus};
use crate::orchestration::failure::{FailureDecision, FailureHandler};
use crate::orchestration::hooks::IntegrationDiff;
use crate::orchestration::resources::ResourceSignal;
use crate::orchestration::supervisor::ProcessHandle;
use crate::orchestration::worker::{
    spawn_worker, WorkerContext, WorkerJob, WorkerMessage, WorkerReport, WorkerResult, WorkerStart,
};
use crate::workspace::Workspace;
use crate::{wlog, wlog_debug, wlog_warn, Error, Result};

const EVENT_CAPACITY: usize = 1024;
const CHANNEL_CAPACITY: usize = 256;

/// Events broadcast by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    StatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// A transient failure will be retried after `delay`.
    Retrying {
        task_id: TaskId,
        /// 1-based retry number.
        retry: u32,
        delay: Duration,
    },
    ConcurrencyChanged {
        effective: usize,
        reason: String,
    },
    /// The circuit breaker tripped; the rest of the batch runs one at a time.
    SequentialFallback {
        failure_rate: f64,
    },
    AllTasksComplete,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    /// Keep workspaces of permanently failed tasks on disk.
    pub keep_failed_workspaces: bool,
}

impl SchedulerConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            max_parallel: config.max_parallel.max(1),
            keep_failed_workspaces: config.keep_failed_workspaces,
        }
    }
}

enum Control {
    CancelTask {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable access to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    dag: Arc<RwLock<TaskDAG>>,
    control: mpsc::Sender<Control>,
    events: broadcast::Sender<SchedulerEvent>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    pub async fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.dag.read().await.status(task_id).cloned()
    }

    /// Copy of every task, in input order.
    pub async fn tasks(&self) -> Vec<Task> {
        self.dag.read().await.all_tasks().into_iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Cancel one task and everything that depends on it. Returns false if
    /// the task was unknown or already terminal.
    ///
    /// # Errors
    /// `Error::SchedulerClosed` once the scheduler has finished.
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::CancelTask {
                task_id: task_id.clone(),
                reply,
            })
            .await
            .map_err(|_| Error::SchedulerClosed)?;
        rx.await.map_err(|_| Error::SchedulerClosed)
    }

    /// Abort the batch: terminate running workers, cancel everything else.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// What the scheduler hands back once every task is terminal.
#[derive(Debug, Clone)]
pub struct SchedulerOutcome {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    pub records: Vec<ExecutionRecord>,
    pub sequential_fallback: bool,
    pub failure_rate: f64,
    /// Highest number of workers running at the same time.
    pub peak_running: usize,
    pub aborted: bool,
    /// Workspaces left on disk for inspection.
    pub retained_workspaces: Vec<Workspace>,
    pub integrations: HashMap<TaskId, IntegrationDiff>,
}

pub struct Scheduler {
    dag: Arc<RwLock<TaskDAG>>,
    ctx: WorkerContext,
    config: SchedulerConfig,
    failures: FailureHandler,
    log: ExecutionLog,

    running: HashMap<TaskId, CancellationToken>,
    /// Running tasks whose cancellation was requested.
    cancel_requested: HashSet<TaskId>,
    /// Queued tasks waiting out a retry backoff.
    backing_off: HashSet<TaskId>,
    workspaces: HashMap<TaskId, Workspace>,
    retained: Vec<Workspace>,
    integrations: HashMap<TaskId, IntegrationDiff>,
    resource_slots: usize,
    peak_running: usize,
    aborted: bool,

    pending_adoptions: Vec<ProcessHandle>,
    prior_records: Vec<ExecutionRecord>,

    events: broadcast::Sender<SchedulerEvent>,
    worker_tx: mpsc::Sender<WorkerMessage>,
    worker_rx: mpsc::Receiver<WorkerMessage>,
    backoff_tx: mpsc::Sender<TaskId>,
    backoff_rx: mpsc::Receiver<TaskId>,
    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
    resource_rx: Option<mpsc::Receiver<ResourceSignal>>,
    cancel: CancellationToken,
    background: JoinSet<()>,
}

impl Scheduler {
    pub fn new(
        dag: TaskDAG,
        ctx: WorkerContext,
        config: SchedulerConfig,
        failures: FailureHandler,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (worker_tx, worker_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (backoff_tx, backoff_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let resource_slots = config.max_parallel.max(1);
        Self {
            dag: Arc::new(RwLock::new(dag)),
            ctx,
            config,
            failures,
            log: ExecutionLog::new(),
            running: HashMap::new(),
            cancel_requested: HashSet::new(),
            backing_off: HashSet::new(),
            workspaces: HashMap::new(),
            retained: Vec::new(),
            integrations: HashMap::new(),
            resource_slots,
            peak_running: 0,
            aborted: false,
            pending_adoptions: Vec::new(),
            prior_records: Vec::new(),
            events,
            worker_tx,
            worker_rx,
            backoff_tx,
            backoff_rx,
            control_tx,
            control_rx,
            resource_rx: None,
            cancel: CancellationToken::new(),
            background: JoinSet::new(),
        }
    }

    /// Tie the scheduler to an outer abort token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_resource_signals(mut self, rx: mpsc::Receiver<ResourceSignal>) -> Self {
        self.resource_rx = Some(rx);
        self
    }

    /// Keep monitoring a process that survived a supervisor restart.
    pub fn adopt(&mut self, handle: ProcessHandle) {
        self.pending_adoptions.push(handle);
    }

    /// Account for an attempt that was lost while no supervisor was running.
    pub fn record_lost(&mut self, record: ExecutionRecord) {
        self.prior_records.push(record);
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            dag: Arc::clone(&self.dag),
            control: self.control_tx.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn effective_concurrency(&self) -> usize {
        if self.failures.is_sequential() {
            1
        } else {
            self.config.max_parallel.min(self.resource_slots).max(1)
        }
    }

    /// Run until every task is terminal.
    ///
    /// # Errors
    /// Only internal invariant violations (an illegal transition) abort the
    /// run. Task failures are recorded on the tasks.
    pub async fn run(mut self) -> Result<SchedulerOutcome> {
        let started_at = Utc::now();
        wlog!(
            "Scheduler starting: {} tasks, max_parallel {}",
            self.dag.read().await.task_count(),
            self.config.max_parallel
        );

        self.seed().await?;
        self.dispatch().await?;

        loop {
            if self.is_done().await {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if !self.aborted => {
                    self.abort().await?;
                }
                Some(msg) = self.worker_rx.recv() => {
                    self.on_worker_message(msg).await?;
                }
                Some(control) = self.control_rx.recv() => {
                    self.on_control(control).await?;
                }
                Some(task_id) = self.backoff_rx.recv() => {
                    if self.backing_off.remove(&task_id) {
                        wlog_debug!("Backoff elapsed for task {}", task_id);
                    }
                }
                signal = recv_optional(&mut self.resource_rx) => {
                    match signal {
                        Some(signal) => self.on_resource_signal(signal),
                        None => self.resource_rx = None,
                    }
                }
                else => break,
            }

            self.dispatch().await?;
        }

        let _ = self.events.send(SchedulerEvent::AllTasksComplete);
        while self.background.join_next().await.is_some() {}

        let tasks = self
            .dag
            .read()
            .await
            .all_tasks()
            .into_iter()
            .cloned()
            .collect();
        wlog!(
            "Scheduler finished: {} attempts, failure rate {:.2}",
            self.log.len(),
            self.failures.failure_rate()
        );
        Ok(SchedulerOutcome {
            started_at,
            finished_at: Utc::now(),
            tasks,
            records: self.log.into_records(),
            sequential_fallback: self.failures.is_sequential(),
            failure_rate: self.failures.failure_rate(),
            peak_running: self.peak_running,
            aborted: self.aborted,
            retained_workspaces: self.retained,
            integrations: self.integrations,
        })
    }

    async fn is_done(&self) -> bool {
        self.running.is_empty() && self.dag.read().await.all_terminal()
    }

    /// Apply state inherited from a previous run, then cascade failures
    /// already present in the graph (tasks rejected by the analyzer).
    async fn seed(&mut self) -> Result<()> {
        let dag_lock = Arc::clone(&self.dag);
        let mut dag = dag_lock.write().await;

        for record in std::mem::take(&mut self.prior_records) {
            let id = record.task_id.clone();
            let Some(task) = dag.get_task_mut(&id) else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                continue;
            }
            task.attempts = task.attempts.max(record.attempt);
            let reason = match &record.outcome {
                ExecutionOutcome::Lost { reason } => reason.clone(),
                other => format!("{:?}", other),
            };
            self.log.append(record);

            let failure = TaskFailure::transient(
                ErrorKind::ProcessError,
                format!("worker lost across restart: {}", reason),
                "the task is retried automatically",
            );
            match self.failures.on_failure(&id, failure) {
                FailureDecision::Retry { retry, delay } => {
                    self.schedule_backoff(id, retry, delay);
                }
                FailureDecision::Fail(failure) => {
                    self.fail_task(&mut dag, &id, failure)?;
                }
            }
        }

        for handle in std::mem::take(&mut self.pending_adoptions) {
            let id = handle.task_id().clone();
            let eligible = dag.status(&id) == Some(&TaskStatus::Queued)
                && dag.dependencies_completed(&id)
                && !self.backing_off.contains(&id)
                && self.running.len() < self.effective_concurrency();
            if !eligible {
                wlog_warn!(
                    "Not adopting pid {} for task {}; terminating it",
                    handle.pid(),
                    id
                );
                let executor = Arc::clone(&self.ctx.executor);
                let stop = CancellationToken::new();
                stop.cancel();
                self.background.spawn(async move {
                    executor.resume(handle, stop).await;
                });
                continue;
            }

            if let Some(task) = dag.get_task_mut(&id) {
                task.attempts = handle.attempt().saturating_sub(1);
            }
            let mut workspace = handle.marker().workspace();
            // Sequence numbers restart with every run.
            workspace.base_seq = 0;
            if let Some(task) = dag.get_task_mut(&id) {
                task.set_worktree(workspace.path.clone(), &workspace.branch);
            }
            self.workspaces.insert(id.clone(), workspace);
            wlog!("Adopting pid {} for task {}", handle.pid(), id);
            self.start_task(&mut dag, &id, WorkerStart::Adopted(handle))?;
        }

        let failed: Vec<TaskId> = dag
            .all_tasks()
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed { .. }))
            .map(|t| t.id.clone())
            .collect();
        for id in failed {
            self.cascade(&mut dag, &id, &format!("dependency {} failed", id))?;
        }
        Ok(())
    }

    /// Promote tasks whose dependencies completed and start as many ready
    /// tasks as the concurrency limit allows.
    async fn dispatch(&mut self) -> Result<()> {
        if self.aborted {
            return Ok(());
        }
        let dag_lock = Arc::clone(&self.dag);
        let mut dag = dag_lock.write().await;

        for id in dag.ready_candidates() {
            if !self.backing_off.contains(&id) {
                transition(&mut dag, &self.events, &id, TaskStatus::Ready)?;
            }
        }

        let mut ready: Vec<&Task> = dag
            .all_tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .collect();
        ready.sort_by(|a, b| schedule_order(a, b));
        let ready: Vec<TaskId> = ready.into_iter().map(|t| t.id.clone()).collect();

        let capacity = self.effective_concurrency();
        for id in ready {
            if self.running.len() >= capacity {
                break;
            }
            self.start_task(&mut dag, &id, WorkerStart::Fresh)?;
        }
        Ok(())
    }

    fn start_task(&mut self, dag: &mut TaskDAG, id: &TaskId, start: WorkerStart) -> Result<()> {
        if dag.status(id) == Some(&TaskStatus::Queued) {
            transition(dag, &self.events, id, TaskStatus::Ready)?;
        }
        transition(dag, &self.events, id, TaskStatus::Running)?;
        let task = dag.get_task(id).ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let attempt = task.attempts;

        let token = self.cancel.child_token();
        let job = WorkerJob {
            task: task.spec(),
            attempt,
            workspace: self.workspaces.get(id).cloned(),
            start,
            cancel: token.clone(),
        };
        self.running.insert(id.clone(), token);
        self.peak_running = self.peak_running.max(self.running.len());
        wlog_debug!(
            "Starting task {} attempt {} ({}/{} running)",
            id,
            attempt,
            self.running.len(),
            self.effective_concurrency()
        );

        // The worker always reports back, so its handle is not needed.
        drop(spawn_worker(self.ctx.clone(), job, self.worker_tx.clone()));
        Ok(())
    }

    async fn on_worker_message(&mut self, msg: WorkerMessage) -> Result<()> {
        match msg {
            WorkerMessage::WorkspaceReady { task_id, workspace } => {
                let mut dag = self.dag.write().await;
                if let Some(task) = dag.get_task_mut(&task_id) {
                    task.set_worktree(workspace.path.clone(), &workspace.branch);
                }
                self.workspaces.insert(task_id, workspace);
                Ok(())
            }
            WorkerMessage::Finished(report) => self.on_report(report).await,
        }
    }

    async fn on_report(&mut self, report: WorkerReport) -> Result<()> {
        let WorkerReport {
            task_id: id,
            attempt,
            record,
            result,
        } = report;
        self.running.remove(&id);
        self.log.append(record);

        let dag_lock = Arc::clone(&self.dag);
        let mut dag = dag_lock.write().await;

        let requested = self.cancel_requested.remove(&id);
        match result {
            WorkerResult::Succeeded(diff) => {
                if let Some(task) = dag.get_task_mut(&id) {
                    task.set_commit(&diff.commit);
                }
                transition(&mut dag, &self.events, &id, TaskStatus::Completed)?;
                wlog!("Task {} completed on attempt {}", id, attempt);
                self.record_terminal(true);
                self.release_workspace(&id, false);
                self.integrations.insert(id, diff);
            }
            WorkerResult::Failed(_) if requested || self.aborted => {
                let reason = if self.aborted {
                    "batch aborted"
                } else {
                    "cancelled by request"
                };
                transition(
                    &mut dag,
                    &self.events,
                    &id,
                    TaskStatus::Cancelled {
                        reason: reason.into(),
                    },
                )?;
                self.cascade(&mut dag, &id, &format!("dependency {} was cancelled", id))?;
                self.release_workspace(&id, self.config.keep_failed_workspaces);
            }
            WorkerResult::Failed(failure) => match self.failures.on_failure(&id, failure) {
                FailureDecision::Retry { retry, delay } => {
                    transition(&mut dag, &self.events, &id, TaskStatus::Queued)?;
                    self.schedule_backoff(id, retry, delay);
                }
                FailureDecision::Fail(failure) => {
                    self.fail_task(&mut dag, &id, failure)?;
                }
            },
        }
        Ok(())
    }

    /// Move a task to Failed, cancel its dependents and dispose of its
    /// workspace.
    fn fail_task(&mut self, dag: &mut TaskDAG, id: &TaskId, failure: TaskFailure) -> Result<()> {
        wlog_warn!("Task {} failed: {}", id, failure);
        let keep = failure.kind == ErrorKind::MergeConflict || self.config.keep_failed_workspaces;
        transition(
            dag,
            &self.events,
            id,
            TaskStatus::Failed {
                failure: failure.clone(),
            },
        )?;
        self.record_terminal(false);
        self.cascade(dag, id, &format!("dependency {} failed", id))?;
        self.release_workspace(id, keep);

        let hooks = Arc::clone(&self.ctx.hooks);
        let id = id.clone();
        self.background.spawn(async move {
            hooks.on_task_failed(&id, &failure).await;
        });
        Ok(())
    }

    /// Block then cancel every non-terminal descendant of `root`.
    fn cascade(&mut self, dag: &mut TaskDAG, root: &TaskId, reason: &str) -> Result<()> {
        for id in dag.descendants(root) {
            let Some(status) = dag.status(&id).cloned() else {
                continue;
            };
            match status {
                TaskStatus::Queued | TaskStatus::Ready => {
                    transition(
                        dag,
                        &self.events,
                        &id,
                        TaskStatus::Blocked {
                            reason: reason.to_string(),
                        },
                    )?;
                    transition(
                        dag,
                        &self.events,
                        &id,
                        TaskStatus::Cancelled {
                            reason: reason.to_string(),
                        },
                    )?;
                }
                TaskStatus::Blocked { .. } => {
                    transition(
                        dag,
                        &self.events,
                        &id,
                        TaskStatus::Cancelled {
                            reason: reason.to_string(),
                        },
                    )?;
                }
                _ => continue,
            }
            self.backing_off.remove(&id);
            self.release_workspace(&id, self.config.keep_failed_workspaces);
        }
        Ok(())
    }

    fn record_terminal(&mut self, success: bool) {
        if let Some(rate) = self.failures.record_terminal(success) {
            wlog_warn!(
                "Failure rate {:.2} over threshold; switching to sequential execution",
                rate
            );
            let _ = self
                .events
                .send(SchedulerEvent::SequentialFallback { failure_rate: rate });
            let _ = self.events.send(SchedulerEvent::ConcurrencyChanged {
                effective: 1,
                reason: "sequential fallback".into(),
            });
        }
    }

    fn schedule_backoff(&mut self, id: TaskId, retry: u32, delay: Duration) {
        let _ = self.events.send(SchedulerEvent::Retrying {
            task_id: id.clone(),
            retry,
            delay,
        });
        self.backing_off.insert(id.clone());
        let tx = self.backoff_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(id).await;
                }
            }
        });
    }

    /// Destroy or retain the task's workspace off the scheduler loop.
    fn release_workspace(&mut self, id: &TaskId, keep: bool) {
        let Some(mut workspace) = self.workspaces.remove(id) else {
            return;
        };
        let manager = self.ctx.workspaces.clone();
        if keep {
            manager.retain(&mut workspace);
            self.retained.push(workspace);
            return;
        }
        self.background.spawn(async move {
            if let Err(e) = manager.destroy(&mut workspace).await {
                wlog_warn!("Failed to clean up workspace {}: {}", workspace.name, e);
            }
        });
    }

    async fn on_control(&mut self, control: Control) -> Result<()> {
        match control {
            Control::CancelTask { task_id, reply } => {
                let cancelled = self.cancel_one(&task_id).await?;
                let _ = reply.send(cancelled);
                Ok(())
            }
        }
    }

    async fn cancel_one(&mut self, id: &TaskId) -> Result<bool> {
        if let Some(token) = self.running.get(id) {
            wlog!("Cancelling running task {}", id);
            token.cancel();
            self.cancel_requested.insert(id.clone());
            return Ok(true);
        }

        let dag_lock = Arc::clone(&self.dag);
        let mut dag = dag_lock.write().await;
        match dag.status(id) {
            Some(status) if !status.is_terminal() => {
                transition(
                    &mut dag,
                    &self.events,
                    id,
                    TaskStatus::Cancelled {
                        reason: "cancelled by request".into(),
                    },
                )?;
                self.backing_off.remove(id);
                self.cascade(&mut dag, id, &format!("dependency {} was cancelled", id))?;
                self.release_workspace(id, self.config.keep_failed_workspaces);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Global abort. Running workers see their child tokens cancelled and
    /// report back; everything not yet started is cancelled here.
    async fn abort(&mut self) -> Result<()> {
        wlog!("Batch aborted; cancelling {} running tasks", self.running.len());
        self.aborted = true;
        self.backing_off.clear();

        let dag_lock = Arc::clone(&self.dag);
        let mut dag = dag_lock.write().await;
        let pending: Vec<TaskId> = dag
            .all_tasks()
            .into_iter()
            .filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::Queued | TaskStatus::Ready | TaskStatus::Blocked { .. }
                )
            })
            .map(|t| t.id.clone())
            .collect();
        for id in pending {
            transition(
                &mut dag,
                &self.events,
                &id,
                TaskStatus::Cancelled {
                    reason: "batch aborted".into(),
                },
            )?;
            self.release_workspace(&id, self.config.keep_failed_workspaces);
        }
        Ok(())
    }

    fn on_resource_signal(&mut self, signal: ResourceSignal) {
        let max = self.config.max_parallel.max(1);
        let (slots, reason) = match signal {
            ResourceSignal::Pressure(usage) => (
                (self.resource_slots / 2).max(1),
                format!(
                    "resource pressure (cpu {:.0}%, memory {:.0}%)",
                    usage.cpu_percent, usage.memory_percent
                ),
            ),
            ResourceSignal::Relief(_) => (
                (self.resource_slots * 2).min(max),
                "resources recovered".to_string(),
            ),
        };
        if slots == self.resource_slots {
            return;
        }
        self.resource_slots = slots;
        wlog!("Resource slots now {}: {}", slots, reason);
        let _ = self.events.send(SchedulerEvent::ConcurrencyChanged {
            effective: self.effective_concurrency(),
            reason,
        });
    }
}

/// The single place a task's status changes.
fn transition(
    dag: &mut TaskDAG,
    events: &broadcast::Sender<SchedulerEvent>,
    id: &TaskId,
    next: TaskStatus,
) -> Result<()> {
    let task = dag
        .get_task_mut(id)
        .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
    let from = task.transition(next.clone())?;
    wlog_debug!("Task {}: {} -> {}", id, from.name(), next.name());
    let _ = events.send(SchedulerEvent::StatusChanged {
        task_id: id.clone(),
        from,
        to: next,
    });
    Ok(())
}

async fn recv_optional<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
