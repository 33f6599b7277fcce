//! Batch entry point.
//!
//! [`Orchestrator`] wires the components together for one batch: analyze
//! the task records, recover processes left by a previous run, clear stale
//! workspaces, then hand the graph to the [`Scheduler`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::analyzer::{Analysis, TaskAnalyzer};
use crate::core::task::{TaskId, TaskSpec, TaskStatus};
use crate::git::GitOps;
use crate::orchestration::aggregator::ResultAggregator;
use crate::orchestration::executor::{CommandExecutor, Executor};
use crate::orchestration::failure::{FailureClassifier, FailureHandler};
use crate::orchestration::hooks::{IntegrationHooks, NoopHooks};
use crate::orchestration::resources::{ResourceMonitor, SysinfoSampler};
use crate::orchestration::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
use crate::orchestration::supervisor::{ProcessSupervisor, SupervisorConfig};
use crate::orchestration::worker::WorkerContext;
use crate::report::Report;
use crate::workspace::WorkspaceManager;
use crate::{wlog, wlog_debug, Error, Result};

#[derive(Deserialize)]
struct TomlBatch {
    #[serde(default)]
    task: Vec<TaskSpec>,
}

/// Parse a JSON array of task records.
pub fn parse_batch_json(s: &str) -> Result<Vec<TaskSpec>> {
    Ok(serde_json::from_str(s)?)
}

/// Parse `[[task]]` tables.
pub fn parse_batch_toml(s: &str) -> Result<Vec<TaskSpec>> {
    Ok(toml::from_str::<TomlBatch>(s)?.task)
}

/// Load a batch file, picking the format from its extension.
pub fn load_batch(path: &Path) -> Result<Vec<TaskSpec>> {
    let contents = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_batch_json(&contents),
        Some("toml") => parse_batch_toml(&contents),
        _ => Err(Error::UnsupportedBatch(path.to_path_buf())),
    }
}

pub struct Orchestrator {
    repo: PathBuf,
    config: Config,
    executor: Option<Arc<dyn Executor>>,
    hooks: Arc<dyn IntegrationHooks>,
    monitor_resources: bool,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(repo: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            repo: repo.into(),
            config,
            executor: None,
            hooks: Arc::new(NoopHooks),
            monitor_resources: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `executor` instead of running the configured command.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn IntegrationHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_resource_monitor(mut self, enabled: bool) -> Self {
        self.monitor_resources = enabled;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancelling this token aborts every batch started from here.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Analyze without running anything.
    pub fn analyze(&self, specs: Vec<TaskSpec>) -> Result<Analysis> {
        TaskAnalyzer::analyze(specs)
    }

    /// Run a batch to completion.
    ///
    /// # Errors
    /// Fails before any task starts if the configuration or the batch is
    /// invalid (duplicate ids, cycles) or the repository is unusable.
    pub async fn run(&self, specs: Vec<TaskSpec>) -> Result<Report> {
        self.prepare(specs).await?.run().await
    }

    /// Set up a batch without starting it, so callers can grab a
    /// [`SchedulerHandle`] first.
    pub async fn prepare(&self, specs: Vec<TaskSpec>) -> Result<Batch> {
        self.config.validate()?;
        let analysis = TaskAnalyzer::analyze(specs)?;
        wlog!(
            "Batch analyzed: {} tasks, {} levels, {} implicit edges, {} rejected",
            analysis.dag.task_count(),
            analysis.levels.len(),
            analysis.implicit_edges.len(),
            analysis.rejected.len()
        );

        let state_dir = self.config.state_path()?;
        std::fs::create_dir_all(&state_dir)?;
        let git = GitOps::new(&self.repo)?;
        let workspaces = WorkspaceManager::new(git.clone(), self.config.workspaces_dir()?);
        let aggregator = ResultAggregator::new(
            git,
            workspaces.clone(),
            self.config.integration_branch.clone(),
        );
        let tip = aggregator.init().await?;
        wlog_debug!("Integration branch {} at {}", aggregator.branch(), tip);

        let supervisor =
            ProcessSupervisor::new(SupervisorConfig::from_config(&self.config, state_dir));
        let executor: Arc<dyn Executor> = match &self.executor {
            Some(executor) => Arc::clone(executor),
            None => Arc::new(CommandExecutor::new(supervisor.clone(), workspaces.clone())),
        };

        let dag = &analysis.dag;
        let recovered = supervisor
            .reconcile(
                |marker| {
                    dag.status(&marker.task_id) == Some(&TaskStatus::Queued)
                        && dag.get_dependencies(&marker.task_id).is_empty()
                },
                self.config.max_parallel,
            )
            .await;

        let adopted: HashSet<TaskId> = recovered
            .adopted
            .iter()
            .map(|h| h.task_id().clone())
            .collect();
        let stale: Vec<TaskId> = dag
            .all_tasks()
            .into_iter()
            .map(|t| t.id.clone())
            .filter(|id| !adopted.contains(id))
            .collect();
        let pruned = workspaces.prune_stale(&stale).await?;
        if pruned > 0 {
            wlog!("Removed {} stale workspaces", pruned);
        }

        let ctx = WorkerContext {
            executor,
            workspaces,
            aggregator: aggregator.clone(),
            classifier: Arc::new(FailureClassifier::new(&self.config.transient_patterns)?),
            hooks: Arc::clone(&self.hooks),
        };
        let mut scheduler = Scheduler::new(
            analysis.dag,
            ctx,
            SchedulerConfig::from_config(&self.config),
            FailureHandler::from_config(&self.config),
        )
        .with_cancel(self.cancel.child_token());

        for record in recovered.lost {
            scheduler.record_lost(record);
        }
        for handle in recovered.adopted {
            scheduler.adopt(handle);
        }

        let monitor_cancel = CancellationToken::new();
        let mut monitor = None;
        if self.monitor_resources {
            let (tx, rx) = mpsc::channel(16);
            let resource_monitor =
                ResourceMonitor::from_config(SysinfoSampler::new(), &self.config);
            monitor = Some(tokio::spawn(resource_monitor.run(tx, monitor_cancel.clone())));
            scheduler = scheduler.with_resource_signals(rx);
        }

        Ok(Batch {
            scheduler,
            aggregator,
            monitor,
            monitor_cancel,
        })
    }
}

/// A prepared batch.
pub struct Batch {
    scheduler: Scheduler,
    aggregator: ResultAggregator,
    monitor: Option<JoinHandle<()>>,
    monitor_cancel: CancellationToken,
}

impl Batch {
    pub fn handle(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    pub async fn run(self) -> Result<Report> {
        let outcome = self.scheduler.run().await;
        self.monitor_cancel.cancel();
        if let Some(monitor) = self.monitor {
            monitor.await.map_err(|e| Error::TaskJoin(e.to_string()))?;
        }
        let outcome = outcome?;

        let report = Report::build(
            &outcome,
            self.aggregator.manual_queue().await,
            self.aggregator.branch(),
        );
        wlog!(
            "Batch finished: {} completed, {} failed, {} cancelled",
            report.counts.completed,
            report.counts.failed,
            report.counts.cancelled
        );
        Ok(report)
    }
}
