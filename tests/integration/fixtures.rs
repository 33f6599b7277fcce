//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - A scripted in-process executor that records timing
//! - Hooks that record their calls

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use git2::{Repository, Signature};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use weft::core::{ExecutionOutcome, ExecutionRecord, TaskFailure, TaskId, TaskSpec};
use weft::orchestration::{Executor, IntegrationDiff, IntegrationHooks};
use weft::report::{Report, TaskSummary};
use weft::workspace::Workspace;
use weft::{Config, Orchestrator};

/// A test repository with a temporary directory and an initial commit.
pub struct TestRepo {
    /// Holds the repo, worktrees and state dir.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        let repo = Repository::init(&path).expect("Failed to init repo");

        std::fs::write(path.join("README.md"), "# Test Repository\n").unwrap();
        std::fs::write(path.join("app.py"), "print('base')\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.add_path(Path::new("app.py")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test User", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();

        Self { temp_dir, path }
    }

    /// Commit `file` with `content` on top of HEAD.
    pub fn commit_file(&self, file: &str, content: &str) {
        let repo = Repository::open(&self.path).unwrap();
        std::fs::write(self.path.join(file), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(file)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        let sig = Signature::now("Test User", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, &format!("Add {}", file), &tree, &[&parent])
            .unwrap();
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.temp_dir.path().join("worktrees")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.temp_dir.path().join("state")
    }

    /// Config pointing every directory into the temp dir, with fast timers.
    pub fn config(&self, max_parallel: usize) -> Config {
        Config {
            max_parallel,
            max_retries: 1,
            poll_interval_ms: 20,
            termination_grace_ms: 200,
            backoff_base_ms: 20,
            backoff_max_ms: 100,
            circuit_min_samples: 100,
            workspace_dir: Some(self.worktrees_dir().display().to_string()),
            state_dir: Some(self.state_dir().display().to_string()),
            ..Config::default()
        }
    }

    /// Contents of `file` at the tip of `branch`, if both exist.
    pub fn file_on_branch(&self, branch: &str, file: &str) -> Option<String> {
        let repo = Repository::open(&self.path).ok()?;
        let branch = repo.find_branch(branch, git2::BranchType::Local).ok()?;
        let tree = branch.get().peel_to_tree().ok()?;
        let entry = tree.get_path(Path::new(file)).ok()?;
        let blob = repo.find_blob(entry.id()).ok()?;
        Some(String::from_utf8_lossy(blob.content()).into_owned())
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        Repository::open(&self.path)
            .and_then(|r| r.find_branch(name, git2::BranchType::Local).map(|_| ()))
            .is_ok()
    }

    /// Worktree directories currently on disk.
    pub fn worktrees_on_disk(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.worktrees_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// One scripted attempt.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write files into the workspace after `delay_ms`.
    Write {
        files: Vec<(String, String)>,
        delay_ms: u64,
    },
    /// End with this outcome without touching the workspace.
    Exit(ExecutionOutcome),
    /// Run until cancelled.
    Hang,
}

impl Step {
    pub fn write(file: &str, content: &str, delay_ms: u64) -> Self {
        Step::Write {
            files: vec![(file.to_string(), content.to_string())],
            delay_ms,
        }
    }

    pub fn timeout() -> Self {
        Step::Exit(ExecutionOutcome::TimedOut { after_ms: 10 })
    }

    pub fn exit(code: i32) -> Self {
        Step::Exit(ExecutionOutcome::Exited { code })
    }
}

/// When an attempt ran, measured on the test's clock.
#[derive(Debug, Clone)]
pub struct Span {
    pub task_id: TaskId,
    pub attempt: u32,
    pub start: Instant,
    pub end: Instant,
}

impl Span {
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// In-process executor driven by per-task scripts. Tasks without a
/// script write `<id>.txt` after a short delay.
#[derive(Default)]
pub struct ScriptedExecutor {
    steps: Mutex<HashMap<TaskId, VecDeque<Step>>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    spans: Mutex<Vec<Span>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, id: &str, steps: Vec<Step>) {
        self.steps
            .lock()
            .unwrap()
            .insert(TaskId::from(id), steps.into());
    }

    /// Most attempts ever running at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().unwrap().clone()
    }

    pub fn spans_for(&self, id: &str) -> Vec<Span> {
        self.spans()
            .into_iter()
            .filter(|s| s.task_id.as_str() == id)
            .collect()
    }

    pub fn ran(&self, id: &str) -> bool {
        !self.spans_for(id).is_empty()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn prepare(&self, _task: &TaskSpec, _workspace: &Workspace) -> weft::Result<()> {
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
        let start = Instant::now();
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let step = self
            .steps
            .lock()
            .unwrap()
            .get_mut(&task.id)
            .and_then(|s| s.pop_front())
            .unwrap_or_else(|| Step::write(&format!("{}.txt", task.id), "done\n", 30));

        let outcome = match step {
            Step::Write { files, delay_ms } => {
                tokio::select! {
                    _ = cancel.cancelled() => ExecutionOutcome::Cancelled,
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                        for (file, content) in files {
                            let path = workspace.path.join(&file);
                            if let Some(parent) = path.parent() {
                                std::fs::create_dir_all(parent).unwrap();
                            }
                            std::fs::write(path, content).unwrap();
                        }
                        ExecutionOutcome::Succeeded
                    }
                }
            }
            Step::Exit(outcome) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                outcome
            }
            Step::Hang => {
                cancel.cancelled().await;
                ExecutionOutcome::Cancelled
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.spans.lock().unwrap().push(Span {
            task_id: task.id.clone(),
            attempt,
            start,
            end: Instant::now(),
        });
        ExecutionRecord::without_process(task.id.clone(), attempt, started_at, outcome)
    }

    async fn collect_artifacts(
        &self,
        _task: &TaskSpec,
        workspace: &Workspace,
    ) -> weft::Result<Vec<String>> {
        let repo = Repository::open(&workspace.path)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses
            .iter()
            .filter_map(|s| s.path().map(str::to_string))
            .collect())
    }
}

/// Hooks that remember every call.
#[derive(Default)]
pub struct RecordingHooks {
    pub integrated: Mutex<Vec<TaskId>>,
    pub failed: Mutex<Vec<TaskId>>,
}

#[async_trait]
impl IntegrationHooks for RecordingHooks {
    async fn on_task_integrated(&self, task: &TaskId, _diff: &IntegrationDiff) {
        self.integrated.lock().unwrap().push(task.clone());
    }

    async fn on_task_failed(&self, task: &TaskId, _failure: &TaskFailure) {
        self.failed.lock().unwrap().push(task.clone());
    }
}

pub fn orchestrator(
    repo: &TestRepo,
    config: Config,
    executor: Arc<ScriptedExecutor>,
) -> Orchestrator {
    Orchestrator::new(repo.path.clone(), config)
        .with_executor(executor)
        .with_resource_monitor(false)
}

pub fn independent_tasks(count: usize) -> Vec<TaskSpec> {
    (0..count).map(|i| TaskSpec::new(format!("task-{}", i))).collect()
}

pub fn summary<'a>(report: &'a Report, id: &str) -> &'a TaskSummary {
    report
        .task(&TaskId::from(id))
        .unwrap_or_else(|| panic!("task {} missing from report", id))
}
