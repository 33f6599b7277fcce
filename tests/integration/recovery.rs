//! Restart recovery tests.
//!
//! A batch started over state left behind by an earlier, interrupted run:
//! stale workspaces and markers of processes that are gone.

use std::time::Duration;

use weft::core::{ErrorKind, ExecutionOutcome, TaskId, TaskSpec};
use weft::git::GitOps;
use weft::workspace::WorkspaceManager;

use crate::fixtures::{orchestrator, summary, ScriptedExecutor, TestRepo};

fn manager(repo: &TestRepo) -> (WorkspaceManager, String) {
    let git = GitOps::new(&repo.path).unwrap();
    let base = git.head_commit().unwrap();
    (WorkspaceManager::new(git, repo.worktrees_dir()), base)
}

/// Test: Stale workspace from an earlier run
/// Given a worktree and branch left behind for task a
/// When a batch containing a runs
/// Then the leftovers are pruned and a completes normally
#[tokio::test]
async fn test_stale_workspace_is_pruned() {
    let repo = TestRepo::new();
    let (workspaces, base) = manager(&repo);
    let stale = workspaces.provision(&TaskId::from("a"), &base, 0).await.unwrap();
    std::fs::write(stale.path.join("half-done.txt"), "partial\n").unwrap();
    assert_eq!(repo.worktrees_on_disk(), vec!["task-a"]);

    let executor = ScriptedExecutor::new();
    let report = orchestrator(&repo, repo.config(1), executor)
        .run(vec![TaskSpec::new("a")])
        .await
        .unwrap();

    assert!(report.is_success());
    let a = summary(&report, "a");
    assert_eq!(a.artifacts, vec!["a.txt"]);
    assert!(repo.worktrees_on_disk().is_empty());
}

#[cfg(unix)]
mod lost_processes {
    use super::*;
    use weft::orchestration::{ProcessSupervisor, SupervisorConfig};
    use weft::Config;

    /// Leave a marker for a worker that has already exited.
    async fn leave_dead_marker(repo: &TestRepo, config: &Config, task: &str) {
        let (workspaces, base) = manager(repo);
        let ws = workspaces
            .provision(&TaskId::from(task), &base, 0)
            .await
            .unwrap();
        let mut config = config.clone();
        config.command = vec!["sh".into(), "-c".into(), "exit 0".into()];
        let state_dir = config.state_path().unwrap();
        let supervisor = ProcessSupervisor::new(SupervisorConfig::from_config(&config, state_dir));
        let handle = supervisor.spawn(&TaskSpec::new(task), &ws, 1).unwrap();
        // Dropped without monitoring, as if the supervisor died.
        drop(handle);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    /// Test: Lost worker consumes a retry
    /// Given a marker for attempt 1 of task a whose process is gone
    /// When a batch containing a runs
    /// Then the lost attempt is recorded and a completes on attempt 2
    #[tokio::test]
    async fn test_lost_attempt_is_retried() {
        let repo = TestRepo::new();
        let config = repo.config(1);
        leave_dead_marker(&repo, &config, "a").await;

        let executor = ScriptedExecutor::new();
        let report = orchestrator(&repo, config, executor.clone())
            .run(vec![TaskSpec::new("a")])
            .await
            .unwrap();

        let a = summary(&report, "a");
        assert_eq!(a.status, "completed");
        assert_eq!(a.attempts, 2);
        assert_eq!(report.records.len(), 2);
        assert!(matches!(report.records[0].outcome, ExecutionOutcome::Lost { .. }));
        assert_eq!(report.records[0].attempt, 1);
        assert_eq!(report.records[1].attempt, 2);
        assert_eq!(executor.spans_for("a")[0].attempt, 2);
    }

    /// Test: Lost worker without retry budget
    /// Given a lost attempt and max_retries=0
    /// When the batch runs
    /// Then the task fails without running again and its dependent is cancelled
    #[tokio::test]
    async fn test_lost_attempt_without_budget_fails() {
        let repo = TestRepo::new();
        let mut config = repo.config(1);
        config.max_retries = 0;
        leave_dead_marker(&repo, &config, "a").await;

        let executor = ScriptedExecutor::new();
        let report = orchestrator(&repo, config, executor.clone())
            .run(vec![TaskSpec::new("a"), TaskSpec::new("b").with_deps(["a"])])
            .await
            .unwrap();

        let a = summary(&report, "a");
        assert_eq!(a.status, "failed");
        assert_eq!(a.error_kind, Some(ErrorKind::ProcessError));
        assert_eq!(summary(&report, "b").status, "cancelled");
        assert!(!executor.ran("a"));
    }

    /// Test: Markers for tasks outside the batch
    /// Given a lost attempt for a task that is not resubmitted
    /// When a different batch runs
    /// Then it is unaffected
    #[tokio::test]
    async fn test_unrelated_marker_is_ignored() {
        let repo = TestRepo::new();
        let config = repo.config(1);
        leave_dead_marker(&repo, &config, "old").await;

        let executor = ScriptedExecutor::new();
        let report = orchestrator(&repo, config, executor)
            .run(vec![TaskSpec::new("new")])
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.records.len(), 1);
    }
}

#[cfg(unix)]
mod live_processes {
    use super::*;
    use weft::orchestration::{ProcessSupervisor, SupervisorConfig};
    use weft::{Config, Orchestrator};

    const BRANCH: &str = "weft/integration";

    /// Start a worker the way an earlier run would have, based on the
    /// integration tip, and leave it running unsupervised.
    async fn leave_running_worker(repo: &TestRepo, config: &Config, task: &str, script: &str) {
        let git = GitOps::new(&repo.path).unwrap();
        let base = git.ensure_branch(BRANCH).unwrap();
        let workspaces = WorkspaceManager::new(git, repo.worktrees_dir());
        let ws = workspaces
            .provision(&TaskId::from(task), &base, 5)
            .await
            .unwrap();
        let mut config = config.clone();
        config.command = vec!["sh".into(), "-c".into(), script.into()];
        let state_dir = config.state_path().unwrap();
        let supervisor = ProcessSupervisor::new(SupervisorConfig::from_config(&config, state_dir));
        let handle = supervisor.spawn(&TaskSpec::new(task), &ws, 1).unwrap();
        // Skip the handle's kill-on-drop, as if its supervisor had died.
        std::mem::forget(handle);
    }

    fn command_orchestrator(repo: &TestRepo, config: Config) -> Orchestrator {
        Orchestrator::new(repo.path.clone(), config).with_resource_monitor(false)
    }

    fn shell(script: String) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script]
    }

    /// Test: Live worker from an earlier run
    /// Given a worker for task old that is still running
    /// When a batch containing old runs
    /// Then the worker is adopted, its output is integrated and it is not started again
    #[tokio::test]
    async fn test_live_worker_is_adopted_and_integrated() {
        let repo = TestRepo::new();
        let mut config = repo.config(2);
        config.command = shell("echo rerun > rerun.txt".into());
        leave_running_worker(&repo, &config, "old", "sleep 1; echo adopted > adopted.txt").await;

        let report = command_orchestrator(&repo, config)
            .run(vec![TaskSpec::new("old")])
            .await
            .unwrap();

        let old = summary(&report, "old");
        assert_eq!(old.status, "completed", "{}", report.to_json().unwrap());
        assert_eq!(old.attempts, 1);
        assert_eq!(old.artifacts, vec!["adopted.txt"]);
        assert_eq!(report.records.len(), 1);
        assert!(report.records[0].adopted);
        assert_eq!(repo.file_on_branch(BRANCH, "adopted.txt").as_deref(), Some("adopted\n"));
        assert!(repo.file_on_branch(BRANCH, "rerun.txt").is_none());
        assert!(repo.worktrees_on_disk().is_empty());
    }

    /// Test: Adopted worker overlapping new work
    /// Given an adopted worker editing line 10 of lines.txt and a new task
    /// editing line 1 of the same file
    /// When both finish, the new task first
    /// Then the adopted task is escalated instead of merged
    #[tokio::test]
    async fn test_adopted_worker_overlap_escalates() {
        let repo = TestRepo::new();
        let lines: Vec<String> = (1..=10).map(|i| format!("line {}", i)).collect();
        let edit = |at: usize, text: &str| {
            let mut copy = lines.clone();
            copy[at] = text.to_string();
            copy.join("\n") + "\n"
        };
        repo.commit_file("lines.txt", &(lines.join("\n") + "\n"));

        let mut config = repo.config(2);
        config.command = shell(format!("printf '%s' '{}' > lines.txt", edit(0, "XTASK")));
        let adopted_script = format!("sleep 2; printf '%s' '{}' > lines.txt", edit(9, "ADOPTED"));
        leave_running_worker(&repo, &config, "old", &adopted_script).await;

        let report = command_orchestrator(&repo, config)
            .run(vec![TaskSpec::new("old"), TaskSpec::new("x")])
            .await
            .unwrap();

        assert_eq!(summary(&report, "x").status, "completed");
        let old = summary(&report, "old");
        assert_eq!(old.status, "failed", "{}", report.to_json().unwrap());
        assert_eq!(old.error_kind, Some(ErrorKind::MergeConflict));
        assert_eq!(report.manual_queue.len(), 1);
        assert_eq!(report.manual_queue[0].task_id, TaskId::from("old"));
        assert_eq!(report.manual_queue[0].conflicts_with, vec![TaskId::from("x")]);

        let merged = repo.file_on_branch(BRANCH, "lines.txt").unwrap();
        assert!(merged.contains("XTASK"));
        assert!(!merged.contains("ADOPTED"));
    }
}
