//! Failure handling tests.
//!
//! Retries, failure isolation, cycle rejection, merge escalation and the
//! sequential fallback.

use std::sync::Arc;
use std::time::Duration;

use weft::core::{ErrorClass, ErrorKind, ExecutionOutcome, TaskId, TaskSpec, TaskStatus};
use weft::error::SpecError;
use weft::Error;

use crate::fixtures::{orchestrator, summary, RecordingHooks, ScriptedExecutor, Step, TestRepo};

/// Test: Permanent failure cancels dependents
/// Given B depends on A
/// When A fails permanently
/// Then B is cancelled and never runs
#[tokio::test]
async fn test_failed_dependency_cancels_dependent() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    executor.script("a", vec![Step::exit(2)]);
    let specs = vec![TaskSpec::new("a"), TaskSpec::new("b").with_deps(["a"])];

    let report = orchestrator(&repo, repo.config(2), executor.clone())
        .run(specs)
        .await
        .unwrap();

    let a = summary(&report, "a");
    assert_eq!(a.status, "failed");
    assert_eq!(a.error_class, Some(ErrorClass::Permanent));
    assert_eq!(a.attempts, 1);

    let b = summary(&report, "b");
    assert_eq!(b.status, "cancelled");
    assert_eq!(b.error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(b.error.as_deref(), Some("dependency a failed"));
    assert!(!executor.ran("b"));
}

/// Test: Timeout is retried once, then fails
/// Given Z times out on every attempt and max_retries=1
/// When the batch runs
/// Then Z runs twice and ends Failed with a permanent class
#[tokio::test]
async fn test_timeout_retried_then_permanent() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    executor.script("z", vec![Step::timeout(), Step::timeout(), Step::timeout()]);

    let report = orchestrator(&repo, repo.config(1), executor.clone())
        .run(vec![TaskSpec::new("z")])
        .await
        .unwrap();

    let z = summary(&report, "z");
    assert_eq!(z.status, "failed");
    assert_eq!(z.attempts, 2);
    assert_eq!(z.error_kind, Some(ErrorKind::ProcessError));
    assert_eq!(z.error_class, Some(ErrorClass::Permanent));
    assert!(z.error.as_deref().unwrap().contains("gave up after 2 attempts"));

    assert_eq!(executor.spans_for("z").len(), 2);
    assert_eq!(report.records.len(), 2);
    assert_eq!(report.records[0].retry_of, None);
    assert_eq!(report.records[1].retry_of, Some(1));
    assert!(report
        .records
        .iter()
        .all(|r| matches!(r.outcome, ExecutionOutcome::TimedOut { .. })));
}

/// Test: Retry backoff is observed
/// Given a transient failure followed by success
/// When the task is retried
/// Then the second attempt starts no earlier than the backoff
#[tokio::test]
async fn test_transient_failure_recovers_after_backoff() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    executor.script("flaky", vec![Step::timeout(), Step::write("flaky.txt", "ok\n", 10)]);
    let mut config = repo.config(1);
    config.backoff_base_ms = 150;
    config.backoff_max_ms = 1000;

    let report = orchestrator(&repo, config, executor.clone())
        .run(vec![TaskSpec::new("flaky")])
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(summary(&report, "flaky").attempts, 2);
    let spans = executor.spans_for("flaky");
    assert_eq!(spans[1].attempt, 2);
    assert!(spans[1].start.duration_since(spans[0].end) >= Duration::from_millis(150));
}

/// Test: Failure isolation
/// Given one failing task and two independent ones
/// When the batch runs
/// Then the independent tasks still complete
#[tokio::test]
async fn test_failure_is_isolated() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    executor.script("bad", vec![Step::exit(1)]);
    let specs = vec![TaskSpec::new("bad"), TaskSpec::new("good-1"), TaskSpec::new("good-2")];

    let report = orchestrator(&repo, repo.config(3), executor)
        .run(specs)
        .await
        .unwrap();

    assert_eq!(report.counts.completed, 2);
    assert_eq!(report.counts.failed, 1);
    assert_eq!(summary(&report, "good-1").status, "completed");
    assert_eq!(summary(&report, "good-2").status, "completed");
}

/// Test: Cycle rejection before execution
/// Given a -> b -> a
/// When the batch is submitted
/// Then it is rejected wholesale and nothing runs
#[tokio::test]
async fn test_cycle_rejected_before_any_task_starts() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    let specs = vec![
        TaskSpec::new("a").with_deps(["b"]),
        TaskSpec::new("b").with_deps(["a"]),
        TaskSpec::new("free"),
    ];

    let err = orchestrator(&repo, repo.config(2), executor.clone())
        .run(specs)
        .await
        .unwrap_err();

    match err {
        Error::Spec(SpecError::Cycle { path }) => {
            assert_eq!(path.first(), path.last());
            assert!(path.contains(&TaskId::from("a")));
        }
        other => panic!("expected a cycle error, got {:?}", other),
    }
    assert!(executor.spans().is_empty());
    assert!(repo.worktrees_on_disk().is_empty());
}

/// Test: Invalid task definitions fail individually
/// Given a task depending on an unknown id and another depending on it
/// When the batch runs
/// Then the invalid task fails with kind SpecError, its dependent is
/// cancelled and unrelated work completes
#[tokio::test]
async fn test_unknown_dependency_rejects_task() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    let specs = vec![
        TaskSpec::new("orphan").with_deps(["ghost"]),
        TaskSpec::new("child").with_deps(["orphan"]),
        TaskSpec::new("fine"),
    ];

    let report = orchestrator(&repo, repo.config(2), executor.clone())
        .run(specs)
        .await
        .unwrap();

    let orphan = summary(&report, "orphan");
    assert_eq!(orphan.status, "failed");
    assert_eq!(orphan.error_kind, Some(ErrorKind::SpecError));
    assert_eq!(orphan.attempts, 0);
    assert_eq!(summary(&report, "child").status, "cancelled");
    assert_eq!(summary(&report, "fine").status, "completed");
    assert!(!executor.ran("orphan"));
    assert!(!executor.ran("child"));
}

/// Test: Merge escalation
/// Given two parallel tasks editing the same file without declaring it
/// When the second one finishes
/// Then it is escalated for manual resolution and its workspace kept
#[tokio::test]
async fn test_overlapping_changes_escalate() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    executor.script("first", vec![Step::write("shared.txt", "first\n", 50)]);
    executor.script("second", vec![Step::write("shared.txt", "second\n", 400)]);
    let specs = vec![TaskSpec::new("first"), TaskSpec::new("second")];

    let report = orchestrator(&repo, repo.config(2), executor)
        .run(specs)
        .await
        .unwrap();

    assert_eq!(summary(&report, "first").status, "completed");
    let second = summary(&report, "second");
    assert_eq!(second.status, "failed");
    assert_eq!(second.error_kind, Some(ErrorKind::MergeConflict));
    assert!(second
        .remediation
        .as_deref()
        .unwrap()
        .contains("merge conflict with task first"));

    assert_eq!(report.manual_queue.len(), 1);
    assert_eq!(report.manual_queue[0].task_id, TaskId::from("second"));
    assert_eq!(report.manual_queue[0].conflicts_with, vec![TaskId::from("first")]);
    assert_eq!(report.retained_workspaces.len(), 1);
    assert!(report.retained_workspaces[0].exists());
    assert_eq!(
        repo.file_on_branch("weft/integration", "shared.txt").as_deref(),
        Some("first\n")
    );
}

/// Test: Success with no output is a validation failure
/// Given a task that reports success but writes nothing
/// When it finishes
/// Then it fails with a validation error and is not retried
#[tokio::test]
async fn test_empty_output_fails_validation() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    executor.script("noop", vec![Step::Exit(ExecutionOutcome::Succeeded)]);

    let report = orchestrator(&repo, repo.config(1), executor)
        .run(vec![TaskSpec::new("noop")])
        .await
        .unwrap();

    let noop = summary(&report, "noop");
    assert_eq!(noop.error_kind, Some(ErrorKind::ValidationError));
    assert_eq!(noop.attempts, 1);
}

/// Test: Sequential fallback
/// Given a failure rate above the threshold once two tasks are terminal
/// When the rest of the batch runs
/// Then it runs one task at a time
#[tokio::test]
async fn test_high_failure_rate_switches_to_sequential() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    executor.script("f1", vec![Step::exit(1)]);
    executor.script("f2", vec![Step::exit(1)]);
    executor.script("gate", vec![Step::write("gate.txt", "g\n", 150)]);
    for id in ["c", "d", "e"] {
        executor.script(id, vec![Step::write(&format!("{}.txt", id), "x\n", 60)]);
    }
    let specs = vec![
        TaskSpec::new("f1").with_priority(10),
        TaskSpec::new("f2").with_priority(10),
        TaskSpec::new("gate").with_priority(5),
        TaskSpec::new("c").with_deps(["gate"]),
        TaskSpec::new("d").with_deps(["gate"]),
        TaskSpec::new("e").with_deps(["gate"]),
    ];
    let mut config = repo.config(3);
    config.circuit_min_samples = 2;
    config.failure_rate_threshold = 0.5;

    let report = orchestrator(&repo, config, executor.clone())
        .run(specs)
        .await
        .unwrap();

    assert!(report.sequential_fallback);
    assert_eq!(report.counts.completed, 4);
    let tail: Vec<_> = ["c", "d", "e"]
        .iter()
        .map(|id| executor.spans_for(id)[0].clone())
        .collect();
    for (i, a) in tail.iter().enumerate() {
        for b in &tail[i + 1..] {
            assert!(!a.overlaps(b), "{} and {} overlapped", a.task_id, b.task_id);
        }
    }
}

/// Test: on_task_failed fires once per terminal failure
/// Given a task that fails transiently until its budget is spent
/// When the batch runs
/// Then the hook fires once, after the final attempt
#[tokio::test]
async fn test_failed_hook_fires_once() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    executor.script("z", vec![Step::timeout(), Step::timeout()]);
    let hooks = Arc::new(RecordingHooks::default());

    orchestrator(&repo, repo.config(1), executor)
        .with_hooks(hooks.clone())
        .run(vec![TaskSpec::new("z")])
        .await
        .unwrap();

    assert_eq!(*hooks.failed.lock().unwrap(), vec![TaskId::from("z")]);
}

/// Test: Failed workspaces kept on request
/// Given keep_failed_workspaces
/// When a task fails
/// Then its workspace stays on disk and is listed in the report
#[tokio::test]
async fn test_keep_failed_workspaces() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    executor.script("bad", vec![Step::exit(3)]);
    let mut config = repo.config(1);
    config.keep_failed_workspaces = true;

    let report = orchestrator(&repo, config, executor)
        .run(vec![TaskSpec::new("bad")])
        .await
        .unwrap();

    assert_eq!(report.retained_workspaces.len(), 1);
    assert_eq!(repo.worktrees_on_disk(), vec!["task-bad"]);
}

/// Test: Global abort
/// Given a hanging task and queued work
/// When cancel_all is called
/// Then the running task is terminated and everything ends Cancelled
#[tokio::test]
async fn test_cancel_all_aborts_batch() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    executor.script("hang", vec![Step::Hang]);
    let specs = vec![
        TaskSpec::new("hang").with_priority(1),
        TaskSpec::new("queued"),
        TaskSpec::new("after").with_deps(["hang"]),
    ];

    let batch = orchestrator(&repo, repo.config(1), executor)
        .prepare(specs)
        .await
        .unwrap();
    let handle = batch.handle();
    let run = tokio::spawn(batch.run());

    while handle.status(&TaskId::from("hang")).await != Some(TaskStatus::Running) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.cancel_all();

    let report = run.await.unwrap().unwrap();
    assert!(report.aborted);
    assert_eq!(report.counts.cancelled, 3);
    assert!(repo.worktrees_on_disk().is_empty());
}

/// Test: Cancel one task
/// Given a hanging task with a dependent and an unrelated task
/// When the hanging task is cancelled
/// Then it and its dependent are cancelled and the rest completes
#[tokio::test]
async fn test_cancel_task_spares_unrelated_work() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new();
    executor.script("hang", vec![Step::Hang]);
    let specs = vec![
        TaskSpec::new("hang"),
        TaskSpec::new("after").with_deps(["hang"]),
        TaskSpec::new("other"),
    ];

    let batch = orchestrator(&repo, repo.config(2), executor)
        .prepare(specs)
        .await
        .unwrap();
    let handle = batch.handle();
    let run = tokio::spawn(batch.run());

    while handle.status(&TaskId::from("hang")).await != Some(TaskStatus::Running) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(handle.cancel_task(&TaskId::from("hang")).await.unwrap());

    let report = run.await.unwrap().unwrap();
    assert_eq!(summary(&report, "hang").status, "cancelled");
    assert_eq!(summary(&report, "after").status, "cancelled");
    assert_eq!(summary(&report, "other").status, "completed");
    assert!(!report.aborted);
}
