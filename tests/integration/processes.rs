//! Process-backed executor tests.
//!
//! Real worker processes (`sh -c ...`) running inside their worktrees.

use std::time::{Duration, Instant};

use weft::core::{ErrorClass, ExecutionOutcome, TaskSpec};
use weft::{Config, Orchestrator};

use crate::fixtures::{summary, TestRepo};

fn shell(repo: &TestRepo, script: &str) -> Config {
    let mut config = repo.config(2);
    config.command = vec!["sh".into(), "-c".into(), script.into()];
    config
}

fn orchestrator(repo: &TestRepo, config: Config) -> Orchestrator {
    Orchestrator::new(repo.path.clone(), config).with_resource_monitor(false)
}

/// Test: Workers see their task context
/// Given a command writing a file named after WEFT_TASK_ID
/// When a two-task chain runs
/// Then both files land on the integration branch
#[tokio::test]
async fn test_command_workers_integrate() {
    let repo = TestRepo::new();
    let config = shell(&repo, r#"echo "$WEFT_TASK_ID" > "out-$WEFT_TASK_ID.txt""#);
    let specs = vec![TaskSpec::new("a"), TaskSpec::new("b").with_deps(["a"])];

    let report = orchestrator(&repo, config).run(specs).await.unwrap();

    assert!(report.is_success(), "{}", report.to_json().unwrap());
    assert_eq!(repo.file_on_branch("weft/integration", "out-a.txt").as_deref(), Some("a\n"));
    assert_eq!(repo.file_on_branch("weft/integration", "out-b.txt").as_deref(), Some("b\n"));
    assert!(report.records.iter().all(|r| r.pid.is_some() && r.log_path.is_some()));
}

/// Test: Transient indicator in the log
/// Given a worker that prints a rate-limit error on its first attempt
/// When the batch runs
/// Then the failure is retried and the second attempt succeeds
#[tokio::test]
async fn test_log_pattern_makes_exit_transient() {
    let repo = TestRepo::new();
    let config = shell(
        &repo,
        r#"if [ "$WEFT_ATTEMPT" = "1" ]; then echo "upstream rate limit exceeded" >&2; exit 1; fi; echo ok > ok.txt"#,
    );

    let report = orchestrator(&repo, config)
        .run(vec![TaskSpec::new("flaky")])
        .await
        .unwrap();

    let flaky = summary(&report, "flaky");
    assert_eq!(flaky.status, "completed");
    assert_eq!(flaky.attempts, 2);
    assert_eq!(report.records[0].outcome, ExecutionOutcome::Exited { code: 1 });
}

/// Test: Plain non-zero exit
/// Given a worker that exits 3 without a transient indicator
/// When the batch runs
/// Then the task fails permanently on its first attempt
#[tokio::test]
async fn test_plain_exit_is_permanent() {
    let repo = TestRepo::new();
    let config = shell(&repo, "echo 'syntax error' >&2; exit 3");

    let report = orchestrator(&repo, config)
        .run(vec![TaskSpec::new("broken")])
        .await
        .unwrap();

    let broken = summary(&report, "broken");
    assert_eq!(broken.status, "failed");
    assert_eq!(broken.error_class, Some(ErrorClass::Permanent));
    assert_eq!(report.records.len(), 1);
}

/// Test: Timeout enforcement
/// Given a worker that sleeps past the timeout and one retry allowed
/// When the batch runs
/// Then both attempts are terminated and the task fails permanently
#[tokio::test]
async fn test_timeout_terminates_and_retries() {
    let repo = TestRepo::new();
    let mut config = shell(&repo, "sleep 30");
    config.task_timeout_secs = 1;

    let started = Instant::now();
    let report = orchestrator(&repo, config)
        .run(vec![TaskSpec::new("slow")])
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    let slow = summary(&report, "slow");
    assert_eq!(slow.status, "failed");
    assert_eq!(slow.attempts, 2);
    assert!(report
        .records
        .iter()
        .all(|r| matches!(r.outcome, ExecutionOutcome::TimedOut { .. })));
}

/// Test: Missing worker program
/// Given a command that does not exist
/// When the batch runs
/// Then the task fails permanently with a spawn error
#[tokio::test]
async fn test_missing_program_fails_permanently() {
    let repo = TestRepo::new();
    let mut config = repo.config(1);
    config.command = vec!["/nonexistent/weft-worker".into()];

    let report = orchestrator(&repo, config)
        .run(vec![TaskSpec::new("a")])
        .await
        .unwrap();

    let a = summary(&report, "a");
    assert_eq!(a.status, "failed");
    assert_eq!(a.attempts, 1);
    assert!(matches!(report.records[0].outcome, ExecutionOutcome::SpawnFailed { .. }));
}
