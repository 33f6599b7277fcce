//! Worker process supervision.
//!
//! Each task attempt runs as one external process with the workspace as
//! its working directory. The task context goes through `WEFT_*`
//! environment variables and a JSON context file, never the command line.
//! Output is appended to a per-task log file.
//!
//! While a process runs, a JSON marker under `<state_dir>/markers` records
//! its pid and start time. After a supervisor restart, [`ProcessSupervisor::reconcile`]
//! uses the markers to either adopt surviving processes or terminate them.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessStatus as OsProcessStatus, ProcessesToUpdate, Signal, System};
use tokio::process::{Child, Command};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::record::{ExecutionOutcome, ExecutionRecord, ResourceUsage};
use crate::core::task::{TaskId, TaskSpec};
use crate::error::ProcessError;
use crate::workspace::{Workspace, WorkspaceState};
use crate::{wlog_debug, wlog_warn, Result};

/// Start of the line written to the log before each attempt.
pub const ATTEMPT_HEADER: &str = "=== weft: task";
pub const ENV_TASK_ID: &str = "WEFT_TASK_ID";
pub const ENV_TASK_CONTEXT: &str = "WEFT_TASK_CONTEXT";
pub const ENV_WORKSPACE: &str = "WEFT_WORKSPACE";
pub const ENV_ATTEMPT: &str = "WEFT_ATTEMPT";
pub const ENV_DESCRIPTION_REF: &str = "WEFT_DESCRIPTION_REF";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub command: Vec<String>,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub grace: Duration,
    pub state_dir: PathBuf,
}

impl SupervisorConfig {
    pub fn from_config(config: &Config, state_dir: PathBuf) -> Self {
        Self {
            command: config.command.clone(),
            poll_interval: config.poll_interval(),
            timeout: config.task_timeout(),
            grace: config.termination_grace(),
            state_dir,
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn markers_dir(&self) -> PathBuf {
        self.state_dir.join("markers")
    }

    pub fn context_dir(&self) -> PathBuf {
        self.state_dir.join("context")
    }
}

/// Durable note about a live worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMarker {
    pub task_id: TaskId,
    pub pid: u32,
    /// Process start time (seconds since the epoch) as the OS reports it.
    /// Guards against a recycled pid.
    pub start_time: u64,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pub workspace_path: PathBuf,
    pub workspace_name: String,
    pub branch: String,
    pub base_commit: String,
    pub base_seq: u64,
}

impl ProcessMarker {
    /// The workspace the process runs in.
    pub fn workspace(&self) -> Workspace {
        Workspace {
            task_id: self.task_id.clone(),
            name: self.workspace_name.clone(),
            path: self.workspace_path.clone(),
            branch: self.branch.clone(),
            base_commit: self.base_commit.clone(),
            base_seq: self.base_seq,
            state: WorkspaceState::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    Running(ResourceUsage),
    Exited(ExecutionOutcome),
}

/// A supervised process. Adopted processes have no `Child`.
#[derive(Debug)]
pub struct ProcessHandle {
    marker: ProcessMarker,
    marker_path: PathBuf,
    child: Option<Child>,
    peak: Option<ResourceUsage>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.marker.pid
    }

    pub fn task_id(&self) -> &TaskId {
        &self.marker.task_id
    }

    pub fn attempt(&self) -> u32 {
        self.marker.attempt
    }

    pub fn marker(&self) -> &ProcessMarker {
        &self.marker
    }

    pub fn is_adopted(&self) -> bool {
        self.child.is_none()
    }

    fn into_record(self, outcome: ExecutionOutcome) -> ExecutionRecord {
        let adopted = self.is_adopted();
        let m = self.marker;
        ExecutionRecord {
            task_id: m.task_id,
            attempt: m.attempt,
            retry_of: m.attempt.checked_sub(1).filter(|prev| *prev > 0),
            pid: Some(m.pid),
            started_at: m.started_at,
            finished_at: Utc::now(),
            outcome,
            log_path: Some(m.log_path),
            peak_usage: self.peak,
            adopted,
        }
    }
}

/// Outcome of reconciling markers left by a previous supervisor.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub adopted: Vec<ProcessHandle>,
    /// One failed attempt per process that died or was terminated.
    pub lost: Vec<ExecutionRecord>,
}

#[derive(Serialize)]
struct TaskContextFile<'a> {
    task: &'a TaskSpec,
    attempt: u32,
    workspace: &'a Path,
    branch: &'a str,
    base_commit: &'a str,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    sys: Arc<Mutex<System>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            sys: Arc::new(Mutex::new(System::new())),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn log_path(&self, workspace: &Workspace) -> PathBuf {
        self.config.logs_dir().join(format!("{}.log", workspace.name))
    }

    fn marker_path(&self, workspace_name: &str) -> PathBuf {
        self.config.markers_dir().join(format!("{}.json", workspace_name))
    }

    /// Start the worker for one attempt.
    ///
    /// # Errors
    /// `ProcessError::EmptyCommand` or `ProcessError::Spawn` if the process
    /// cannot be started; I/O errors preparing the log, context or marker.
    pub fn spawn(
        &self,
        task: &TaskSpec,
        workspace: &Workspace,
        attempt: u32,
    ) -> Result<ProcessHandle> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or(ProcessError::EmptyCommand)?;

        let resolved = resolve_program(program)?;

        std::fs::create_dir_all(self.config.logs_dir())?;
        std::fs::create_dir_all(self.config.markers_dir())?;
        std::fs::create_dir_all(self.config.context_dir())?;

        let log_path = self.log_path(workspace);
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        writeln!(
            log,
            "{} {} attempt {} at {} ===",
            ATTEMPT_HEADER,
            task.id,
            attempt,
            Utc::now().to_rfc3339()
        )?;

        let context_path = self
            .config
            .context_dir()
            .join(format!("{}.json", workspace.name));
        let context = TaskContextFile {
            task,
            attempt,
            workspace: &workspace.path,
            branch: &workspace.branch,
            base_commit: &workspace.base_commit,
        };
        std::fs::write(&context_path, serde_json::to_vec_pretty(&context)?)?;

        let stderr = log.try_clone()?;
        let mut command = Command::new(&resolved);
        command
            .args(args)
            .current_dir(&workspace.path)
            .env(ENV_TASK_ID, task.id.as_str())
            .env(ENV_TASK_CONTEXT, &context_path)
            .env(ENV_WORKSPACE, &workspace.path)
            .env(ENV_ATTEMPT, attempt.to_string())
            .env(ENV_DESCRIPTION_REF, &task.description_ref)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        // Each worker leads its own process group so termination reaches
        // everything it forks.
        #[cfg(unix)]
        command.process_group(0);
        let child = command.spawn().map_err(|e| ProcessError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or(ProcessError::Spawn {
            program: program.clone(),
            reason: "process exited before its pid was read".into(),
        })?;
        let start_time = self.start_time(pid).unwrap_or(0);
        wlog_debug!("Spawned task {} attempt {} as pid {}", task.id, attempt, pid);

        let marker = ProcessMarker {
            task_id: task.id.clone(),
            pid,
            start_time,
            attempt,
            started_at: Utc::now(),
            log_path,
            workspace_path: workspace.path.clone(),
            workspace_name: workspace.name.clone(),
            branch: workspace.branch.clone(),
            base_commit: workspace.base_commit.clone(),
            base_seq: workspace.base_seq,
        };
        let marker_path = self.marker_path(&workspace.name);
        write_marker(&marker_path, &marker)?;

        Ok(ProcessHandle {
            marker,
            marker_path,
            child: Some(child),
            peak: None,
        })
    }

    fn with_process<T>(&self, pid: u32, f: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
        let mut sys = self.sys.lock().ok()?;
        let pid = Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid).map(f)
    }

    fn start_time(&self, pid: u32) -> Option<u64> {
        self.with_process(pid, |p| p.start_time())
    }

    fn sample(&self, pid: u32) -> Option<ResourceUsage> {
        self.with_process(pid, |p| ResourceUsage {
            cpu_percent: p.cpu_usage(),
            memory_bytes: p.memory(),
        })
    }

    /// Whether `pid` is still the process described by `start_time`.
    fn is_alive(&self, pid: u32, start_time: u64) -> bool {
        self.with_process(pid, |p| {
            p.status() != OsProcessStatus::Zombie
                && (start_time == 0 || p.start_time() == start_time)
        })
        .unwrap_or(false)
    }

    /// Signal the worker's process group, or the lone pid when it does
    /// not lead a group.
    fn signal(&self, pid: u32, signal: Signal) -> bool {
        #[cfg(unix)]
        {
            let sig = match signal {
                Signal::Kill => libc::SIGKILL,
                _ => libc::SIGTERM,
            };
            if signal_group(pid, sig) {
                return true;
            }
        }
        self.with_process(pid, |p| p.kill_with(signal).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Check a process once without blocking.
    pub fn poll(&self, handle: &mut ProcessHandle) -> Result<ProcessStatus> {
        match handle.child.as_mut() {
            Some(child) => {
                if let Some(status) = child.try_wait()? {
                    return Ok(ProcessStatus::Exited(outcome_from_status(status)));
                }
            }
            None => {
                if !self.is_alive(handle.marker.pid, handle.marker.start_time) {
                    return Ok(ProcessStatus::Exited(ExecutionOutcome::ExitedUnobserved));
                }
            }
        }
        let usage = self.sample(handle.marker.pid).unwrap_or_default();
        handle.peak = Some(handle.peak.map_or(usage, |p| p.peak(usage)));
        Ok(ProcessStatus::Running(usage))
    }

    /// SIGTERM the worker's group, wait out the grace period, then SIGKILL.
    pub async fn terminate(&self, handle: &mut ProcessHandle) -> Result<()> {
        let pid = handle.marker.pid;
        let start_time = handle.marker.start_time;
        if handle.child.is_none() && !self.is_alive(pid, start_time) {
            return Ok(());
        }
        wlog_debug!("Terminating pid {} (task {})", pid, handle.marker.task_id);
        self.signal(pid, Signal::Term);

        match handle.child.as_mut() {
            Some(child) => {
                let exited = tokio::time::timeout(self.config.grace, child.wait())
                    .await
                    .is_ok();
                if exited {
                    // Anything the worker forked goes with its group.
                    #[cfg(unix)]
                    signal_group(pid, libc::SIGKILL);
                } else {
                    wlog_warn!("pid {} ignored SIGTERM; killing", pid);
                    self.signal(pid, Signal::Kill);
                    child.kill().await?;
                }
            }
            None => {
                let deadline = Instant::now() + self.config.grace;
                while self.is_alive(pid, start_time) && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                if self.is_alive(pid, start_time) {
                    wlog_warn!("pid {} ignored SIGTERM; killing", pid);
                    self.signal(pid, Signal::Kill);
                }
            }
        }
        Ok(())
    }

    /// Watch a process until it exits, times out or is cancelled, and
    /// produce its execution record. The marker is removed afterwards.
    pub async fn monitor(
        &self,
        mut handle: ProcessHandle,
        cancel: CancellationToken,
    ) -> ExecutionRecord {
        let elapsed = (Utc::now() - handle.marker.started_at)
            .to_std()
            .unwrap_or_default();
        let deadline = Instant::now() + self.config.timeout.saturating_sub(elapsed);
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if let Err(e) = self.terminate(&mut handle).await {
                        wlog_warn!("Terminate after cancel failed for pid {}: {}", handle.pid(), e);
                    }
                    break ExecutionOutcome::Cancelled;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    wlog_warn!(
                        "Task {} timed out after {:?}",
                        handle.task_id(),
                        self.config.timeout
                    );
                    if let Err(e) = self.terminate(&mut handle).await {
                        wlog_warn!(
                            "Terminate after timeout failed for pid {}: {}",
                            handle.pid(),
                            e
                        );
                    }
                    break ExecutionOutcome::TimedOut {
                        after_ms: self.config.timeout.as_millis() as u64,
                    };
                }
                _ = interval.tick() => {
                    match self.poll(&mut handle) {
                        Ok(ProcessStatus::Exited(outcome)) => break outcome,
                        Ok(ProcessStatus::Running(_)) => {}
                        Err(e) => {
                            wlog_warn!("Polling pid {} failed: {}", handle.pid(), e);
                            let _ = self.terminate(&mut handle).await;
                            break ExecutionOutcome::Lost { reason: e.to_string() };
                        }
                    }
                }
            }
        };

        wlog_debug!("Task {} attempt {} ended: {:?}", handle.task_id(), handle.attempt(), outcome);
        remove_file_quietly(&handle.marker_path);
        handle.into_record(outcome)
    }

    /// Markers left by previous runs. Unreadable markers are deleted.
    pub fn load_markers(&self) -> Vec<ProcessMarker> {
        let Ok(entries) = std::fs::read_dir(self.config.markers_dir()) else {
            return Vec::new();
        };
        let mut markers = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path)
                .map_err(crate::Error::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<ProcessMarker>(&bytes)?))
            {
                Ok(marker) => markers.push(marker),
                Err(e) => {
                    wlog_warn!("Discarding unreadable marker {}: {}", path.display(), e);
                    remove_file_quietly(&path);
                }
            }
        }
        markers.sort_by_key(|m| m.started_at);
        markers
    }

    /// Resolve every marker: adopt live processes that `eligible` accepts
    /// (up to `capacity`), terminate the other live ones, and record a
    /// lost attempt for every process that is not adopted.
    pub async fn reconcile<F>(&self, eligible: F, capacity: usize) -> Reconciliation
    where
        F: Fn(&ProcessMarker) -> bool,
    {
        let mut result = Reconciliation::default();
        for marker in self.load_markers() {
            let marker_path = self.marker_path(&marker.workspace_name);
            let alive = self.is_alive(marker.pid, marker.start_time);

            if alive && result.adopted.len() < capacity && eligible(&marker) {
                wlog_debug!("Adopting pid {} for task {}", marker.pid, marker.task_id);
                result.adopted.push(ProcessHandle {
                    marker,
                    marker_path,
                    child: None,
                    peak: None,
                });
                continue;
            }

            let reason = if alive {
                let mut handle = ProcessHandle {
                    marker: marker.clone(),
                    marker_path: marker_path.clone(),
                    child: None,
                    peak: None,
                };
                if let Err(e) = self.terminate(&mut handle).await {
                    wlog_warn!("Could not terminate orphan pid {}: {}", marker.pid, e);
                }
                "terminated during recovery".to_string()
            } else {
                "process ended while unsupervised".to_string()
            };
            wlog_warn!("Task {} attempt {}: {}", marker.task_id, marker.attempt, reason);
            remove_file_quietly(&marker_path);

            result.lost.push(ExecutionRecord {
                task_id: marker.task_id,
                attempt: marker.attempt,
                retry_of: marker.attempt.checked_sub(1).filter(|prev| *prev > 0),
                pid: Some(marker.pid),
                started_at: marker.started_at,
                finished_at: Utc::now(),
                outcome: ExecutionOutcome::Lost { reason },
                log_path: Some(marker.log_path),
                peak_usage: None,
                adopted: false,
            });
        }
        result
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: killpg only sends a signal; an unknown group yields ESRCH.
    unsafe { libc::killpg(pgid, sig) == 0 }
}

/// Bare program names are looked up on PATH so a missing worker is
/// reported before anything is written.
fn resolve_program(program: &str) -> Result<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return Ok(PathBuf::from(program));
    }
    which::which(program).map_err(|e| {
        ProcessError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn write_marker(path: &Path, marker: &ProcessMarker) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(marker)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_file_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            wlog_warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}

fn outcome_from_status(status: std::process::ExitStatus) -> ExecutionOutcome {
    if status.success() {
        return ExecutionOutcome::Succeeded;
    }
    if let Some(code) = status.code() {
        return ExecutionOutcome::Exited { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return ExecutionOutcome::Crashed {
                reason: format!("killed by signal {}", sig),
            };
        }
    }
    ExecutionOutcome::Crashed {
        reason: status.to_string(),
    }
}
