//! One isolated git worktree per task.
//!
//! Names are derived from task ids, so a task always maps to the same
//! directory and branch. Uniqueness is enforced twice: an in-process
//! registry reservation, then git's own refusal to create a branch that
//! already exists.
//!
//! libgit2 does not tolerate concurrent worktree creation and removal in
//! one repository, so those run one at a time under `Inner::admin`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use git2::ErrorCode;
use serde::Serialize;
use uuid::Uuid;

use crate::core::task::TaskId;
use crate::error::WorkspaceError;
use crate::git::GitOps;
use crate::util::blocking;
use crate::{wlog_debug, wlog_warn, Error, Result};

const BRANCH_PREFIX: &str = "weft";
const MAX_NAME_LEN: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    Provisioning,
    Active,
    /// Kept on disk for inspection (merge escalation or kept failures).
    PendingCleanup,
    Destroyed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub task_id: TaskId,
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    /// Commit the workspace was created from.
    pub base_commit: String,
    /// Integration sequence number at the time `base_commit` was taken.
    pub base_seq: u64,
    pub state: WorkspaceState,
}

/// Changes captured from a workspace after its worker exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub head: String,
    pub changed_files: Vec<String>,
}

#[derive(Clone)]
pub struct WorkspaceManager {
    inner: Arc<Inner>,
}

struct Inner {
    git: GitOps,
    root: PathBuf,
    /// Workspace name -> owning task.
    registry: Mutex<HashMap<String, TaskId>>,
    /// Held for every worktree add or remove.
    admin: Mutex<()>,
}

impl Inner {
    fn admin(&self) -> Result<MutexGuard<'_, ()>> {
        self.admin
            .lock()
            .map_err(|_| Error::Validation("worktree admin lock poisoned".into()))
    }
}

/// Deterministic workspace name for a task id.
///
/// Ids that are already safe map to `task-<id>`. Anything else is
/// sanitized and gets a suffix derived from the original id, so two ids
/// that sanitize to the same text still get different names.
pub fn workspace_name(id: &TaskId) -> String {
    let raw = id.as_str();
    let mut sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized = sanitized.trim_matches('-').to_string();

    let changed = sanitized != raw || sanitized.len() > MAX_NAME_LEN;
    sanitized.truncate(MAX_NAME_LEN);
    if !changed {
        return format!("task-{}", sanitized);
    }

    let suffix = Uuid::new_v5(&Uuid::NAMESPACE_OID, raw.as_bytes()).simple().to_string();
    if sanitized.is_empty() {
        format!("task-{}", &suffix[..12])
    } else {
        format!("task-{}-{}", sanitized, &suffix[..8])
    }
}

pub fn branch_name(workspace_name: &str) -> String {
    format!("{}/{}", BRANCH_PREFIX, workspace_name)
}

impl WorkspaceManager {
    pub fn new(git: GitOps, root: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                git,
                root,
                registry: Mutex::new(HashMap::new()),
                admin: Mutex::new(()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn git(&self) -> &GitOps {
        &self.inner.git
    }

    fn reserve(&self, name: &str, task: &TaskId) -> Result<()> {
        let mut registry = self
            .inner
            .registry
            .lock()
            .map_err(|_| Error::Validation("workspace registry poisoned".into()))?;
        if let Some(owner) = registry.get(name) {
            if owner != task {
                return Err(WorkspaceError::NameCollision(name.to_string()).into());
            }
            return Err(WorkspaceError::Provision {
                name: name.to_string(),
                reason: format!("task {} already has a workspace", task),
            }
            .into());
        }
        registry.insert(name.to_string(), task.clone());
        Ok(())
    }

    fn release(&self, name: &str) {
        if let Ok(mut registry) = self.inner.registry.lock() {
            registry.remove(name);
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.registry.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Create the workspace for `task` at `base_commit`.
    ///
    /// On any failure the reservation and any partially created git state
    /// are rolled back.
    pub async fn provision(
        &self,
        task: &TaskId,
        base_commit: &str,
        base_seq: u64,
    ) -> Result<Workspace> {
        let name = workspace_name(task);
        let branch = branch_name(&name);
        let path = self.inner.root.join(&name);
        self.reserve(&name, task)?;

        if path.exists() {
            self.release(&name);
            return Err(WorkspaceError::NameCollision(path.display().to_string()).into());
        }

        wlog_debug!("Provisioning workspace {} for task {}", name, task);
        let inner = Arc::clone(&self.inner);
        let (b, p, base) = (branch.clone(), path.clone(), base_commit.to_string());
        let created = blocking(move || {
            let _admin = inner.admin()?;
            inner.git.create_worktree(&b, &p, &base)
        })
        .await;

        if let Err(e) = created {
            self.release(&name);
            return Err(match e {
                Error::Git(ref g) if g.code() == ErrorCode::Exists => {
                    WorkspaceError::BranchConflict(branch).into()
                }
                other => WorkspaceError::Provision {
                    name,
                    reason: other.to_string(),
                }
                .into(),
            });
        }

        Ok(Workspace {
            task_id: task.clone(),
            name,
            path,
            branch,
            base_commit: base_commit.to_string(),
            base_seq,
            state: WorkspaceState::Active,
        })
    }

    /// Put a workspace back to its base revision for another attempt.
    pub async fn reset(&self, workspace: &Workspace) -> Result<()> {
        wlog_debug!("Resetting workspace {} to {}", workspace.name, workspace.base_commit);
        let (path, base) = (workspace.path.clone(), workspace.base_commit.clone());
        blocking(move || GitOps::reset_hard_to(&path, &base)).await
    }

    /// Commit whatever the worker left behind and list the files changed
    /// since the base. Calling it twice gives the same answer.
    pub async fn capture(&self, workspace: &Workspace) -> Result<Capture> {
        let git = self.inner.git.clone();
        let path = workspace.path.clone();
        let base = workspace.base_commit.clone();
        let message = format!("weft: {}", workspace.task_id);
        blocking(move || {
            git.commit_all(&path, &message)?;
            let head = GitOps::worktree_head(&path)?;
            let changed_files = git.changed_files(&base, &head)?;
            Ok(Capture {
                head,
                changed_files,
            })
        })
        .await
    }

    /// Remove the worktree and its branch.
    pub async fn destroy(&self, workspace: &mut Workspace) -> Result<()> {
        if workspace.state == WorkspaceState::Destroyed {
            return Ok(());
        }
        wlog_debug!("Destroying workspace {}", workspace.name);
        let inner = Arc::clone(&self.inner);
        let (path, branch) = (workspace.path.clone(), workspace.branch.clone());
        blocking(move || {
            let _admin = inner.admin()?;
            inner.git.remove_worktree(&path)?;
            inner.git.delete_branch(&branch)
        })
        .await?;
        self.release(&workspace.name);
        workspace.state = WorkspaceState::Destroyed;
        Ok(())
    }

    /// Keep a workspace on disk after its task reached a terminal state.
    pub fn retain(&self, workspace: &mut Workspace) {
        wlog_debug!("Keeping workspace {} at {}", workspace.name, workspace.path.display());
        workspace.state = WorkspaceState::PendingCleanup;
    }

    /// Remove worktrees and branches left behind by a previous run for
    /// the given tasks. Returns how many were removed.
    pub async fn prune_stale(&self, tasks: &[TaskId]) -> Result<usize> {
        let inner = Arc::clone(&self.inner);
        let names: Vec<String> = tasks.iter().map(workspace_name).collect();
        blocking(move || {
            let _admin = inner.admin()?;
            let (git, root) = (&inner.git, &inner.root);
            let mut removed = 0;
            for name in names {
                let path = root.join(&name);
                let branch = branch_name(&name);
                let branch_exists = git.branch_exists(&branch)?;
                if !path.exists() && !branch_exists {
                    continue;
                }
                wlog_warn!("Removing stale workspace {}", name);
                git.remove_worktree(&path)?;
                git.delete_branch(&branch)?;
                removed += 1;
            }
            git.prune_worktrees()?;
            Ok(removed)
        })
        .await
    }
}
