//! Thin synchronous layer over git2. Callers on the async side go through
//! [`crate::util::blocking`].

use std::path::{Path, PathBuf};

use git2::{
    BranchType, DiffOptions, ErrorCode, IndexAddOption, Oid, Repository, ResetType, Signature,
    StatusOptions,
};

use crate::{wlog_debug, wlog_warn, Result};

/// What happened when a commit was folded into a target branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrateResult {
    /// The target already contains the commit.
    UpToDate,
    FastForward(String),
    Merged(String),
    /// Paths git could not merge cleanly; the target is unchanged.
    Conflict(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        wlog_debug!("GitOps::new path={}", repo_path.display());
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path: root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Tip of a local branch, or `None` if it does not exist.
    pub fn branch_tip(&self, branch: &str) -> Result<Option<String>> {
        let repo = self.repo()?;
        let tip = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => Some(b.get().peel_to_commit()?.id().to_string()),
            Err(e) if e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(tip)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.branch_tip(branch)?.is_some())
    }

    /// Create `branch` at HEAD unless it already exists. Returns its tip.
    pub fn ensure_branch(&self, branch: &str) -> Result<String> {
        if let Some(tip) = self.branch_tip(branch)? {
            return Ok(tip);
        }
        let repo = self.repo()?;
        let head = repo.head()?.peel_to_commit()?;
        repo.branch(branch, &head, false)?;
        wlog_debug!("Created branch {} at {}", branch, head.id());
        Ok(head.id().to_string())
    }

    /// Create `branch` at `base` and check it out into a new worktree.
    ///
    /// The branch is created with `force = false`, so an existing branch
    /// fails with `ErrorCode::Exists` instead of being moved. If the
    /// worktree cannot be added, the new branch is deleted again.
    pub fn create_worktree(&self, branch: &str, worktree_path: &Path, base: &str) -> Result<()> {
        wlog_debug!(
            "GitOps::create_worktree branch={} path={} base={}",
            branch,
            worktree_path.display(),
            base
        );
        let repo = self.repo()?;
        let commit = repo.find_commit(Oid::from_str(base)?)?;
        let branch_obj = repo.branch(branch, &commit, false)?;
        let branch_ref = branch_obj.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Err(e) = repo.worktree(worktree_name, worktree_path, Some(&opts)) {
            wlog_warn!("Worktree add failed for {}: {}; rolling back", branch, e);
            drop(branch_ref);
            self.cleanup_worktree_admin_dir(worktree_name);
            self.delete_branch(branch)?;
            return Err(e.into());
        }
        wlog_debug!("Worktree created: {}", worktree_name);
        Ok(())
    }

    /// Remove a worktree and everything git keeps about it.
    ///
    /// The admin directory under `.git/worktrees` must go too, otherwise
    /// git still considers the branch checked out and refuses to delete it.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        wlog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);

        let known: Vec<String> = repo.worktrees()?.iter().flatten().map(String::from).collect();
        let worktree_name = known
            .iter()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
            })
            .or_else(|| known.iter().find(|name| Some(name.as_str()) == folder_name.as_deref()))
            .cloned();

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    wlog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }
        for name in worktree_name.iter().chain(folder_name.iter()) {
            self.cleanup_worktree_admin_dir(name);
        }
        Ok(())
    }

    fn cleanup_worktree_admin_dir(&self, worktree_name: &str) {
        if let Ok(repo) = self.repo() {
            let admin_dir = repo.path().join("worktrees").join(worktree_name);
            if admin_dir.exists() {
                wlog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
    }

    /// Drop admin entries for worktrees whose directories are gone.
    pub fn prune_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if !wt.path().exists()
                    && wt
                        .prune(Some(git2::WorktreePruneOptions::new().valid(true).locked(true)))
                        .is_ok()
                {
                    pruned += 1;
                }
            }
        }
        wlog_debug!("prune_worktrees: pruned {}", pruned);
        Ok(pruned)
    }

    /// Delete a local branch. Missing branches are not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut b) => {
                if let Err(e) = b.delete() {
                    wlog_warn!("Failed to delete branch '{}': {}", branch, e);
                    let name = format!("refs/heads/{}", branch);
                    if let Ok(mut reference) = repo.find_reference(&name) {
                        reference.delete()?;
                    }
                }
                wlog_debug!("Branch deleted: {}", branch);
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("weft", "weft@localhost"))?)
    }

    /// Stage everything (including deletions) and commit it.
    ///
    /// Returns the new HEAD, or `None` when there was nothing to commit.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<Option<String>> {
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = repo.head()?.peel_to_commit()?;
        if parent.tree_id() == tree_id {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        wlog_debug!("Commit created in {}: {}", worktree_path.display(), commit_id);
        Ok(Some(commit_id.to_string()))
    }

    pub fn worktree_head(worktree_path: &Path) -> Result<String> {
        let repo = Repository::open(worktree_path)?;
        let head = repo.head()?.peel_to_commit()?.id();
        Ok(head.to_string())
    }

    /// Reset a worktree (and its branch) to `commit` and delete untracked files.
    pub fn reset_hard_to(worktree_path: &Path, commit: &str) -> Result<()> {
        let repo = Repository::open(worktree_path)?;
        let target = repo.find_commit(Oid::from_str(commit)?)?;
        repo.reset(target.as_object(), ResetType::Hard, None)?;

        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(false)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        for entry in statuses.iter() {
            if entry.status().is_wt_new() {
                if let Some(path) = entry.path() {
                    let full = worktree_path.join(path);
                    if full.is_dir() {
                        std::fs::remove_dir_all(&full)?;
                    } else if full.exists() {
                        std::fs::remove_file(&full)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Paths changed between two commits.
    pub fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let old_tree = repo.find_commit(Oid::from_str(from)?)?.tree()?;
        let new_tree = repo.find_commit(Oid::from_str(to)?)?.tree()?;
        let mut opts = DiffOptions::new();
        let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut opts))?;

        let mut files = Vec::new();
        for delta in diff.deltas() {
            for file in [delta.old_file(), delta.new_file()] {
                if let Some(path) = file.path().and_then(|p| p.to_str()) {
                    if !files.iter().any(|f: &String| f == path) {
                        files.push(path.to_string());
                    }
                }
            }
        }
        Ok(files)
    }

    /// Fold `source` into local branch `target` without touching any
    /// working tree: fast-forward when possible, otherwise an in-memory
    /// merge commit.
    pub fn integrate(&self, target: &str, source: &str, message: &str) -> Result<IntegrateResult> {
        let repo = self.repo()?;
        let refname = format!("refs/heads/{}", target);
        let mut target_ref = repo.find_reference(&refname)?;
        let target_commit = target_ref.peel_to_commit()?;
        let source_oid = Oid::from_str(source)?;
        let source_commit = repo.find_commit(source_oid)?;

        if target_commit.id() == source_oid
            || repo.graph_descendant_of(target_commit.id(), source_oid)?
        {
            return Ok(IntegrateResult::UpToDate);
        }

        if repo.graph_descendant_of(source_oid, target_commit.id())? {
            target_ref.set_target(source_oid, message)?;
            wlog_debug!("Fast-forwarded {} to {}", target, source_oid);
            return Ok(IntegrateResult::FastForward(source_oid.to_string()));
        }

        let mut index = repo.merge_commits(&target_commit, &source_commit, None)?;
        if index.has_conflicts() {
            let mut paths = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
                if let Some(entry) = entry {
                    let path = String::from_utf8_lossy(&entry.path).into_owned();
                    if !paths.contains(&path) {
                        paths.push(path);
                    }
                }
            }
            wlog_warn!("Merge into {} conflicts on {}", target, paths.join(", "));
            return Ok(IntegrateResult::Conflict(paths));
        }

        let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
        let sig = Self::signature(&repo)?;
        let merge_oid = repo.commit(
            Some(refname.as_str()),
            &sig,
            &sig,
            message,
            &tree,
            &[&target_commit, &source_commit],
        )?;
        wlog_debug!("Merged {} into {} as {}", source_oid, target, merge_oid);
        Ok(IntegrateResult::Merged(merge_oid.to_string()))
    }
}
