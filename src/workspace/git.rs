//! git2-backed workspace provisioning.
//!
//! Each task gets its own branch (`conductor/task/<short-id>`) checked out
//! in its own worktree under the configured worktrees directory. Suspended
//! work is carried as a stash commit id on the task.

use std::path::{Path, PathBuf};

use git2::{ErrorCode, Repository, Signature, StashFlags};

use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::workspace::{WorkspaceHandle, WorkspaceService};
use crate::{clog_debug, clog_warn};

pub struct GitWorkspace {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
}

impl GitWorkspace {
    pub fn new(repo_path: &Path, worktrees_dir: &Path) -> Result<Self> {
        clog_debug!(
            "GitWorkspace::new repo={} worktrees={}",
            repo_path.display(),
            worktrees_dir.display()
        );
        let _ = Repository::discover(repo_path).map_err(|_| {
            Error::WorkspaceNotReady(format!(
                "no git repository at {} (run `git init` first)",
                repo_path.display()
            ))
        })?;
        std::fs::create_dir_all(worktrees_dir)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            worktrees_dir: worktrees_dir.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn branch_name(task: &Task) -> String {
        format!("conductor/task/{}", task.id.short())
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("Conductor", "conductor@localhost"))?)
    }

    /// Remove git's worktree admin dir (.git/worktrees/<name>). Without
    /// this, git keeps treating the branch as checked out.
    fn cleanup_worktree_admin_dir(&self, worktree_name: &str) {
        if let Ok(repo) = self.repo() {
            let admin_dir = repo.path().join("worktrees").join(worktree_name);
            if admin_dir.exists() {
                clog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
    }
}

impl WorkspaceService for GitWorkspace {
    fn readiness_check(&self) -> Result<()> {
        let repo = Repository::discover(&self.repo_path).map_err(|_| {
            Error::WorkspaceNotReady(format!(
                "no git repository at {} (run `git init` first)",
                self.repo_path.display()
            ))
        })?;
        repo.head()
            .and_then(|head| head.peel_to_commit())
            .map_err(|_| {
                Error::WorkspaceNotReady(
                    "repository has no commits yet (create an initial commit first)".to_string(),
                )
            })?;
        Ok(())
    }

    fn prepare(&self, task: &Task) -> Result<WorkspaceHandle> {
        let branch = Self::branch_name(task);
        let worktree_path = self.worktrees_dir.join(task.id.short());
        let handle = WorkspaceHandle {
            task_id: task.id,
            path: worktree_path.clone(),
            branch: Some(branch.clone()),
        };

        // A resumed task reuses its existing worktree.
        if worktree_path.exists() {
            clog_debug!(
                "prepare: reusing worktree for {} at {}",
                task.id.short(),
                worktree_path.display()
            );
            return Ok(handle);
        }

        let repo = self.repo()?;
        let reference = match repo.find_branch(&branch, git2::BranchType::Local) {
            Ok(existing) => existing.into_reference(),
            Err(e) if e.code() == ErrorCode::NotFound => {
                let commit = repo.head()?.peel_to_commit()?;
                clog_debug!("Creating branch {} from commit {}", branch, commit.id());
                repo.branch(&branch, &commit, false)?.into_reference()
            }
            Err(e) => return Err(e.into()),
        };

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        // Worktree name is the folder name; the branch contains slashes.
        let worktree_name = task.id.short();
        repo.worktree(&worktree_name, &worktree_path, Some(&opts))?;
        clog_debug!(
            "prepare: created worktree {} on branch {}",
            worktree_path.display(),
            branch
        );
        Ok(handle)
    }

    fn stash(&self, handle: &WorkspaceHandle) -> Result<Option<String>> {
        let mut repo = Repository::open(&handle.path)?;
        let sig = Self::signature(&repo)?;
        let message = format!("conductor suspend {}", handle.task_id.short());
        match repo.stash_save(&sig, &message, Some(StashFlags::INCLUDE_UNTRACKED)) {
            Ok(oid) => {
                clog_debug!("stash: task {} -> {}", handle.task_id.short(), oid);
                Ok(Some(oid.to_string()))
            }
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn unstash(&self, handle: &WorkspaceHandle, stash_ref: &str) -> Result<()> {
        let mut repo = Repository::open(&handle.path)?;
        let mut found: Option<usize> = None;
        repo.stash_foreach(|index, _message, oid| {
            if oid.to_string() == stash_ref {
                found = Some(index);
                false
            } else {
                true
            }
        })?;
        match found {
            Some(index) => {
                repo.stash_pop(index, None)?;
                clog_debug!("unstash: task {} <- {}", handle.task_id.short(), stash_ref);
                Ok(())
            }
            None => Err(Error::Validation(format!(
                "stash {} not found for task {}",
                stash_ref,
                handle.task_id.short()
            ))),
        }
    }

    fn head_commit(&self, handle: &WorkspaceHandle) -> Result<String> {
        let repo = Repository::open(&handle.path)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    fn cleanup(&self, handle: &WorkspaceHandle) -> Result<()> {
        let worktree_name = handle.task_id.short();
        let repo = self.repo()?;
        if let Ok(worktree) = repo.find_worktree(&worktree_name) {
            let _ = worktree.unlock();
            if let Err(e) = worktree.prune(Some(
                git2::WorktreePruneOptions::new()
                    .valid(true)
                    .working_tree(true)
                    .locked(true),
            )) {
                clog_warn!("Worktree prune failed for '{}': {}", worktree_name, e);
            }
        }
        if handle.path.exists() {
            std::fs::remove_dir_all(&handle.path)?;
        }
        drop(repo);
        self.cleanup_worktree_admin_dir(&worktree_name);
        clog_debug!("cleanup: removed workspace for {}", handle.task_id.short());
        Ok(())
    }
}
