//! Workspace provisioning for tasks.
//!
//! The orchestrator talks to version control through [`WorkspaceService`];
//! [`git::GitWorkspace`] is the git2-backed default.

pub mod git;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::task::{Task, TaskId};
use crate::error::Result;

pub use git::GitWorkspace;

/// An isolated working directory prepared for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceHandle {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch: Option<String>,
}

/// Version-control operations the orchestrator needs.
///
/// Synchronous by design: every operation is a short local VCS call, and the
/// orchestrator invokes them from its own tick, never from a hot loop.
pub trait WorkspaceService: Send + Sync {
    /// Verify the backing repository can host task workspaces.
    ///
    /// Fails with `Error::WorkspaceNotReady` when the repository is missing
    /// or has no commits; the message says how to fix it.
    fn readiness_check(&self) -> Result<()>;

    /// Create (or reuse) an isolated workspace for a task.
    fn prepare(&self, task: &Task) -> Result<WorkspaceHandle>;

    /// Stash uncommitted work in a task workspace.
    ///
    /// Returns a reference to the stashed work, or `None` when the
    /// workspace was clean.
    fn stash(&self, handle: &WorkspaceHandle) -> Result<Option<String>>;

    /// Restore previously stashed work into the workspace.
    fn unstash(&self, handle: &WorkspaceHandle, stash_ref: &str) -> Result<()>;

    /// Current HEAD commit id of the task workspace.
    fn head_commit(&self, handle: &WorkspaceHandle) -> Result<String>;

    /// Remove the workspace and its bookkeeping.
    fn cleanup(&self, handle: &WorkspaceHandle) -> Result<()>;
}
