//! Collaborator contracts: the edit and review agents the orchestrator
//! drives.
//!
//! Both traits are object-safe and return boxed futures so the orchestrator
//! can hold `Arc<dyn ...>` implementations, and tests can substitute mocks.

pub mod claude;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::core::task::Task;
use crate::error::Result;
use crate::workspace::WorkspaceHandle;

pub use claude::HeadlessAgent;

/// One edit invocation: implement (or fix) a task inside its workspace.
#[derive(Debug, Clone)]
pub struct EditRequest {
    pub task: Task,
    /// The feature goal, handed through for context.
    pub feature_goal: String,
    pub workspace: WorkspaceHandle,
    /// 1-based iteration number within the current loop.
    pub iteration: u32,
    /// Feedback from a failed review, when re-working.
    pub review_feedback: Option<String>,
    /// Summary of the previous iteration's failing checks, if any.
    pub check_feedback: Option<String>,
}

/// What came back from an edit invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOutcome {
    pub success: bool,
    pub summary: String,
    /// Rough context consumed by the invocation, counted against the
    /// loop's budget.
    pub tokens_used: u64,
    pub error: Option<String>,
}

/// Applies changes to a task workspace.
pub trait EditCollaborator: Send + Sync {
    fn edit(&self, request: EditRequest) -> BoxFuture<'static, Result<EditOutcome>>;
}

/// One review invocation over a task's finished work.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub task: Task,
    pub workspace: WorkspaceHandle,
    pub feature_goal: String,
}

/// A review verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub passed: bool,
    pub feedback: String,
    /// Commit id identifying the reviewed work, when the reviewer knows it.
    pub commit: Option<String>,
}

/// Judges whether a task's work meets its description.
pub trait ReviewCollaborator: Send + Sync {
    fn review(&self, request: ReviewRequest) -> BoxFuture<'static, Result<ReviewOutcome>>;
}
