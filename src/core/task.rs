//! Task data model and lifecycle state machine.
//!
//! Tasks are the atomic units of work driven through the
//! implement-verify-review pipeline. All status changes go through
//! [`Task::apply`], which enforces the transition table and produces an
//! immutable [`StateChange`] record for the session history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a task within a feature.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output. Ordered so graphs keyed by id serialize
/// deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
///
/// Payload-free so statuses can key the scheduler's pool index; failure
/// detail lives on [`Task::last_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on unfinished dependencies.
    Blocked,
    /// All dependencies done; eligible for assignment.
    Ready,
    /// An agent is iterating on the implementation.
    Developing,
    /// Implementation passed its checks; awaiting review.
    Verifying,
    /// Reviewed and accepted.
    Done,
    /// Gave up on this task for the session.
    Failed,
}

impl TaskStatus {
    /// Every status, in pipeline order.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Blocked,
        TaskStatus::Ready,
        TaskStatus::Developing,
        TaskStatus::Verifying,
        TaskStatus::Done,
        TaskStatus::Failed,
    ];

    /// Terminal statuses never leave their pool within a session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Blocked => "blocked",
            TaskStatus::Ready => "ready",
            TaskStatus::Developing => "developing",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Events that drive tasks through the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    DependenciesSatisfied,
    AgentAssigned,
    IterationsPassed,
    ReviewPassed,
    ReviewFailed,
    TaskFailed,
    Pause,
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskEvent::DependenciesSatisfied => "dependencies_satisfied",
            TaskEvent::AgentAssigned => "agent_assigned",
            TaskEvent::IterationsPassed => "iterations_passed",
            TaskEvent::ReviewPassed => "review_passed",
            TaskEvent::ReviewFailed => "review_failed",
            TaskEvent::TaskFailed => "task_failed",
            TaskEvent::Pause => "pause",
        };
        write!(f, "{}", s)
    }
}

/// Immutable record of one applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub event: TaskEvent,
    pub at: DateTime<Utc>,
}

/// A single task in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable title.
    pub title: String,
    /// Detailed description of what the task should accomplish.
    pub description: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Reviewer feedback from the most recent failed review.
    pub review_feedback: Option<String>,
    /// Commit id of the accepted work.
    pub commit_marker: Option<String>,
    /// Suspended by the user; excluded from assignment until resumed.
    pub paused: bool,
    /// Reference to stashed uncommitted work from a suspension.
    pub stash_ref: Option<String>,
    /// Locked tasks are never mutated automatically.
    pub locked: bool,
    /// Why the task most recently failed.
    pub last_error: Option<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task last changed.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task. Tasks start blocked; the dependency cascade
    /// promotes those with no unmet dependencies to ready.
    pub fn new(title: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Blocked,
            review_feedback: None,
            commit_marker: None,
            paused: false,
            stash_ref: None,
            locked: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a lifecycle event, enforcing the transition table.
    ///
    /// On success the status changes and a [`StateChange`] is returned.
    /// On an illegal (status, event) pair the task is left untouched and
    /// `Error::InvalidTransition` is returned.
    pub fn apply(&mut self, event: TaskEvent) -> Result<StateChange> {
        use TaskEvent::*;
        use TaskStatus::*;

        let from = self.status;
        let to = match (event, from) {
            (DependenciesSatisfied, Blocked) => Ready,
            (AgentAssigned, Ready) => Developing,
            (IterationsPassed, Developing) => Verifying,
            (ReviewPassed, Verifying) => Done,
            (ReviewFailed, Verifying) => Developing,
            (TaskFailed, Developing) | (TaskFailed, Verifying) => Failed,
            (Pause, Developing) | (Pause, Verifying) => Ready,
            _ => {
                return Err(Error::InvalidTransition {
                    task: self.id,
                    from,
                    event,
                })
            }
        };

        self.status = to;
        self.updated_at = Utc::now();
        if event == Pause {
            self.paused = true;
        }

        Ok(StateChange {
            task_id: self.id,
            from,
            to,
            event,
            at: self.updated_at,
        })
    }

    /// Check whether an event is legal for the current status without
    /// applying it.
    pub fn accepts(&self, event: TaskEvent) -> bool {
        use TaskEvent::*;
        use TaskStatus::*;
        matches!(
            (event, self.status),
            (DependenciesSatisfied, Blocked)
                | (AgentAssigned, Ready)
                | (IterationsPassed, Developing)
                | (ReviewPassed, Verifying)
                | (ReviewFailed, Verifying)
                | (TaskFailed, Developing)
                | (TaskFailed, Verifying)
                | (Pause, Developing)
                | (Pause, Verifying)
        )
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
