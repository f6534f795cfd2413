use thiserror::Error;

use crate::core::task::{TaskEvent, TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task {task}: {from} does not accept {event}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        event: TaskEvent,
    },

    #[error("Dependency cycle involving {} task(s)", tasks.len())]
    CycleDetected { tasks: Vec<TaskId> },

    #[error("Task {task} is not in the {pool} pool")]
    PoolInconsistency { task: TaskId, pool: TaskStatus },

    #[error("Workspace not ready: {0}")]
    WorkspaceNotReady(String),

    #[error("Agent binary not found on PATH")]
    AgentBinaryNotFound,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invocation queue closed")]
    InvocationQueueClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
