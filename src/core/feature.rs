//! Feature metadata and the aggregate status derived from its task graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::graph::Graph;
use crate::core::task::TaskStatus;

/// Identifier for a feature (one orchestrated unit of work).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(pub String);

impl FeatureId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FeatureId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Aggregate status of a feature, derived from its task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Planning,
    InProgress,
    AttentionNeeded,
    ReadyToIntegrate,
}

impl std::fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FeatureStatus::Planning => "planning",
            FeatureStatus::InProgress => "in_progress",
            FeatureStatus::AttentionNeeded => "attention_needed",
            FeatureStatus::ReadyToIntegrate => "ready_to_integrate",
        };
        write!(f, "{}", s)
    }
}

/// A feature being driven to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub name: String,
    /// The goal handed to edit and review collaborators as context.
    pub specification: String,
    pub status: FeatureStatus,
    pub created_at: DateTime<Utc>,
}

impl Feature {
    pub fn new(id: impl Into<FeatureId>, name: &str, specification: &str) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            specification: specification.to_string(),
            status: FeatureStatus::Planning,
            created_at: Utc::now(),
        }
    }
}

/// Compute the aggregate status of a graph. Total: defined for every graph,
/// including the empty one.
///
/// Precedence: any failed task needs attention; otherwise all done means
/// ready to integrate; otherwise any in-flight task means in progress;
/// otherwise still planning. An empty graph is planning.
pub fn feature_status(graph: &Graph) -> FeatureStatus {
    if graph.is_empty() {
        return FeatureStatus::Planning;
    }
    let mut any_failed = false;
    let mut any_active = false;
    let mut all_done = true;
    for task in graph.tasks() {
        match task.status {
            TaskStatus::Failed => any_failed = true,
            TaskStatus::Developing | TaskStatus::Verifying => any_active = true,
            _ => {}
        }
        if task.status != TaskStatus::Done {
            all_done = false;
        }
    }
    if any_failed {
        FeatureStatus::AttentionNeeded
    } else if all_done {
        FeatureStatus::ReadyToIntegrate
    } else if any_active {
        FeatureStatus::InProgress
    } else {
        FeatureStatus::Planning
    }
}
