//! Core data model: tasks, the dependency graph, and feature aggregates.

pub mod feature;
pub mod graph;
pub mod task;

pub use feature::{feature_status, Feature, FeatureId, FeatureStatus};
pub use graph::{Connection, Graph, TopoOrder};
pub use task::{StateChange, Task, TaskEvent, TaskId, TaskStatus};
