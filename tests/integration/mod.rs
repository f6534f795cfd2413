//! Integration tests driving the orchestrator end to end.

mod fixtures;

mod graph_execution;
mod persistence;
mod retry_loops;
mod workspace_e2e;
