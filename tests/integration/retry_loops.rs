//! Bounded retry behavior: failing checks, failing reviews, and the
//! failure cascade.

use std::sync::Arc;

use conductor::core::feature::{Feature, FeatureStatus};
use conductor::core::graph::Graph;
use conductor::core::task::{Task, TaskStatus};
use conductor::orchestration::{LoopConfig, OrchestratorConfig};
use conductor::state::MemoryStore;

use crate::fixtures::{
    build_orchestrator, chain_graph, drive, ScriptedEditor, ScriptedReviewer, ScriptedVerifier,
    StubWorkspace,
};

fn single_task_graph() -> (Graph, conductor::core::task::TaskId) {
    let mut graph = Graph::new();
    let id = graph.add_task(Task::new("solo", "one task"));
    (graph, id)
}

fn tight_config(max_iterations: u32) -> OrchestratorConfig {
    OrchestratorConfig {
        loop_config: LoopConfig {
            max_iterations,
            ..LoopConfig::default()
        },
        ..OrchestratorConfig::default()
    }
}

#[tokio::test]
async fn checks_failing_twice_then_passing_completes() {
    let (graph, id) = single_task_graph();
    let mut orch = build_orchestrator(
        Feature::new("retry", "Retry", "third time lucky"),
        ScriptedEditor::succeeding(),
        ScriptedReviewer::approving(),
        ScriptedVerifier::with_script(vec![false, false, true]),
        StubWorkspace::new(),
        Arc::new(MemoryStore::new()),
        tight_config(3),
    );
    orch.initialize(graph).unwrap();
    orch.start().unwrap();

    assert!(drive(&mut orch).await);
    assert_eq!(orch.graph().task(&id).unwrap().status, TaskStatus::Done);
}

#[tokio::test]
async fn iteration_budget_exhaustion_fails_the_task() {
    let (graph, id) = single_task_graph();
    let mut orch = build_orchestrator(
        Feature::new("exhaust", "Exhaust", "never passes"),
        ScriptedEditor::succeeding(),
        ScriptedReviewer::approving(),
        ScriptedVerifier::with_script(vec![false, false, false]),
        StubWorkspace::new(),
        Arc::new(MemoryStore::new()),
        tight_config(3),
    );
    orch.initialize(graph).unwrap();
    orch.start().unwrap();

    assert!(!drive(&mut orch).await);
    let task = orch.graph().task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task
        .last_error
        .as_ref()
        .unwrap()
        .contains("iteration budget"));
    assert_eq!(orch.feature_status(), FeatureStatus::AttentionNeeded);
}

#[tokio::test]
async fn review_rejection_loops_back_and_carries_feedback() {
    let (graph, id) = single_task_graph();
    let mut orch = build_orchestrator(
        Feature::new("rework", "Rework", "one revision requested"),
        ScriptedEditor::succeeding(),
        ScriptedReviewer::revising_first(1, "rename the helper"),
        ScriptedVerifier::passing(),
        StubWorkspace::new(),
        Arc::new(MemoryStore::new()),
        OrchestratorConfig::default(),
    );
    orch.initialize(graph).unwrap();
    orch.start().unwrap();

    assert!(drive(&mut orch).await);
    let task = orch.graph().task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    // feedback was attached during rework and cleared on acceptance
    assert!(task.review_feedback.is_none());

    // the task went verifying -> developing -> verifying -> done
    let statuses: Vec<TaskStatus> = orch
        .history()
        .iter()
        .filter(|c| c.task_id == id)
        .map(|c| c.to)
        .collect();
    let rework = statuses
        .windows(2)
        .any(|w| w == [TaskStatus::Verifying, TaskStatus::Developing]);
    assert!(rework, "expected a review-rejection transition: {statuses:?}");
}

#[tokio::test]
async fn failed_task_leaves_dependents_blocked() {
    let (graph, ids) = chain_graph(3);
    let mut orch = build_orchestrator(
        Feature::new("cascade-stop", "CascadeStop", "first task fails"),
        ScriptedEditor::succeeding(),
        ScriptedReviewer::approving(),
        ScriptedVerifier::with_script(vec![false, false]),
        StubWorkspace::new(),
        Arc::new(MemoryStore::new()),
        tight_config(2),
    );
    orch.initialize(graph).unwrap();
    orch.start().unwrap();

    assert!(!drive(&mut orch).await);
    assert_eq!(orch.graph().task(&ids[0]).unwrap().status, TaskStatus::Failed);
    assert_eq!(orch.graph().task(&ids[1]).unwrap().status, TaskStatus::Blocked);
    assert_eq!(orch.graph().task(&ids[2]).unwrap().status, TaskStatus::Blocked);
    assert_eq!(orch.feature_status(), FeatureStatus::AttentionNeeded);
}

#[tokio::test]
async fn transient_edit_failures_are_retried_within_the_loop() {
    let (graph, id) = single_task_graph();
    let mut orch = build_orchestrator(
        Feature::new("flaky", "Flaky", "agent hiccups once"),
        ScriptedEditor::failing_first(1),
        ScriptedReviewer::approving(),
        // first iteration's checks fail (the edit did nothing), second passes
        ScriptedVerifier::with_script(vec![false, true]),
        StubWorkspace::new(),
        Arc::new(MemoryStore::new()),
        OrchestratorConfig::default(),
    );
    orch.initialize(graph).unwrap();
    orch.start().unwrap();

    assert!(drive(&mut orch).await);
    assert_eq!(orch.graph().task(&id).unwrap().status, TaskStatus::Done);
}
