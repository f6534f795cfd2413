//! Full-graph execution: chains, diamonds, and concurrency limits.

use std::time::Duration;

use conductor::core::feature::{Feature, FeatureStatus};
use conductor::core::task::TaskStatus;
use conductor::orchestration::OrchestratorConfig;
use conductor::state::MemoryStore;
use std::sync::Arc;

use crate::fixtures::{
    build_orchestrator, chain_graph, diamond_graph, drive, ScriptedEditor, ScriptedReviewer,
    ScriptedVerifier, StubWorkspace,
};

#[tokio::test]
async fn linear_chain_completes_in_dependency_order() {
    let (graph, ids) = chain_graph(3);
    let mut orch = build_orchestrator(
        Feature::new("chain", "Chain", "three chained steps"),
        ScriptedEditor::succeeding(),
        ScriptedReviewer::approving(),
        ScriptedVerifier::passing(),
        StubWorkspace::new(),
        Arc::new(MemoryStore::new()),
        OrchestratorConfig::default(),
    );
    orch.initialize(graph).unwrap();
    orch.start().unwrap();

    assert!(drive(&mut orch).await);

    for id in &ids {
        assert_eq!(orch.graph().task(id).unwrap().status, TaskStatus::Done);
    }
    assert_eq!(orch.feature_status(), FeatureStatus::ReadyToIntegrate);

    // history respects the chain: each task is assigned only after its
    // predecessor is done
    let history = orch.history();
    for pair in ids.windows(2) {
        let done_at = history
            .iter()
            .position(|c| c.task_id == pair[0] && c.to == TaskStatus::Done)
            .expect("predecessor completion recorded");
        let assigned_at = history
            .iter()
            .position(|c| c.task_id == pair[1] && c.to == TaskStatus::Developing)
            .expect("successor assignment recorded");
        assert!(done_at < assigned_at);
    }
}

#[tokio::test]
async fn diamond_join_waits_for_both_branches() {
    let (graph, [a, b, c, d]) = diamond_graph();
    let mut orch = build_orchestrator(
        Feature::new("diamond", "Diamond", "fan out and join"),
        ScriptedEditor::succeeding(),
        ScriptedReviewer::approving(),
        ScriptedVerifier::passing(),
        StubWorkspace::new(),
        Arc::new(MemoryStore::new()),
        OrchestratorConfig::default(),
    );
    orch.initialize(graph).unwrap();
    orch.start().unwrap();

    assert!(drive(&mut orch).await);

    for id in [a, b, c, d] {
        assert_eq!(orch.graph().task(&id).unwrap().status, TaskStatus::Done);
    }

    let history = orch.history();
    let d_assigned = history
        .iter()
        .position(|ch| ch.task_id == d && ch.to == TaskStatus::Developing)
        .expect("join assignment recorded");
    for branch in [b, c] {
        let branch_done = history
            .iter()
            .position(|ch| ch.task_id == branch && ch.to == TaskStatus::Done)
            .expect("branch completion recorded");
        assert!(branch_done < d_assigned);
    }
}

#[tokio::test]
async fn pools_track_statuses_at_every_tick() {
    let (graph, _) = diamond_graph();
    let mut orch = build_orchestrator(
        Feature::new("pools", "Pools", "consistency probe"),
        ScriptedEditor::succeeding(),
        ScriptedReviewer::approving(),
        ScriptedVerifier::passing(),
        StubWorkspace::new(),
        Arc::new(MemoryStore::new()),
        OrchestratorConfig::default(),
    );
    orch.initialize(graph).unwrap();
    orch.start().unwrap();

    for _ in 0..400 {
        let summary = orch.tick().await.unwrap();
        for task in orch.graph().tasks() {
            assert_eq!(
                orch.pools().status_of(&task.id),
                Some(task.status),
                "pool disagrees with task {}",
                task.id.short()
            );
        }
        if summary.completed {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("diamond did not complete");
}

#[tokio::test]
async fn concurrency_limit_bounds_in_flight_tasks() {
    // 8 independent tasks, at most 2 developing at once
    let mut graph = conductor::core::graph::Graph::new();
    for i in 0..8 {
        graph.add_task(conductor::core::task::Task::new(
            &format!("independent {i}"),
            "",
        ));
    }
    let mut orch = build_orchestrator(
        Feature::new("wide", "Wide", "independent tasks"),
        ScriptedEditor::succeeding(),
        ScriptedReviewer::approving(),
        ScriptedVerifier::passing(),
        StubWorkspace::new(),
        Arc::new(MemoryStore::new()),
        OrchestratorConfig {
            max_concurrent_tasks: 2,
            ..OrchestratorConfig::default()
        },
    );
    orch.initialize(graph).unwrap();
    orch.start().unwrap();

    for _ in 0..400 {
        let summary = orch.tick().await.unwrap();
        assert!(orch.pools().pool(TaskStatus::Developing).len() <= 2);
        if summary.completed {
            assert_eq!(orch.pools().pool(TaskStatus::Done).len(), 8);
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("wide graph did not complete");
}
