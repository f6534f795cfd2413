//! Persistence across sessions: stop mid-run, resume from disk, finish.

use std::sync::Arc;

use tempfile::TempDir;

use conductor::core::feature::{Feature, FeatureId};
use conductor::core::task::TaskStatus;
use conductor::orchestration::OrchestratorConfig;
use conductor::state::{GraphStore, JsonFileStore};

use crate::fixtures::{
    build_orchestrator, chain_graph, drive, ScriptedEditor, ScriptedReviewer, ScriptedVerifier,
    StubWorkspace,
};

#[tokio::test]
async fn graph_survives_stop_and_resume() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonFileStore::new(dir.path().to_path_buf()));
    let feature_id = FeatureId::from("persisted");
    let (graph, ids) = chain_graph(3);

    // First session: complete the first task, then stop.
    {
        let mut orch = build_orchestrator(
            Feature::new(feature_id.clone(), "Persisted", "survives restarts"),
            ScriptedEditor::succeeding(),
            ScriptedReviewer::approving(),
            ScriptedVerifier::passing(),
            StubWorkspace::new(),
            store.clone(),
            OrchestratorConfig::default(),
        );
        orch.initialize(graph).unwrap();
        orch.start().unwrap();

        for _ in 0..400 {
            orch.tick().await.unwrap();
            let first_done = orch.graph().task(&ids[0]).unwrap().status == TaskStatus::Done;
            if first_done {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(
            orch.graph().task(&ids[0]).unwrap().status,
            TaskStatus::Done
        );
        orch.stop().unwrap();
    }

    // The persisted graph reflects the first task's completion.
    let persisted = store.load_graph(&feature_id).unwrap().unwrap();
    assert_eq!(
        persisted.task(&ids[0]).unwrap().status,
        TaskStatus::Done
    );
    assert!(persisted.task(&ids[0]).unwrap().commit_marker.is_some());

    // Second session: initialize with an empty graph; the persisted one
    // wins, and the remaining tasks complete.
    {
        let mut orch = build_orchestrator(
            Feature::new(feature_id.clone(), "Persisted", "survives restarts"),
            ScriptedEditor::succeeding(),
            ScriptedReviewer::approving(),
            ScriptedVerifier::passing(),
            StubWorkspace::new(),
            store.clone(),
            OrchestratorConfig::default(),
        );
        orch.initialize(conductor::core::graph::Graph::new()).unwrap();
        assert_eq!(orch.graph().len(), 3);
        orch.start().unwrap();

        assert!(drive(&mut orch).await);
        for id in &ids {
            assert_eq!(orch.graph().task(id).unwrap().status, TaskStatus::Done);
        }
    }
}

#[tokio::test]
async fn interrupted_tasks_are_recovered_on_resume() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonFileStore::new(dir.path().to_path_buf()));
    let feature_id = FeatureId::from("interrupted");

    // Forge a graph persisted mid-flight: one task stuck developing.
    let mut graph = conductor::core::graph::Graph::new();
    let id = graph.add_task(conductor::core::task::Task::new("stuck", "was mid-edit"));
    graph.task_mut(&id).unwrap().status = TaskStatus::Developing;
    store.save_graph(&feature_id, &graph).unwrap();

    let mut orch = build_orchestrator(
        Feature::new(feature_id, "Interrupted", "crash recovery"),
        ScriptedEditor::succeeding(),
        ScriptedReviewer::approving(),
        ScriptedVerifier::passing(),
        StubWorkspace::new(),
        store,
        OrchestratorConfig::default(),
    );
    orch.initialize(conductor::core::graph::Graph::new()).unwrap();

    // recovered to ready, not paused, and runnable
    let task = orch.graph().task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert!(!task.paused);

    orch.start().unwrap();
    assert!(drive(&mut orch).await);
    assert_eq!(orch.graph().task(&id).unwrap().status, TaskStatus::Done);
}

#[tokio::test]
async fn feature_status_is_persisted() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonFileStore::new(dir.path().to_path_buf()));
    let feature_id = FeatureId::from("status");

    let mut graph = conductor::core::graph::Graph::new();
    graph.add_task(conductor::core::task::Task::new("only", ""));

    let mut orch = build_orchestrator(
        Feature::new(feature_id.clone(), "Status", "persists its status"),
        ScriptedEditor::succeeding(),
        ScriptedReviewer::approving(),
        ScriptedVerifier::passing(),
        StubWorkspace::new(),
        store.clone(),
        OrchestratorConfig::default(),
    );
    orch.initialize(graph).unwrap();
    orch.start().unwrap();
    assert!(drive(&mut orch).await);

    let feature = store.load_feature(&feature_id).unwrap().unwrap();
    assert_eq!(
        feature.status,
        conductor::core::feature::FeatureStatus::ReadyToIntegrate
    );
}
