//! End-to-end run against a real git repository: worktree provisioning,
//! committing edits, and commit markers from real HEADs.

use std::sync::Arc;

use git2::Repository;

use conductor::core::feature::Feature;
use conductor::core::graph::Graph;
use conductor::core::task::{Task, TaskStatus};
use conductor::orchestration::OrchestratorConfig;
use conductor::state::MemoryStore;
use conductor::workspace::{GitWorkspace, WorkspaceService};

use crate::fixtures::{
    build_orchestrator, drive, CommittingEditor, ScriptedReviewer, ScriptedVerifier, TestRepo,
};

#[tokio::test]
async fn tasks_commit_into_their_own_worktrees() {
    let repo = TestRepo::new();
    let workspace = Arc::new(GitWorkspace::new(&repo.repo_path, &repo.worktrees_path).unwrap());

    let mut graph = Graph::new();
    let a = graph.add_task(Task::new("first change", "commit a file"));
    let b = graph.add_task(Task::new("second change", "commit another file"));
    graph.add_connection(a, b).unwrap();

    let mut orch = build_orchestrator(
        Feature::new("git-e2e", "GitE2E", "real repository run"),
        Arc::new(CommittingEditor),
        ScriptedReviewer::approving(),
        ScriptedVerifier::passing(),
        workspace.clone(),
        Arc::new(MemoryStore::new()),
        OrchestratorConfig::default(),
    );
    orch.initialize(graph).unwrap();
    orch.start().unwrap();

    assert!(drive(&mut orch).await);

    // done tasks keep their work on per-task branches; the worktrees
    // themselves are cleaned up
    let main_repo = Repository::open(&repo.repo_path).unwrap();
    for id in [a, b] {
        let task = orch.graph().task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Done);

        let marker = task.commit_marker.as_ref().expect("commit marker set");
        let branch = main_repo
            .find_branch(&format!("conductor/task/{}", id.short()), git2::BranchType::Local)
            .unwrap();
        let head = branch.get().peel_to_commit().unwrap();
        assert_eq!(head.id().to_string(), *marker);
        assert!(head.message().unwrap().starts_with("implement"));

        assert!(!repo.worktrees_path.join(id.short()).exists());
    }
}

#[tokio::test]
async fn readiness_check_blocks_start_on_empty_repo() {
    let dir = tempfile::TempDir::new().unwrap();
    let repo_path = dir.path().join("repo");
    std::fs::create_dir_all(&repo_path).unwrap();
    Repository::init(&repo_path).unwrap();

    let workspace =
        Arc::new(GitWorkspace::new(&repo_path, &dir.path().join("worktrees")).unwrap());

    let mut graph = Graph::new();
    graph.add_task(Task::new("t", ""));

    let mut orch = build_orchestrator(
        Feature::new("not-ready", "NotReady", "repo has no commits"),
        Arc::new(CommittingEditor),
        ScriptedReviewer::approving(),
        ScriptedVerifier::passing(),
        workspace,
        Arc::new(MemoryStore::new()),
        OrchestratorConfig::default(),
    );
    orch.initialize(graph).unwrap();

    let err = orch.start().unwrap_err();
    assert!(err.to_string().contains("no commits"));
}

#[tokio::test]
async fn stash_roundtrip_through_pause_and_resume() {
    let repo = TestRepo::new();
    let workspace = GitWorkspace::new(&repo.repo_path, &repo.worktrees_path).unwrap();

    let task = Task::new("suspended", "has uncommitted work");
    let handle = workspace.prepare(&task).unwrap();

    let file = handle.path.join("wip.txt");
    std::fs::write(&file, "half done").unwrap();

    let stash_ref = workspace.stash(&handle).unwrap().expect("dirty tree stashes");
    assert!(!file.exists());

    workspace.unstash(&handle, &stash_ref).unwrap();
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "half done");
}
