//! Shared fixtures: a real git repository, scripted collaborators, and
//! graph builders.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use git2::{Repository, Signature};
use tempfile::TempDir;

use conductor::agents::{
    EditCollaborator, EditOutcome, EditRequest, ReviewCollaborator, ReviewOutcome, ReviewRequest,
};
use conductor::core::feature::Feature;
use conductor::core::graph::Graph;
use conductor::core::task::{Task, TaskId};
use conductor::error::Result;
use conductor::orchestration::{
    InvocationLimiter, Orchestrator, OrchestratorConfig, VerificationReport, VerificationResult,
    Verifier,
};
use conductor::orchestration::orchestrator::ExecutionStatus;
use conductor::state::GraphStore;
use conductor::workspace::{WorkspaceHandle, WorkspaceService};

/// A throwaway git repository with an initial commit.
pub struct TestRepo {
    pub dir: TempDir,
    pub repo_path: PathBuf,
    pub worktrees_path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let repo_path = dir.path().join("repo");
        std::fs::create_dir_all(&repo_path).unwrap();

        let repo = Repository::init(&repo_path).unwrap();
        std::fs::write(repo_path.join("README.md"), "# test\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test", "test@localhost").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial commit", &tree, &[])
            .unwrap();

        let worktrees_path = dir.path().join("worktrees");
        Self {
            dir,
            repo_path,
            worktrees_path,
        }
    }
}

/// Edit collaborator that fails its first `fail_first` invocations, then
/// succeeds.
pub struct ScriptedEditor {
    failures_left: AtomicUsize,
}

impl ScriptedEditor {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(0),
        })
    }

    pub fn failing_first(n: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(n),
        })
    }
}

impl EditCollaborator for ScriptedEditor {
    fn edit(&self, _request: EditRequest) -> BoxFuture<'static, Result<EditOutcome>> {
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            Ok(EditOutcome {
                success: !fail,
                summary: if fail { String::new() } else { "done".to_string() },
                tokens_used: 100,
                error: if fail {
                    Some("edit attempt failed".to_string())
                } else {
                    None
                },
            })
        })
    }
}

/// Edit collaborator that writes and commits a file in the task workspace,
/// exercising the real git plumbing.
pub struct CommittingEditor;

impl EditCollaborator for CommittingEditor {
    fn edit(&self, request: EditRequest) -> BoxFuture<'static, Result<EditOutcome>> {
        Box::pin(async move {
            let path = request.workspace.path.clone();
            let file = path.join(format!("{}.txt", request.task.id.short()));
            std::fs::write(&file, &request.task.title)?;

            let repo = Repository::open(&path)?;
            let mut index = repo.index()?;
            index.add_path(Path::new(file.file_name().unwrap().to_str().unwrap()))?;
            index.write()?;
            let tree_id = index.write_tree()?;
            let tree = repo.find_tree(tree_id)?;
            let sig = Signature::now("Agent", "agent@localhost")?;
            let parent = repo.head()?.peel_to_commit()?;
            repo.commit(
                Some("HEAD"),
                &sig,
                &sig,
                &format!("implement {}", request.task.title),
                &tree,
                &[&parent],
            )?;

            Ok(EditOutcome {
                success: true,
                summary: format!("implemented {}", request.task.title),
                tokens_used: 500,
                error: None,
            })
        })
    }
}

/// Review collaborator that asks for rework the first `revise_first` times,
/// then approves everything.
pub struct ScriptedReviewer {
    revisions_left: AtomicUsize,
    pub feedback: String,
}

impl ScriptedReviewer {
    pub fn approving() -> Arc<Self> {
        Arc::new(Self {
            revisions_left: AtomicUsize::new(0),
            feedback: String::new(),
        })
    }

    pub fn revising_first(n: usize, feedback: &str) -> Arc<Self> {
        Arc::new(Self {
            revisions_left: AtomicUsize::new(n),
            feedback: feedback.to_string(),
        })
    }
}

impl ReviewCollaborator for ScriptedReviewer {
    fn review(&self, _request: ReviewRequest) -> BoxFuture<'static, Result<ReviewOutcome>> {
        let revise = self
            .revisions_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let feedback = if revise {
            self.feedback.clone()
        } else {
            "approved".to_string()
        };
        Box::pin(async move {
            Ok(ReviewOutcome {
                passed: !revise,
                feedback,
                commit: None,
            })
        })
    }
}

/// Verifier that pops scripted pass/fail outcomes, defaulting to pass once
/// the script is exhausted.
pub struct ScriptedVerifier {
    script: Mutex<VecDeque<bool>>,
}

impl ScriptedVerifier {
    pub fn passing() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
        })
    }

    pub fn with_script(script: Vec<bool>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
        })
    }
}

impl Verifier for ScriptedVerifier {
    fn verify<'a>(
        &'a self,
        _workspace: &'a WorkspaceHandle,
    ) -> BoxFuture<'a, Result<VerificationReport>> {
        let pass = self.script.lock().unwrap().pop_front().unwrap_or(true);
        Box::pin(async move {
            Ok(VerificationReport {
                results: vec![VerificationResult {
                    check_id: "build".to_string(),
                    passed: pass,
                    exit_code: Some(if pass { 0 } else { 1 }),
                    stdout: String::new(),
                    stderr: String::new(),
                    duration_ms: 1,
                    timed_out: false,
                }],
                all_required_passed: pass,
                stopped_early: !pass,
            })
        })
    }
}

/// Workspace service that hands out the same scratch directory for every
/// task, for tests that do not touch git.
pub struct StubWorkspace {
    dir: TempDir,
}

impl StubWorkspace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dir: TempDir::new().unwrap(),
        })
    }
}

impl WorkspaceService for StubWorkspace {
    fn readiness_check(&self) -> Result<()> {
        Ok(())
    }

    fn prepare(&self, task: &Task) -> Result<WorkspaceHandle> {
        Ok(WorkspaceHandle {
            task_id: task.id,
            path: self.dir.path().to_path_buf(),
            branch: None,
        })
    }

    fn stash(&self, _handle: &WorkspaceHandle) -> Result<Option<String>> {
        Ok(None)
    }

    fn unstash(&self, _handle: &WorkspaceHandle, _stash_ref: &str) -> Result<()> {
        Ok(())
    }

    fn head_commit(&self, _handle: &WorkspaceHandle) -> Result<String> {
        Ok("feedc0de".to_string())
    }

    fn cleanup(&self, _handle: &WorkspaceHandle) -> Result<()> {
        Ok(())
    }
}

/// A chain a -> b -> c -> ...
pub fn chain_graph(n: usize) -> (Graph, Vec<TaskId>) {
    let mut graph = Graph::new();
    let ids: Vec<TaskId> = (0..n)
        .map(|i| graph.add_task(Task::new(&format!("step {i}"), "chained work")))
        .collect();
    for pair in ids.windows(2) {
        graph.add_connection(pair[0], pair[1]).unwrap();
    }
    (graph, ids)
}

/// A diamond: a -> (b, c) -> d.
pub fn diamond_graph() -> (Graph, [TaskId; 4]) {
    let mut graph = Graph::new();
    let a = graph.add_task(Task::new("a", "root"));
    let b = graph.add_task(Task::new("b", "left"));
    let c = graph.add_task(Task::new("c", "right"));
    let d = graph.add_task(Task::new("d", "join"));
    graph.add_connection(a, b).unwrap();
    graph.add_connection(a, c).unwrap();
    graph.add_connection(b, d).unwrap();
    graph.add_connection(c, d).unwrap();
    (graph, [a, b, c, d])
}

#[allow(clippy::too_many_arguments)]
pub fn build_orchestrator(
    feature: Feature,
    editor: Arc<dyn EditCollaborator>,
    reviewer: Arc<dyn ReviewCollaborator>,
    verifier: Arc<dyn Verifier>,
    workspace: Arc<dyn WorkspaceService>,
    store: Arc<dyn GraphStore>,
    config: OrchestratorConfig,
) -> Orchestrator {
    Orchestrator::new(
        feature,
        editor,
        reviewer,
        verifier,
        workspace,
        store,
        InvocationLimiter::new(4),
        config,
    )
}

/// Tick until the session settles. Returns true on completion, false when
/// the session failed; panics if it wedges.
pub async fn drive(orchestrator: &mut Orchestrator) -> bool {
    for _ in 0..400 {
        let summary = orchestrator.tick().await.unwrap();
        if summary.completed {
            return true;
        }
        if orchestrator.execution().status == ExecutionStatus::Failed {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("orchestrator did not settle");
}
