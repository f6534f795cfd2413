//! The session orchestrator.
//!
//! Owns the task graph for one feature and drives it to completion through
//! a periodic tick: assign ready tasks to controllers, harvest finished
//! loops, gate verifying tasks through review, cascade completions, and
//! persist. Every status change goes through [`Orchestrator::apply_event`]
//! so the graph, the pools, and the history never disagree.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::{EditCollaborator, ReviewCollaborator, ReviewOutcome, ReviewRequest};
use crate::core::feature::{feature_status, Feature, FeatureStatus};
use crate::core::graph::Graph;
use crate::core::task::{StateChange, TaskEvent, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::controller::{
    ControllerHandle, ExitReason, LoopConfig, TaskController,
};
use crate::orchestration::limiter::{InvocationLimiter, InvocationPriority};
use crate::orchestration::pools::PoolManager;
use crate::orchestration::verify::Verifier;
use crate::state::GraphStore;
use crate::workspace::{WorkspaceHandle, WorkspaceService};
use crate::{clog, clog_debug, clog_warn};

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

/// Session-level execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            status: ExecutionStatus::Idle,
            started_at: None,
            stopped_at: None,
            last_error: None,
        }
    }
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent_tasks: usize,
    /// Give up on a task after this many failed workspace preparations.
    pub max_assignment_retries: u32,
    /// Give up on a task after this many failed review invocations.
    /// A REVISE verdict is not a failed invocation and never counts.
    pub max_review_retries: u32,
    pub tick_interval: Duration,
    pub loop_config: LoopConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_assignment_retries: 3,
            max_review_retries: 3,
            tick_interval: Duration::from_millis(1000),
            loop_config: LoopConfig::default(),
        }
    }
}

/// Notifications emitted as the session progresses.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    Started { feature_id: String },
    TaskStarted { task_id: TaskId },
    TaskCompleted { task_id: TaskId, commit: Option<String> },
    TaskFailed { task_id: TaskId, error: String },
    ReviewPassed { task_id: TaskId },
    ReviewFailed { task_id: TaskId, feedback: String },
    FeatureStatusChanged { status: FeatureStatus },
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub assigned: usize,
    pub harvested: usize,
    pub reviews_started: usize,
    pub reviews_resolved: usize,
    pub feature_status: Option<FeatureStatus>,
    pub completed: bool,
}

/// Drives one feature's task graph to completion.
pub struct Orchestrator {
    feature: Feature,
    graph: Graph,
    pools: PoolManager,
    history: Vec<StateChange>,
    execution: ExecutionState,
    controllers: HashMap<TaskId, ControllerHandle>,
    reviews: HashMap<TaskId, JoinHandle<Result<ReviewOutcome>>>,
    workspaces: HashMap<TaskId, WorkspaceHandle>,
    assign_retries: HashMap<TaskId, u32>,
    review_retries: HashMap<TaskId, u32>,
    editor: Arc<dyn EditCollaborator>,
    reviewer: Arc<dyn ReviewCollaborator>,
    verifier: Arc<dyn Verifier>,
    workspace: Arc<dyn WorkspaceService>,
    store: Arc<dyn GraphStore>,
    limiter: InvocationLimiter,
    config: OrchestratorConfig,
    events: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feature: Feature,
        editor: Arc<dyn EditCollaborator>,
        reviewer: Arc<dyn ReviewCollaborator>,
        verifier: Arc<dyn Verifier>,
        workspace: Arc<dyn WorkspaceService>,
        store: Arc<dyn GraphStore>,
        limiter: InvocationLimiter,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            feature,
            graph: Graph::new(),
            pools: PoolManager::new(),
            history: Vec::new(),
            execution: ExecutionState::default(),
            controllers: HashMap::new(),
            reviews: HashMap::new(),
            workspaces: HashMap::new(),
            assign_retries: HashMap::new(),
            review_retries: HashMap::new(),
            editor,
            reviewer,
            verifier,
            workspace,
            store,
            limiter,
            config,
            events: None,
        }
    }

    /// Subscribe to progress notifications.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    pub fn execution(&self) -> &ExecutionState {
        &self.execution
    }

    pub fn feature(&self) -> &Feature {
        &self.feature
    }

    pub fn feature_status(&self) -> FeatureStatus {
        feature_status(&self.graph)
    }

    /// Load (or adopt) the task graph and bring it to a consistent state.
    ///
    /// Persisted state wins over the supplied graph, so re-running a
    /// feature resumes where it left off. Tasks caught mid-flight by a
    /// previous shutdown come back as ready. Idempotent.
    pub fn initialize(&mut self, graph: Graph) -> Result<()> {
        if self.execution.status == ExecutionStatus::Running {
            return Err(Error::Validation(
                "cannot initialize while running".to_string(),
            ));
        }

        let mut graph = match self.store.load_graph(&self.feature.id)? {
            Some(persisted) => {
                clog!(
                    "Resuming feature {} from persisted graph ({} tasks)",
                    self.feature.id,
                    persisted.len()
                );
                persisted
            }
            None => graph,
        };

        let topo = graph.topological_order();
        if topo.has_cycle() {
            return Err(Error::CycleDetected { tasks: topo.cycle });
        }

        // Tasks interrupted mid-flight by a previous shutdown go back to
        // ready so they can be reassigned.
        let stale: Vec<TaskId> = graph
            .tasks()
            .filter(|t| matches!(t.status, TaskStatus::Developing | TaskStatus::Verifying))
            .map(|t| t.id)
            .collect();
        for id in stale {
            if let Some(task) = graph.task_mut(&id) {
                let change = task.apply(TaskEvent::Pause)?;
                task.paused = false;
                clog_debug!("recovered stale task {} -> ready", id.short());
                self.history.push(change);
            }
        }

        self.history.extend(graph.recompute_statuses());
        self.pools.initialize_from_graph(&graph);
        self.graph = graph;
        self.store.save_graph(&self.feature.id, &self.graph)?;
        self.store.save_feature(&self.feature)?;
        Ok(())
    }

    /// Begin executing. Fails when the workspace backing is not usable.
    pub fn start(&mut self) -> Result<()> {
        if self.execution.status == ExecutionStatus::Running {
            return Ok(());
        }
        self.workspace.readiness_check()?;
        self.execution.status = ExecutionStatus::Running;
        self.execution.started_at = Some(Utc::now());
        self.execution.stopped_at = None;
        self.emit(OrchestratorEvent::Started {
            feature_id: self.feature.id.to_string(),
        });
        clog!("Orchestrator started for feature {}", self.feature.id);
        Ok(())
    }

    /// Stop assigning and harvesting; running loops keep their slots.
    pub fn pause(&mut self) {
        if self.execution.status == ExecutionStatus::Running {
            self.execution.status = ExecutionStatus::Paused;
            clog!("Orchestrator paused");
        }
    }

    pub fn resume(&mut self) {
        if self.execution.status == ExecutionStatus::Paused {
            self.execution.status = ExecutionStatus::Running;
            clog!("Orchestrator resumed");
        }
    }

    /// Persist state and tear the session down.
    pub fn stop(&mut self) -> Result<()> {
        self.store.save_graph(&self.feature.id, &self.graph)?;
        self.store.save_feature(&self.feature)?;

        for (_, handle) in self.controllers.drain() {
            handle.kill();
        }
        for (_, handle) in self.reviews.drain() {
            handle.abort();
        }
        self.limiter.drain();
        self.workspaces.clear();
        self.assign_retries.clear();
        self.review_retries.clear();
        self.execution.status = ExecutionStatus::Idle;
        self.execution.stopped_at = Some(Utc::now());
        clog!("Orchestrator stopped");
        Ok(())
    }

    /// Suspend one task: abort its loop, stash its uncommitted work, and
    /// exclude it from assignment until resumed.
    pub fn pause_task(&mut self, id: TaskId) -> Result<()> {
        if let Some(handle) = self.controllers.remove(&id) {
            handle.kill();
        }
        // A verdict for a paused task would not apply anymore; drop the
        // in-flight review and its retry count with it.
        if let Some(handle) = self.reviews.remove(&id) {
            handle.abort();
        }
        self.review_retries.remove(&id);
        if let Some(ws) = self.workspaces.get(&id) {
            let stash_ref = self.workspace.stash(ws)?;
            if let Some(task) = self.graph.task_mut(&id) {
                task.stash_ref = stash_ref;
            }
        }
        self.apply_event(id, TaskEvent::Pause)?;
        clog!("Task {} paused", id.short());
        Ok(())
    }

    /// Allow a suspended task to be assigned again. Stashed work is
    /// restored when the workspace is next prepared.
    pub fn resume_task(&mut self, id: TaskId) -> Result<()> {
        let task = self
            .graph
            .task_mut(&id)
            .ok_or(Error::TaskNotFound(id))?;
        task.paused = false;
        clog!("Task {} resumed", id.short());
        Ok(())
    }

    /// Run the tick loop until the feature finishes or `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop()?;
                    return Ok(());
                }
                _ = interval.tick() => {
                    let summary = self.tick().await?;
                    if summary.completed
                        || self.execution.status == ExecutionStatus::Failed
                    {
                        self.stop()?;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One scheduling pass. Public so embedders and tests can drive the
    /// session deterministically without the timer.
    pub async fn tick(&mut self) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        if self.execution.status != ExecutionStatus::Running {
            return Ok(summary);
        }

        summary.harvested = self.harvest_controllers().await?;
        summary.reviews_resolved = self.resolve_reviews().await?;
        summary.reviews_started = self.start_reviews()?;
        summary.assigned = self.assign_ready_tasks()?;

        // Session end: nothing in flight and nothing was startable this
        // tick. A failed task blocks its dependents forever, so the session
        // also ends when failures have starved the schedule.
        let counts = self.graph.status_counts();
        let done = counts.get(&TaskStatus::Done).copied().unwrap_or(0);
        let failed = counts.get(&TaskStatus::Failed).copied().unwrap_or(0);
        let total = self.graph.len();
        let idle = self.controllers.is_empty()
            && self.reviews.is_empty()
            && summary.assigned == 0
            && summary.reviews_started == 0;
        let suspended = self
            .graph
            .tasks()
            .any(|t| t.paused && !t.status.is_terminal());
        if total > 0 && idle {
            if done == total {
                self.execution.status = ExecutionStatus::Completed;
                summary.completed = true;
                clog!("Feature {} completed: all {} tasks done", self.feature.id, total);
            } else if failed > 0 && !suspended {
                self.execution.status = ExecutionStatus::Failed;
                clog_warn!(
                    "Feature {} cannot progress: {} task(s) failed",
                    self.feature.id,
                    failed
                );
            }
        }

        self.store.save_graph(&self.feature.id, &self.graph)?;
        let status = feature_status(&self.graph);
        if status != self.feature.status {
            self.feature.status = status;
            self.store.save_feature(&self.feature)?;
            self.emit(OrchestratorEvent::FeatureStatusChanged { status });
            summary.feature_status = Some(status);
        }
        Ok(summary)
    }

    /// Apply a lifecycle event to a task, keeping graph, pools, and
    /// history in lockstep. Nothing changes when the transition is
    /// illegal.
    fn apply_event(&mut self, id: TaskId, event: TaskEvent) -> Result<StateChange> {
        let task = self.graph.task_mut(&id).ok_or(Error::TaskNotFound(id))?;
        let change = task.apply(event)?;
        self.pools.move_task(id, change.from, change.to)?;
        self.history.push(change.clone());
        clog_debug!(
            "task {}: {} -> {} ({})",
            id.short(),
            change.from,
            change.to,
            event
        );
        Ok(change)
    }

    fn assign_ready_tasks(&mut self) -> Result<usize> {
        // Rework after a failed review resumes without a new assignment
        // event; the task is already developing.
        let mut candidates: Vec<(TaskId, bool)> = self
            .pools
            .pool(TaskStatus::Developing)
            .iter()
            .filter(|id| !self.controllers.contains_key(id))
            .map(|id| (*id, false))
            .collect();
        let mut ready: Vec<TaskId> = self.pools.pool(TaskStatus::Ready).iter().copied().collect();
        ready.sort();
        candidates.extend(ready.into_iter().map(|id| (id, true)));

        let mut assigned = 0;
        for (id, needs_assignment) in candidates {
            if self.controllers.len() >= self.config.max_concurrent_tasks {
                break;
            }
            let Some(task) = self.graph.task(&id) else { continue };
            if task.paused || task.locked {
                continue;
            }

            let ws = match self.prepare_workspace(id) {
                Ok(ws) => ws,
                Err(e) => {
                    let attempts = self.assign_retries.entry(id).or_insert(0);
                    *attempts += 1;
                    clog_warn!(
                        "workspace preparation failed for {} (attempt {}): {}",
                        id.short(),
                        attempts,
                        e
                    );
                    if *attempts >= self.config.max_assignment_retries {
                        self.fail_assignment(id, needs_assignment, &e.to_string())?;
                    }
                    continue;
                }
            };

            if needs_assignment {
                self.apply_event(id, TaskEvent::AgentAssigned)?;
            }
            let task = self
                .graph
                .task(&id)
                .ok_or(Error::TaskNotFound(id))?
                .clone();
            let controller = TaskController::new(
                task,
                self.feature.specification.clone(),
                ws,
                Arc::clone(&self.editor),
                Arc::clone(&self.verifier),
                self.limiter.clone(),
                self.config.loop_config,
            );
            self.controllers.insert(id, controller.spawn());
            self.assign_retries.remove(&id);
            self.emit(OrchestratorEvent::TaskStarted { task_id: id });
            assigned += 1;
        }
        Ok(assigned)
    }

    fn prepare_workspace(&mut self, id: TaskId) -> Result<WorkspaceHandle> {
        let task = self
            .graph
            .task(&id)
            .ok_or(Error::TaskNotFound(id))?
            .clone();
        let ws = self.workspace.prepare(&task)?;
        if let Some(stash_ref) = &task.stash_ref {
            if let Err(e) = self.workspace.unstash(&ws, stash_ref) {
                clog_warn!(
                    "could not restore stashed work for {}: {}",
                    id.short(),
                    e
                );
            }
            if let Some(task) = self.graph.task_mut(&id) {
                task.stash_ref = None;
            }
        }
        self.workspaces.insert(id, ws.clone());
        Ok(ws)
    }

    /// Retries exhausted: the task fails without ever getting an agent.
    fn fail_assignment(&mut self, id: TaskId, from_ready: bool, error: &str) -> Result<()> {
        if from_ready {
            self.apply_event(id, TaskEvent::AgentAssigned)?;
        }
        self.apply_event(id, TaskEvent::TaskFailed)?;
        if let Some(task) = self.graph.task_mut(&id) {
            task.last_error = Some(error.to_string());
        }
        self.assign_retries.remove(&id);
        self.emit(OrchestratorEvent::TaskFailed {
            task_id: id,
            error: error.to_string(),
        });
        Ok(())
    }

    async fn harvest_controllers(&mut self) -> Result<usize> {
        let finished: Vec<TaskId> = self
            .controllers
            .iter()
            .filter(|(_, h)| h.is_finished())
            .map(|(id, _)| *id)
            .collect();

        let mut harvested = 0;
        for id in finished {
            let Some(handle) = self.controllers.remove(&id) else { continue };
            harvested += 1;
            let outcome = match handle.harvest().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let paused = self
                        .graph
                        .task(&id)
                        .map(|t| t.paused)
                        .unwrap_or(false);
                    if !paused {
                        clog_warn!("controller for {} panicked: {}", id.short(), e);
                        self.fail_task(id, "controller terminated unexpectedly")?;
                    }
                    continue;
                }
            };

            match outcome.exit_reason {
                ExitReason::AllChecksPassed => {
                    clog!(
                        "Task {} passed checks after {} iteration(s)",
                        id.short(),
                        outcome.iterations
                    );
                    self.apply_event(id, TaskEvent::IterationsPassed)?;
                }
                ExitReason::MaxIterationsReached => {
                    self.fail_task(id, "iteration budget exhausted before checks passed")?;
                }
                ExitReason::ContextLimitReached => {
                    self.fail_task(id, "context budget exhausted before checks passed")?;
                }
                ExitReason::Error => {
                    let detail = outcome
                        .last_error
                        .unwrap_or_else(|| "edit loop error".to_string());
                    self.fail_task(id, &detail)?;
                }
                // Pause and stop already routed the task's status.
                ExitReason::Aborted => {}
            }
        }
        Ok(harvested)
    }

    fn fail_task(&mut self, id: TaskId, error: &str) -> Result<()> {
        self.apply_event(id, TaskEvent::TaskFailed)?;
        if let Some(task) = self.graph.task_mut(&id) {
            task.last_error = Some(error.to_string());
        }
        // Failed tasks keep their worktree on disk for inspection; only
        // the handle is dropped.
        self.workspaces.remove(&id);
        self.emit(OrchestratorEvent::TaskFailed {
            task_id: id,
            error: error.to_string(),
        });
        Ok(())
    }

    fn start_reviews(&mut self) -> Result<usize> {
        let mut pending: Vec<TaskId> = self
            .pools
            .pool(TaskStatus::Verifying)
            .iter()
            .filter(|id| !self.reviews.contains_key(id))
            .copied()
            .collect();
        pending.sort();

        let mut started = 0;
        for id in pending {
            let Some(task) = self.graph.task(&id) else { continue };
            if task.paused {
                continue;
            }
            let Some(ws) = self.workspaces.get(&id) else {
                clog_warn!("no workspace for verifying task {}", id.short());
                continue;
            };
            let request = ReviewRequest {
                task: task.clone(),
                workspace: ws.clone(),
                feature_goal: self.feature.specification.clone(),
            };
            let reviewer = Arc::clone(&self.reviewer);
            let limiter = self.limiter.clone();
            let handle = tokio::spawn(async move {
                let _permit = limiter
                    .acquire(InvocationPriority::Review, "review", Some(id))
                    .await?;
                reviewer.review(request).await
            });
            self.reviews.insert(id, handle);
            started += 1;
        }
        Ok(started)
    }

    async fn resolve_reviews(&mut self) -> Result<usize> {
        let finished: Vec<TaskId> = self
            .reviews
            .iter()
            .filter(|(_, h)| h.is_finished())
            .map(|(id, _)| *id)
            .collect();

        let mut resolved = 0;
        for id in finished {
            let Some(handle) = self.reviews.remove(&id) else { continue };
            resolved += 1;
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::Validation(format!("review task panicked: {e}"))),
            };

            // The task may have left verifying while the review ran
            // (paused, recovered on resume). Its verdict no longer applies.
            if self.graph.task(&id).map(|t| t.status) != Some(TaskStatus::Verifying) {
                clog_debug!("discarding stale review verdict for {}", id.short());
                self.review_retries.remove(&id);
                continue;
            }

            match result {
                Ok(outcome) if outcome.passed => {
                    self.complete_task(id, outcome.commit)?;
                }
                Ok(outcome) => {
                    clog!("Review failed for task {}", id.short());
                    // A delivered verdict resets the invocation retry count.
                    self.review_retries.remove(&id);
                    self.apply_event(id, TaskEvent::ReviewFailed)?;
                    if let Some(task) = self.graph.task_mut(&id) {
                        task.review_feedback = Some(outcome.feedback.clone());
                    }
                    self.emit(OrchestratorEvent::ReviewFailed {
                        task_id: id,
                        feedback: outcome.feedback,
                    });
                }
                Err(e) => {
                    // The invocation itself failed; the verdict is unknown,
                    // so retry rather than bounce the task back to rework.
                    let attempts = self.review_retries.entry(id).or_insert(0);
                    *attempts += 1;
                    clog_warn!(
                        "review invocation failed for {} (attempt {}): {}",
                        id.short(),
                        attempts,
                        e
                    );
                    if *attempts >= self.config.max_review_retries {
                        self.review_retries.remove(&id);
                        self.fail_task(id, &format!("review unavailable: {e}"))?;
                    }
                }
            }
        }
        Ok(resolved)
    }

    /// Accept reviewed work: record the commit, mark done, and unblock
    /// dependents whose dependencies are now all satisfied.
    fn complete_task(&mut self, id: TaskId, commit: Option<String>) -> Result<()> {
        let commit = match commit {
            Some(commit) => Some(commit),
            None => self
                .workspaces
                .get(&id)
                .and_then(|ws| self.workspace.head_commit(ws).ok()),
        };

        self.apply_event(id, TaskEvent::ReviewPassed)?;
        if let Some(task) = self.graph.task_mut(&id) {
            task.commit_marker = commit.clone();
            task.review_feedback = None;
        }
        self.review_retries.remove(&id);
        self.emit(OrchestratorEvent::ReviewPassed { task_id: id });
        self.emit(OrchestratorEvent::TaskCompleted {
            task_id: id,
            commit,
        });
        clog!("Task {} done", id.short());

        let changes = self.graph.cascade_on_completion(&id)?;
        for change in &changes {
            self.pools.move_task(change.task_id, change.from, change.to)?;
        }
        self.history.extend(changes);
        self.release_workspace(id);
        Ok(())
    }

    /// A done task's work lives on its branch; the worktree can go.
    fn release_workspace(&mut self, id: TaskId) {
        if let Some(ws) = self.workspaces.remove(&id) {
            if let Err(e) = self.workspace.cleanup(&ws) {
                clog_warn!("workspace cleanup failed for {}: {}", id.short(), e);
            }
        }
    }
}
