//! Task controller: the bounded edit-verify loop for one task.
//!
//! Each Developing task gets a controller spawned onto the runtime. The loop
//! asks the edit collaborator to work, runs verification, and repeats until
//! checks pass, a budget runs out, or the loop is aborted. Whatever happens,
//! the controller resolves to a [`LoopOutcome`] the orchestrator harvests on
//! a later tick.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::{EditCollaborator, EditRequest};
use crate::core::task::{Task, TaskId};
use crate::error::Result;
use crate::orchestration::limiter::{InvocationLimiter, InvocationPriority};
use crate::orchestration::verify::{format_summary, VerificationReport, Verifier};
use crate::workspace::WorkspaceHandle;
use crate::{clog, clog_debug, clog_warn};

/// Why a loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    AllChecksPassed,
    MaxIterationsReached,
    ContextLimitReached,
    Error,
    Aborted,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::AllChecksPassed => "all_checks_passed",
            ExitReason::MaxIterationsReached => "max_iterations_reached",
            ExitReason::ContextLimitReached => "context_limit_reached",
            ExitReason::Error => "error",
            ExitReason::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// One completed iteration of the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationResult {
    /// 1-based iteration number.
    pub iteration: u32,
    pub edit_ok: bool,
    pub report: VerificationReport,
}

/// Final result of one controller run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopOutcome {
    pub task_id: TaskId,
    pub exit_reason: ExitReason,
    /// Iterations actually completed.
    pub iterations: u32,
    pub results: Vec<IterationResult>,
    pub tokens_used: u64,
    pub last_error: Option<String>,
}

/// Loop budgets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoopConfig {
    pub max_iterations: u32,
    /// Treat a failed edit invocation as a loop error instead of retrying
    /// on the next iteration.
    pub abort_on_edit_fail: bool,
    /// Rough context budget across the whole loop.
    pub context_budget_tokens: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            abort_on_edit_fail: false,
            context_budget_tokens: 200_000,
        }
    }
}

/// Running controller, owned by the orchestrator.
pub struct ControllerHandle {
    pub task_id: TaskId,
    cancel: CancellationToken,
    join: JoinHandle<LoopOutcome>,
}

impl ControllerHandle {
    /// Request the loop stop. Safe to call any number of times, including
    /// after the loop already finished.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop and take its outcome.
    pub async fn harvest(self) -> std::result::Result<LoopOutcome, tokio::task::JoinError> {
        self.join.await
    }

    /// Force-stop the underlying runtime task.
    pub fn kill(&self) {
        self.cancel.cancel();
        self.join.abort();
    }
}

/// Drives the edit-verify loop for one task.
pub struct TaskController {
    task: Task,
    feature_goal: String,
    workspace: WorkspaceHandle,
    editor: Arc<dyn EditCollaborator>,
    verifier: Arc<dyn Verifier>,
    limiter: InvocationLimiter,
    config: LoopConfig,
}

impl TaskController {
    pub fn new(
        task: Task,
        feature_goal: String,
        workspace: WorkspaceHandle,
        editor: Arc<dyn EditCollaborator>,
        verifier: Arc<dyn Verifier>,
        limiter: InvocationLimiter,
        config: LoopConfig,
    ) -> Self {
        Self {
            task,
            feature_goal,
            workspace,
            editor,
            verifier,
            limiter,
            config,
        }
    }

    /// Spawn the loop onto the runtime and return its handle.
    pub fn spawn(self) -> ControllerHandle {
        let task_id = self.task.id;
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let join = tokio::spawn(async move { self.run(loop_cancel).await });
        ControllerHandle {
            task_id,
            cancel,
            join,
        }
    }

    async fn run(self, cancel: CancellationToken) -> LoopOutcome {
        let task_id = self.task.id;
        let mut results: Vec<IterationResult> = Vec::new();
        let mut tokens_used: u64 = 0;
        let mut last_error: Option<String> = None;
        let mut check_feedback: Option<String> = None;
        let mut iteration: u32 = 1;

        clog!(
            "Controller {}: starting loop (max {} iterations)",
            task_id.short(),
            self.config.max_iterations
        );

        let exit_reason = loop {
            if cancel.is_cancelled() {
                break ExitReason::Aborted;
            }

            // One collaborator slot per edit call, released before checks run.
            let permit = tokio::select! {
                _ = cancel.cancelled() => break ExitReason::Aborted,
                permit = self.limiter.acquire(
                    InvocationPriority::Edit,
                    "edit",
                    Some(task_id),
                ) => match permit {
                    Ok(permit) => permit,
                    Err(_) => break ExitReason::Aborted,
                },
            };

            let request = EditRequest {
                task: self.task.clone(),
                feature_goal: self.feature_goal.clone(),
                workspace: self.workspace.clone(),
                iteration,
                review_feedback: self.task.review_feedback.clone(),
                check_feedback: check_feedback.take(),
            };

            let edit = tokio::select! {
                _ = cancel.cancelled() => {
                    drop(permit);
                    break ExitReason::Aborted;
                }
                edit = self.editor.edit(request) => edit,
            };
            drop(permit);

            let edit_ok = match edit {
                Ok(outcome) => {
                    tokens_used += outcome.tokens_used;
                    if let Some(error) = outcome.error {
                        last_error = Some(error);
                    }
                    outcome.success
                }
                Err(e) => {
                    clog_warn!("Controller {}: edit call failed: {}", task_id.short(), e);
                    last_error = Some(e.to_string());
                    false
                }
            };

            if !edit_ok && self.config.abort_on_edit_fail {
                break ExitReason::Error;
            }

            let report = match self.verifier.verify(&self.workspace).await {
                Ok(report) => report,
                Err(e) => {
                    clog_warn!(
                        "Controller {}: verification failed to run: {}",
                        task_id.short(),
                        e
                    );
                    last_error = Some(e.to_string());
                    break ExitReason::Error;
                }
            };

            let passed = edit_ok && report.all_required_passed;
            check_feedback = if passed {
                None
            } else {
                Some(format_summary(&report.results))
            };

            clog_debug!(
                "Controller {}: iteration {} {}",
                task_id.short(),
                iteration,
                if passed { "passed" } else { "failed" }
            );
            results.push(IterationResult {
                iteration,
                edit_ok,
                report,
            });

            if passed {
                break ExitReason::AllChecksPassed;
            }
            if tokens_used >= self.config.context_budget_tokens {
                break ExitReason::ContextLimitReached;
            }
            if iteration >= self.config.max_iterations {
                break ExitReason::MaxIterationsReached;
            }
            iteration += 1;
        };

        clog!(
            "Controller {}: finished after {} iteration(s): {}",
            task_id.short(),
            results.len(),
            exit_reason
        );
        LoopOutcome {
            task_id,
            exit_reason,
            iterations: results.len() as u32,
            results,
            tokens_used,
            last_error,
        }
    }
}
