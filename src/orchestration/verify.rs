//! Verification runner: ordered checks executed inside a task workspace.
//!
//! Checks run sequentially in a fixed order. A failing check with
//! `continue_on_fail` set lets the sequence proceed (lint-style); a failing
//! check without it stops the run (build-style). A timeout kills the process
//! and is reported as a failing result, never as an error. Captured output
//! is hard-capped so results stay cheap to persist and display.

use std::process::Stdio;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::clog_debug;
use crate::config::VerificationSettings;
use crate::error::Result;
use crate::workspace::WorkspaceHandle;

/// Maximum bytes of stdout/stderr kept per check result.
pub const OUTPUT_CAP: usize = 2000;

/// Appended to output that was cut at [`OUTPUT_CAP`].
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// One configured check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub id: String,
    pub description: String,
    /// Shell command, run via `sh -c` in the workspace directory.
    pub command: String,
    /// Required checks gate the iteration's overall pass/fail.
    pub required: bool,
    /// Soft failure: a failing result does not stop the sequence.
    pub continue_on_fail: bool,
}

/// Outcome of running one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub check_id: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Results of one full verification pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Results in execution order. May be shorter than the configured check
    /// list when a hard failure stopped the run early.
    pub results: Vec<VerificationResult>,
    /// Every applicable required check produced a passing result.
    pub all_required_passed: bool,
    pub stopped_early: bool,
}

/// Seam between the task controller and the check runner, so tests can
/// script verification outcomes.
pub trait Verifier: Send + Sync {
    fn verify<'a>(&'a self, workspace: &'a WorkspaceHandle)
        -> BoxFuture<'a, Result<VerificationReport>>;
}

/// Runs the configured checks with `tokio::process`.
#[derive(Debug, Clone)]
pub struct VerificationRunner {
    checks: Vec<VerificationCheck>,
    timeout: Duration,
}

impl VerificationRunner {
    pub fn from_settings(settings: &VerificationSettings) -> Self {
        let mut checks = Vec::new();
        if settings.build {
            checks.push(VerificationCheck {
                id: "build".to_string(),
                description: "compile the workspace".to_string(),
                command: settings
                    .build_command
                    .clone()
                    .unwrap_or_else(|| "cargo check".to_string()),
                required: true,
                continue_on_fail: false,
            });
        }
        if settings.lint {
            checks.push(VerificationCheck {
                id: "lint".to_string(),
                description: "lint the workspace".to_string(),
                command: settings
                    .lint_command
                    .clone()
                    .unwrap_or_else(|| "cargo clippy --all-targets".to_string()),
                required: true,
                continue_on_fail: true,
            });
        }
        if settings.test {
            checks.push(VerificationCheck {
                id: "test".to_string(),
                description: "run the test suite".to_string(),
                command: settings
                    .test_command
                    .clone()
                    .unwrap_or_else(|| "cargo test".to_string()),
                required: false,
                continue_on_fail: true,
            });
        }
        Self {
            checks,
            timeout: Duration::from_secs(settings.check_timeout_secs),
        }
    }

    pub fn with_checks(checks: Vec<VerificationCheck>, timeout: Duration) -> Self {
        Self { checks, timeout }
    }

    pub fn checks(&self) -> &[VerificationCheck] {
        &self.checks
    }

    /// Configured checks whose command is actually runnable here.
    ///
    /// A check whose command head is not on PATH is skipped entirely; it
    /// neither runs nor counts toward the pass calculation.
    pub fn applicable_checks(&self) -> Vec<VerificationCheck> {
        self.checks
            .iter()
            .filter(|check| command_available(&check.command))
            .cloned()
            .collect()
    }

    /// Run the applicable checks in order, stopping at the first hard
    /// failure.
    pub async fn run_all_checks(&self, workspace: &WorkspaceHandle) -> Result<VerificationReport> {
        let applicable = self.applicable_checks();
        let mut results = Vec::with_capacity(applicable.len());
        let mut stopped_early = false;

        for check in &applicable {
            let result = self.run_check(check, workspace).await?;
            let hard_fail = !result.passed && !check.continue_on_fail;
            clog_debug!(
                "check {} on task {}: {} ({}ms)",
                check.id,
                workspace.task_id.short(),
                result_to_pass_fail(&result),
                result.duration_ms
            );
            results.push(result);
            if hard_fail {
                stopped_early = true;
                break;
            }
        }

        let all_required_passed = applicable
            .iter()
            .filter(|c| c.required)
            .all(|c| results.iter().any(|r| r.check_id == c.id && r.passed));

        Ok(VerificationReport {
            results,
            all_required_passed,
            stopped_early,
        })
    }

    async fn run_check(
        &self,
        check: &VerificationCheck,
        workspace: &WorkspaceHandle,
    ) -> Result<VerificationResult> {
        let started = Instant::now();
        let child = Command::new("sh")
            .arg("-c")
            .arg(&check.command)
            .current_dir(&workspace.path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the output future on timeout kills the child via
        // kill_on_drop.
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(VerificationResult {
                    check_id: check.id.clone(),
                    passed: output.status.success(),
                    exit_code: output.status.code(),
                    stdout: truncate_output(&String::from_utf8_lossy(&output.stdout)),
                    stderr: truncate_output(&String::from_utf8_lossy(&output.stderr)),
                    duration_ms: started.elapsed().as_millis() as u64,
                    timed_out: false,
                })
            }
            Err(_) => Ok(VerificationResult {
                check_id: check.id.clone(),
                passed: false,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("check timed out after {:?}", self.timeout),
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: true,
            }),
        }
    }
}

impl Verifier for VerificationRunner {
    fn verify<'a>(
        &'a self,
        workspace: &'a WorkspaceHandle,
    ) -> BoxFuture<'a, Result<VerificationReport>> {
        Box::pin(self.run_all_checks(workspace))
    }
}

fn command_available(command: &str) -> bool {
    match command.split_whitespace().next() {
        Some(head) => which::which(head).is_ok(),
        None => false,
    }
}

/// Cap output at [`OUTPUT_CAP`] bytes (on a char boundary) and mark the cut.
pub fn truncate_output(s: &str) -> String {
    if s.len() <= OUTPUT_CAP {
        return s.to_string();
    }
    let mut end = OUTPUT_CAP;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + TRUNCATION_MARKER.len());
    out.push_str(&s[..end]);
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Render a result as "pass" or "fail".
pub fn result_to_pass_fail(result: &VerificationResult) -> &'static str {
    if result.passed {
        "pass"
    } else {
        "fail"
    }
}

/// One line per result, for feedback prompts and logs.
pub fn format_summary(results: &[VerificationResult]) -> String {
    results
        .iter()
        .map(|r| {
            let extra = if r.timed_out {
                " (timed out)".to_string()
            } else {
                match r.exit_code {
                    Some(code) if !r.passed => format!(" (exit {code})"),
                    _ => String::new(),
                }
            };
            format!("{}: {}{}", r.check_id, result_to_pass_fail(r), extra)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
