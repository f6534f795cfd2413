//! Headless agent executor.
//!
//! Runs the `claude` CLI in non-interactive mode (`-p` with JSON output),
//! parses the response envelope, and adapts it to the edit and review
//! collaborator contracts. Review verdicts are read from a leading
//! `APPROVE` or `REVISE` line in the reviewer's output.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::process::Command;

use crate::agents::{
    EditCollaborator, EditOutcome, EditRequest, ReviewCollaborator, ReviewOutcome, ReviewRequest,
};
use crate::error::{Error, Result};
use crate::{clog_debug, clog_warn};

/// Default timeout for one agent invocation (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// The result of one agent execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultType {
    Success { output: String },
    Error { message: String },
}

/// Parsed response from a headless execution.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    /// Session ID for potential continuation (if available).
    pub session_id: Option<String>,
    pub result: ResultType,
    /// Cost in USD (if available).
    pub cost_usd: Option<f64>,
    /// Duration in milliseconds (if available).
    pub duration_ms: Option<u64>,
    /// Number of turns (if available).
    pub num_turns: Option<u32>,
}

impl AgentResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.result, ResultType::Success { .. })
    }

    pub fn output(&self) -> Option<&str> {
        match &self.result {
            ResultType::Success { output } => Some(output),
            ResultType::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.result {
            ResultType::Success { .. } => None,
            ResultType::Error { message } => Some(message),
        }
    }
}

/// Internal struct for deserializing the JSON envelope.
#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    result: Option<String>,
    session_id: Option<String>,
    total_cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    num_turns: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

/// Headless agent runner implementing both collaborator traits.
#[derive(Debug, Clone)]
pub struct HeadlessAgent {
    binary: PathBuf,
    output_format: String,
    timeout: Duration,
}

impl HeadlessAgent {
    /// Locate the agent binary on PATH.
    pub fn new(command: &str) -> Result<Self> {
        let binary = which::which(command).map_err(|_| Error::AgentBinaryNotFound)?;
        Ok(Self {
            binary,
            output_format: "json".to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        })
    }

    /// Use a specific binary path (testing, non-standard installs).
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            output_format: "json".to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute a prompt in headless mode and parse the JSON envelope.
    pub async fn execute(&self, prompt: &str, cwd: &Path) -> Result<AgentResponse> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .arg("-p")
                .arg(prompt)
                .arg("--output-format")
                .arg(&self.output_format)
                .current_dir(cwd)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(Error::Io)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Ok(response) = Self::parse_json_response(&stdout) {
            return Ok(response);
        }

        if !output.status.success() {
            let message = if stderr.is_empty() {
                format!(
                    "agent exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Ok(AgentResponse {
                session_id: None,
                result: ResultType::Error { message },
                cost_usd: None,
                duration_ms: None,
                num_turns: None,
            });
        }

        // Non-JSON success output (shouldn't happen with --output-format json)
        Ok(AgentResponse {
            session_id: None,
            result: ResultType::Success {
                output: stdout.trim().to_string(),
            },
            cost_usd: None,
            duration_ms: None,
            num_turns: None,
        })
    }

    /// Parse the JSON envelope the CLI emits.
    pub fn parse_json_response(json_str: &str) -> Result<AgentResponse> {
        let raw: RawResponse = serde_json::from_str(json_str)?;

        let result = match raw.subtype.as_deref() {
            Some("success") => ResultType::Success {
                output: raw.result.unwrap_or_default(),
            },
            Some("error") => ResultType::Error {
                message: raw.error.or(raw.result).unwrap_or_default(),
            },
            _ => {
                if let Some(error) = raw.error {
                    ResultType::Error { message: error }
                } else if let Some(result) = raw.result {
                    ResultType::Success { output: result }
                } else {
                    ResultType::Error {
                        message: "unknown response format".to_string(),
                    }
                }
            }
        };

        Ok(AgentResponse {
            session_id: raw.session_id,
            result,
            cost_usd: raw.total_cost_usd,
            duration_ms: raw.duration_ms,
            num_turns: raw.num_turns,
        })
    }

    fn edit_prompt(request: &EditRequest) -> String {
        let mut prompt = format!(
            "You are implementing one task of a larger feature.\n\n\
             Feature goal:\n{}\n\n\
             Task: {}\n{}\n",
            request.feature_goal, request.task.title, request.task.description
        );
        if let Some(feedback) = &request.review_feedback {
            prompt.push_str(&format!("\nReviewer feedback to address:\n{feedback}\n"));
        }
        if let Some(checks) = &request.check_feedback {
            prompt.push_str(&format!("\nFailing checks from the last attempt:\n{checks}\n"));
        }
        prompt.push_str(
            "\nMake the changes in the current directory and commit them when done.",
        );
        prompt
    }

    fn review_prompt(request: &ReviewRequest) -> String {
        format!(
            "Review the work in the current directory for the task below.\n\n\
             Feature goal:\n{}\n\n\
             Task: {}\n{}\n\n\
             Reply with a first line of exactly APPROVE or REVISE, then your \
             reasoning. If you REVISE, state concretely what must change.",
            request.feature_goal, request.task.title, request.task.description
        )
    }

    /// Rough token estimate from output size, counted against loop budgets.
    fn estimate_tokens(response: &AgentResponse) -> u64 {
        let text_len = response.output().map(str::len).unwrap_or(0) as u64;
        (text_len / 4).max(response.num_turns.unwrap_or(1) as u64 * 500)
    }
}

impl EditCollaborator for HeadlessAgent {
    fn edit(&self, request: EditRequest) -> BoxFuture<'static, Result<EditOutcome>> {
        let agent = self.clone();
        Box::pin(async move {
            let prompt = Self::edit_prompt(&request);
            clog_debug!(
                "edit: task {} iteration {}",
                request.task.id.short(),
                request.iteration
            );
            let response = agent.execute(&prompt, &request.workspace.path).await?;
            let tokens_used = Self::estimate_tokens(&response);
            match response.result {
                ResultType::Success { output } => Ok(EditOutcome {
                    success: true,
                    summary: output,
                    tokens_used,
                    error: None,
                }),
                ResultType::Error { message } => {
                    clog_warn!("edit failed for {}: {}", request.task.id.short(), message);
                    Ok(EditOutcome {
                        success: false,
                        summary: String::new(),
                        tokens_used,
                        error: Some(message),
                    })
                }
            }
        })
    }
}

impl ReviewCollaborator for HeadlessAgent {
    fn review(&self, request: ReviewRequest) -> BoxFuture<'static, Result<ReviewOutcome>> {
        let agent = self.clone();
        Box::pin(async move {
            let prompt = Self::review_prompt(&request);
            clog_debug!("review: task {}", request.task.id.short());
            let response = agent.execute(&prompt, &request.workspace.path).await?;
            match response.result {
                ResultType::Success { output } => Ok(parse_verdict(&output)),
                ResultType::Error { message } => {
                    Err(Error::Validation(format!("review call failed: {message}")))
                }
            }
        })
    }
}

/// Read the APPROVE/REVISE verdict from the first non-empty line. Anything
/// else is treated as a revise with the whole output as feedback.
fn parse_verdict(output: &str) -> ReviewOutcome {
    let first = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    let passed = first.eq_ignore_ascii_case("APPROVE");
    let feedback = output
        .lines()
        .skip_while(|line| line.trim().is_empty())
        .skip(1)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    ReviewOutcome {
        passed,
        feedback: if feedback.is_empty() {
            output.trim().to_string()
        } else {
            feedback
        },
        commit: None,
    }
}
