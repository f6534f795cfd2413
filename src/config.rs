use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::{clog_debug, Error, Result};

/// On-disk settings, loaded from `~/.conductor/conductor.toml`.
///
/// Every field has a usable default so a missing file means a working
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Maximum number of tasks being worked on at once.
    pub max_concurrent_tasks: usize,
    /// Maximum number of in-flight collaborator invocations (edits + reviews).
    pub max_concurrent_invocations: usize,
    /// Iteration cap for each task's implement-verify loop.
    pub max_iterations: u32,
    /// Scheduler tick interval in milliseconds.
    pub tick_interval_ms: u64,
    /// Override for the agent command (defaults to `claude` on PATH).
    pub command: Option<String>,
    /// Override for the worktrees directory (defaults to `~/.conductor/worktrees`).
    pub worktree_dir: Option<String>,
    /// Verification check settings.
    pub verification: VerificationSettings,
}

/// Verification section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerificationSettings {
    /// Run the build check (hard failure stops the sequence).
    pub build: bool,
    /// Run the lint check (soft failure, sequence continues).
    pub lint: bool,
    /// Run the test check. Off by default.
    pub test: bool,
    pub build_command: Option<String>,
    pub lint_command: Option<String>,
    pub test_command: Option<String>,
    /// Per-check timeout in seconds.
    pub check_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_concurrent_invocations: 4,
            max_iterations: 20,
            tick_interval_ms: 1000,
            command: None,
            worktree_dir: None,
            verification: VerificationSettings::default(),
        }
    }
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            build: true,
            lint: true,
            test: false,
            build_command: None,
            lint_command: None,
            test_command: None,
            check_timeout_secs: 300,
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Root directory for persisted feature state.
    pub fn features_dir() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("features"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::conductor_dir()?.join("worktrees")),
        }
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        clog_debug!(
            "Config loaded: max_tasks={} max_invocations={} max_iterations={}",
            config.max_concurrent_tasks,
            config.max_concurrent_invocations,
            config.max_iterations
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::conductor_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = Self::conductor_dir()?;
        let worktrees = self.worktrees_dir()?;
        let features = Self::features_dir()?;
        for d in [&dir, &worktrees, &features] {
            if !d.exists() {
                clog_debug!("Creating directory: {}", d.display());
                fs::create_dir_all(d)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
