use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use conductor::agents::HeadlessAgent;
use conductor::clog;
use conductor::config::Config;
use conductor::core::feature::{Feature, FeatureId};
use conductor::core::graph::Graph;
use conductor::core::task::{Task, TaskStatus};
use conductor::orchestration::{
    InvocationLimiter, LoopConfig, Orchestrator, OrchestratorConfig, OrchestratorEvent,
    VerificationRunner,
};
use conductor::state::{GraphStore, JsonFileStore};
use conductor::workspace::GitWorkspace;
use conductor::{Error, Result};

/// Conductor - autonomous task orchestration over a dependency graph
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a feature's task graph until done
    Run {
        /// Feature identifier (also the persisted state directory name)
        feature: String,

        /// Plan file describing the tasks and their dependencies (JSON).
        /// Omit to resume a previously started feature.
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Repository to work in (defaults to the current directory)
        #[arg(long)]
        repo: Option<PathBuf>,
    },

    /// Show the persisted state of a feature
    Status {
        /// Feature identifier
        feature: String,
    },
}

/// On-disk plan format accepted by `conductor run --plan`.
#[derive(Debug, Deserialize)]
struct Plan {
    name: String,
    specification: String,
    tasks: Vec<PlanTask>,
}

#[derive(Debug, Deserialize)]
struct PlanTask {
    title: String,
    #[serde(default)]
    description: String,
    /// Indices into `tasks` this task depends on.
    #[serde(default)]
    depends_on: Vec<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    conductor::log::init(cli.debug);
    clog!("Conductor starting");

    match cli.command {
        Command::Run {
            feature,
            plan,
            repo,
        } => run_feature(feature, plan, repo),
        Command::Status { feature } => show_status(feature),
    }
}

fn run_feature(feature_id: String, plan: Option<PathBuf>, repo: Option<PathBuf>) -> Result<()> {
    let config = Config::load()?;
    config.ensure_dirs()?;

    let store = Arc::new(JsonFileStore::new(Config::features_dir()?));
    let feature_key = FeatureId::new(feature_id.clone());

    let (feature, graph) = match plan {
        Some(path) => {
            let plan = load_plan(&path)?;
            let graph = build_graph(&plan)?;
            let feature = Feature::new(feature_key.clone(), &plan.name, &plan.specification);
            (feature, graph)
        }
        None => {
            let feature = store.load_feature(&feature_key)?.ok_or_else(|| {
                Error::Validation(format!(
                    "no persisted state for feature '{feature_id}'; supply --plan to start it"
                ))
            })?;
            (feature, Graph::new())
        }
    };

    let repo_path = match repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let workspace = Arc::new(GitWorkspace::new(&repo_path, &config.worktrees_dir()?)?);

    let agent = HeadlessAgent::new(config.effective_command())?;
    let verifier = Arc::new(VerificationRunner::from_settings(&config.verification));
    let limiter = InvocationLimiter::new(config.max_concurrent_invocations);

    let orchestrator_config = OrchestratorConfig {
        max_concurrent_tasks: config.max_concurrent_tasks,
        tick_interval: Duration::from_millis(config.tick_interval_ms),
        loop_config: LoopConfig {
            max_iterations: config.max_iterations,
            ..LoopConfig::default()
        },
        ..OrchestratorConfig::default()
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                print_event(&event);
            }
        });

        let mut orchestrator = Orchestrator::new(
            feature,
            Arc::new(agent.clone()),
            Arc::new(agent),
            verifier,
            workspace,
            store,
            limiter,
            orchestrator_config,
        )
        .with_events(event_tx);

        orchestrator.initialize(graph)?;
        orchestrator.start()?;

        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\nInterrupted, stopping...");
                signal_cancel.cancel();
            }
        });

        let result = orchestrator.run(cancel).await;
        print_summary(&orchestrator);
        // dropping the orchestrator closes the event channel
        drop(orchestrator);
        let _ = printer.await;
        result
    })
}

fn show_status(feature_id: String) -> Result<()> {
    let store = JsonFileStore::new(Config::features_dir()?);
    let feature_key = FeatureId::new(feature_id.clone());

    let feature = store.load_feature(&feature_key)?.ok_or_else(|| {
        Error::Validation(format!("no persisted state for feature '{feature_id}'"))
    })?;
    let graph = store.load_graph(&feature_key)?.unwrap_or_default();

    println!("Feature: {} ({})", feature.name, feature.id);
    println!("Status:  {}", feature.status);
    println!("Tasks:   {}", graph.len());

    let counts = graph.status_counts();
    for status in TaskStatus::ALL {
        let count = counts.get(&status).copied().unwrap_or(0);
        if count > 0 {
            println!("  {status}: {count}");
        }
    }

    let failed: Vec<&Task> = graph
        .tasks()
        .filter(|t| t.status == TaskStatus::Failed)
        .collect();
    if !failed.is_empty() {
        println!();
        println!("Failed tasks:");
        for task in failed {
            println!(
                "  {} {} - {}",
                task.id.short(),
                task.title,
                task.last_error.as_deref().unwrap_or("no error recorded")
            );
        }
    }
    Ok(())
}

fn load_plan(path: &PathBuf) -> Result<Plan> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn build_graph(plan: &Plan) -> Result<Graph> {
    let mut graph = Graph::new();
    let ids: Vec<_> = plan
        .tasks
        .iter()
        .map(|t| graph.add_task(Task::new(&t.title, &t.description)))
        .collect();
    for (index, task) in plan.tasks.iter().enumerate() {
        for &dep in &task.depends_on {
            let from = *ids.get(dep).ok_or_else(|| {
                Error::Validation(format!(
                    "task '{}' depends on index {dep}, but the plan has {} tasks",
                    task.title,
                    plan.tasks.len()
                ))
            })?;
            graph.add_connection(from, ids[index])?;
        }
    }
    Ok(graph)
}

fn print_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::Started { feature_id } => {
            println!("Running feature '{feature_id}'");
        }
        OrchestratorEvent::TaskStarted { task_id } => {
            println!("  [{}] started", task_id.short());
        }
        OrchestratorEvent::TaskCompleted { task_id, commit } => match commit {
            Some(commit) => println!("  [{}] done ({})", task_id.short(), &commit[..8.min(commit.len())]),
            None => println!("  [{}] done", task_id.short()),
        },
        OrchestratorEvent::TaskFailed { task_id, error } => {
            println!("  [{}] \x1b[31mfailed\x1b[0m: {error}", task_id.short());
        }
        OrchestratorEvent::ReviewPassed { task_id } => {
            println!("  [{}] review passed", task_id.short());
        }
        OrchestratorEvent::ReviewFailed { task_id, .. } => {
            println!("  [{}] review requested changes", task_id.short());
        }
        OrchestratorEvent::FeatureStatusChanged { status } => {
            println!("Feature status: {status}");
        }
    }
}

fn print_summary(orchestrator: &Orchestrator) {
    let counts = orchestrator.graph().status_counts();
    let done = counts.get(&TaskStatus::Done).copied().unwrap_or(0);
    let failed = counts.get(&TaskStatus::Failed).copied().unwrap_or(0);
    let total = orchestrator.graph().len();

    println!();
    println!("Session finished: {done}/{total} tasks done, {failed} failed");
    println!("Feature status: {}", orchestrator.feature_status());
}
