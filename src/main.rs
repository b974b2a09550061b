use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use kiln::config::Config;
use kiln::core::{DependencyGraph, Task};
use kiln::manifest;
use kiln::orchestration::{
    format_duration, BuildResult, CodeGenerator, CommandGenerator, CommandVerifier, EventKind,
    LocalSandbox, NoopVerifier, Orchestrator, Verifier,
};
use kiln::{Error, Result};

/// Kiln - dependency-aware parallel build scheduler
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    KILN_DEBUG=1    Enable debug logging (alternative to --debug)\n    RUST_LOG        Override the log filter")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.kiln/kiln.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a task manifest for duplicate ids, dangling references and cycles
    Validate {
        /// Task manifest (.json or .toml)
        manifest: PathBuf,
    },

    /// Show execution phases and the critical path
    Plan {
        /// Task manifest (.json or .toml)
        manifest: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute every task in a manifest
    Run {
        /// Task manifest (.json or .toml)
        manifest: PathBuf,

        /// Number of workers (overrides config)
        #[arg(short = 'w', long)]
        workers: Option<usize>,

        /// Attempts per task before it fails (overrides config)
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Generator command run once per task attempt (overrides config)
        #[arg(long)]
        generator: Option<String>,

        /// Verification command, touched files are appended (overrides config)
        #[arg(long)]
        verify: Option<String>,

        /// Directory tasks run in (overrides config)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Print the build result as JSON instead of progress lines
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = kiln::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Validate { manifest } => run_validate(&manifest).map(|_| ExitCode::SUCCESS),
        Command::Plan { manifest, json } => run_plan(&manifest, json).map(|_| ExitCode::SUCCESS),
        Command::Run {
            manifest,
            workers,
            max_attempts,
            generator,
            verify,
            root,
            json,
        } => {
            let mut config = Config::load()?;
            if let Some(workers) = workers {
                config.queue.workers = workers;
            }
            if let Some(max_attempts) = max_attempts {
                config.queue.max_attempts = max_attempts;
            }
            if generator.is_some() {
                config.commands.generator = generator;
            }
            if verify.is_some() {
                config.commands.verify = verify;
            }
            if let Some(root) = root {
                config.commands.sandbox_root = Some(root.to_string_lossy().into_owned());
            }
            let success = run_build(&manifest, config, json)?;
            Ok(if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn load_graph(path: &Path, max_attempts: u32) -> Result<DependencyGraph> {
    let specs = manifest::load(path)?;
    let mut graph = DependencyGraph::new();
    graph.add_tasks(specs.into_iter().map(|s| Task::from_spec(s, max_attempts)))?;
    Ok(graph)
}

fn run_validate(path: &Path) -> Result<()> {
    let config = Config::load()?;
    let mut graph = load_graph(path, config.queue.max_attempts)?;
    let report = graph.validate();

    if report.valid {
        println!("{}: {} tasks, valid", path.display(), graph.task_count());
        return Ok(());
    }

    println!("{}: {} tasks, invalid", path.display(), graph.task_count());
    for issue in &report.issues {
        println!("  - {}", issue);
    }
    report.into_result()
}

fn run_plan(path: &Path, json: bool) -> Result<()> {
    let config = Config::load()?;
    let graph = load_graph(path, config.queue.max_attempts)?;
    let plan = graph.execution_plan()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    for phase in &plan.phases {
        println!(
            "{}  [{} tasks, ~{}]",
            phase.name,
            phase.tasks.len(),
            format_duration(Duration::from_millis(phase.estimated_duration_ms))
        );
        for id in &phase.tasks {
            println!("    {}", id);
        }
    }
    let chain: Vec<&str> = plan.critical_path.iter().map(|id| id.as_str()).collect();
    println!();
    println!(
        "Critical path ({}): {}",
        format_duration(Duration::from_millis(plan.critical_path_duration_ms)),
        chain.join(" -> ")
    );
    Ok(())
}

/// Run the build and report whether it succeeded.
fn run_build(path: &Path, config: Config, json: bool) -> Result<bool> {
    let specs = manifest::load(path)?;
    let generator_command = config.commands.generator.clone().ok_or_else(|| {
        Error::Validation(
            "no generator command: pass --generator or set [commands] generator in ~/.kiln/kiln.toml"
                .to_string(),
        )
    })?;
    let root = config.sandbox_root();

    let generator: Arc<dyn CodeGenerator> = Arc::new(CommandGenerator::new(
        generator_command,
        root.clone(),
    ));
    let verifier: Arc<dyn Verifier> = match &config.commands.verify {
        Some(command) => Arc::new(CommandVerifier::new(command.clone(), root.clone())),
        None => Arc::new(NoopVerifier),
    };
    let sandbox = Arc::new(LocalSandbox::new(root));

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let orchestrator = Arc::new(Orchestrator::new(
            config.orchestrator_config(),
            generator,
            verifier,
            sandbox,
        ));
        orchestrator.add_tasks(specs).await?;

        let printer = (!json).then(|| tokio::spawn(print_events(orchestrator.clone())));
        let interrupt = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    orchestrator.cancel();
                }
            })
        };

        let result = orchestrator.orchestrate().await;
        interrupt.abort();
        if let Some(printer) = printer {
            let _ = tokio::time::timeout(Duration::from_millis(500), printer).await;
        }
        result
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }
    Ok(result.is_success())
}

async fn print_events(orchestrator: Arc<Orchestrator>) {
    let mut events = orchestrator.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        match &event.kind {
            EventKind::TaskStarted { task_id, worker, attempt } => {
                println!("  [{}] {} (attempt {})", worker, task_id, attempt)
            }
            EventKind::TaskCompleted { task_id, worker, .. } => {
                println!("  [{}] {} done", worker, task_id)
            }
            EventKind::TaskFailed { task_id, error, will_retry, .. } => {
                let suffix = if *will_retry { ", retrying" } else { "" };
                println!("  {} failed: {}{}", task_id, error, suffix)
            }
            EventKind::TaskBlocked { task_id, reason } => {
                println!("  {} blocked: {}", task_id, reason)
            }
            EventKind::TaskTimeout { task_id, worker } => {
                println!("  [{}] {} timed out", worker, task_id)
            }
            EventKind::PhaseStarted { name, .. } => println!("{}", name),
            EventKind::Completed { .. } | EventKind::Failed { .. } | EventKind::Cancelled => break,
            _ => {}
        }
    }
}

fn print_summary(result: &BuildResult) {
    println!();
    println!("  Build:       {}", result.build_id.short());
    println!("  Status:      {}", result.status);
    println!(
        "  Tasks:       {} completed, {} failed, {} blocked",
        result.tasks_completed,
        result.tasks_failed,
        result.blocked.len()
    );
    println!("  Steals:      {}", result.steal_count);
    println!("  Duration:    {}", result.duration_formatted);
    println!("  Score:       {:.0}%", result.score);

    if !result.failed.is_empty() {
        println!();
        println!("Failed:");
        for failure in &result.failed {
            println!(
                "  {} after {} attempts: {}",
                failure.id, failure.attempts, failure.error
            );
        }
    }
    if !result.blocked.is_empty() {
        println!();
        println!("Blocked:");
        for blocked in &result.blocked {
            println!("  {}: {}", blocked.id, blocked.reason);
        }
    }
}
