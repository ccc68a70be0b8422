mod dry_run;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weave_core::config::{ExecutionMode, WorkflowConfig};
use weave_core::env::load_env_file;
use weave_core::types::{RunId, RunStatus, UnitStatus};
use weave_engine::{open_store, GraphBuilder, LockManager, Run, Scheduler};
use weave_mcp::ProtocolClient;
use weave_tools::ToolBroker;

use crate::dry_run::DryRunRunner;

#[derive(Parser)]
#[command(name = "weave", version, about = "DAG workflow engine for agent pipelines")]
struct Cli {
    /// Path to the workflow file
    #[arg(short, long, default_value = "weave.toml", env = "WEAVE_WORKFLOW")]
    config: PathBuf,

    /// Explicit .env file (default: .agent/.env, then .env)
    #[arg(long)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Sequential,
    Parallel,
    Async,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Sequential => ExecutionMode::Sequential,
            ModeArg::Parallel => ExecutionMode::Parallel,
            ModeArg::Async => ExecutionMode::Async,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check the workflow graph for cycles and unknown dependencies
    Validate,
    /// Print the execution levels
    Plan,
    /// Execute the workflow with a runner that calls no model
    DryRun {
        /// Override the configured execution mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Skip starting remote tool providers
        #[arg(long)]
        no_tools: bool,
    },
    /// List persisted runs of this workflow, newest first
    Runs,
    /// Print a persisted run record as JSON
    Show {
        /// Run id
        run_id: String,
    },
    /// Inspect or remove this workflow's lock
    Unlock {
        /// Remove the lock even if its holder looks alive
        #[arg(long)]
        force: bool,
    },
    /// Start remote tool providers and list every tool they expose
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Some(path) = load_env_file(cli.env_file.as_deref())? {
        info!(path = %path.display(), "Loaded environment file");
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate => {
            let graph = GraphBuilder::from_config(&config).build()?;
            println!(
                "{}: {} units in {} levels",
                config.name,
                graph.len(),
                graph.levels().len()
            );
        }
        Commands::Plan => {
            let graph = GraphBuilder::from_config(&config).build()?;
            println!("Workflow: {} (mode: {:?})", config.name, config.runtime.mode);
            for (idx, level) in graph.level_names().iter().enumerate() {
                println!("  level {}: {}", idx, level.join(", "));
            }
        }
        Commands::DryRun { mode, no_tools } => {
            let mut config = config;
            if let Some(mode) = mode {
                config.runtime.mode = mode.into();
            }
            dry_run(&config, no_tools).await?;
        }
        Commands::Runs => {
            let store = open_store(&config.state)?;
            let runs = store.list_runs(&config.name)?;
            if runs.is_empty() {
                println!("No runs recorded for '{}'.", config.name);
            }
            for run in runs {
                println!(
                    "{}  {:<10} {}",
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.status.to_string(),
                    run.id
                );
            }
        }
        Commands::Show { run_id } => {
            let store = open_store(&config.state)?;
            let run = store.load_state(&RunId::from_string(&run_id))?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Commands::Unlock { force } => {
            let locks = LockManager::from_config(&config.state);
            match locks.inspect(&config.name)? {
                None => println!("'{}' is not locked.", config.name),
                Some(info) => {
                    println!("{}", info);
                    if info.stale || force {
                        locks.force_release(&config.name)?;
                        println!("Lock removed.");
                    } else {
                        println!("Holder looks alive; pass --force to remove anyway.");
                    }
                }
            }
        }
        Commands::Tools => {
            let client = Arc::new(ProtocolClient::default());
            let mut broker = ToolBroker::new(
                config.tools.on_duplicate,
                config.runtime.tool_timeout_duration(),
            );
            weave_mcp::connect_all(&client, &config.mcp, &mut broker).await?;
            for def in broker.definitions() {
                println!(
                    "{:<24} {:<12} {}",
                    def.name,
                    def.server.as_deref().unwrap_or("local"),
                    def.description
                );
            }
            client.shutdown_all().await;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<WorkflowConfig> {
    WorkflowConfig::load(path)
        .with_context(|| format!("failed to load workflow '{}'", path.display()))
}

async fn dry_run(config: &WorkflowConfig, no_tools: bool) -> anyhow::Result<()> {
    let client = Arc::new(ProtocolClient::default());
    let mut broker = ToolBroker::new(
        config.tools.on_duplicate,
        config.runtime.tool_timeout_duration(),
    );
    if !no_tools {
        let count = weave_mcp::connect_all(&client, &config.mcp, &mut broker).await?;
        info!(tools = count, "Remote tools registered");
    }

    let scheduler =
        Scheduler::from_config(config, Arc::new(DryRunRunner))?.with_broker(Arc::new(broker));

    let abort = scheduler.abort_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Interrupted, aborting run");
        abort.cancel();
    });

    let result = scheduler.run().await;
    client.shutdown_all().await;
    let run = result?;

    print_run(&run);
    if run.status != RunStatus::Succeeded {
        anyhow::bail!("run {} finished {}", run.id, run.status);
    }
    Ok(())
}

fn print_run(run: &Run) {
    println!("Run {} ({}): {}", run.id, run.workflow, run.status);
    for outcome in &run.outcomes {
        let marker = match outcome.status {
            UnitStatus::Succeeded => "ok",
            UnitStatus::Failed => "FAIL",
            UnitStatus::Skipped => "skip",
            UnitStatus::Pending | UnitStatus::Running => "?",
        };
        let detail = outcome
            .error
            .as_deref()
            .or(outcome.output.as_deref())
            .unwrap_or("");
        println!(
            "  [{:<4}] {:<20} {:>6}ms  {}",
            marker, outcome.unit, outcome.duration_ms, detail
        );
    }
}
