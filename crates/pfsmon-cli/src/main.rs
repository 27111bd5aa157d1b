//! pfsmon CLI - parallel filesystem installer and monitoring agent manager
//!
//! Usage:
//!   pfsmon init [DIR]           Write default config, catalog and host list
//!   pfsmon plan                 Show the install plan without running it
//!   pfsmon install              Install the cluster and start agents
//!   pfsmon status               Show the latest run status
//!   pfsmon cancel               Cancel the running install
//!   pfsmon agent run            Run the metric collector on this node
//!   pfsmon agent supervise      Keep collector agents healthy until interrupted
//!   pfsmon agent stop           Stop collector agents

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pfsmon_agent::AgentManager;
use pfsmon_core::catalog::DEFAULT_CATALOG_TOML;
use pfsmon_core::fail_open::fail_open;
use pfsmon_core::registry::DEFAULT_HOSTS_TOML;
use pfsmon_core::{Catalog, HostRegistry, PfsError, PfsmonConfig, Role};
use pfsmon_metrics::{HttpSink, MetricPipeline, MetricSink};
use pfsmon_orchestrator::{Orchestrator, OrchestratorConfig, RunReport, StateStore};
use pfsmon_planning::{InstallPlan, PlanBuilder};
use pfsmon_remote::{GuardedExecutor, RemoteExecutor, SshExecutor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const STATUS_FILE: &str = "status.json";
const CANCEL_FILE: &str = "cancel";

#[derive(Parser)]
#[command(name = "pfsmon")]
#[command(author, version, about = "Parallel filesystem installer and monitoring agent manager")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file
    #[arg(short, long, default_value = "pfsmon.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Host list and catalog locations, plus an optional selection
#[derive(clap::Args, Clone)]
struct Inventory {
    /// Host list (TOML)
    #[arg(long, default_value = "hosts.toml")]
    hosts: PathBuf,

    /// Role catalog (TOML)
    #[arg(long, default_value = "catalog.toml")]
    catalog: PathBuf,

    /// Only these hosts (repeatable)
    #[arg(long = "host", value_name = "ADDRESS")]
    only_hosts: Vec<String>,

    /// Only hosts with these roles (repeatable)
    #[arg(long = "role", value_name = "ROLE")]
    only_roles: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write default pfsmon.toml, catalog.toml and hosts.toml
    Init {
        /// Target directory (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Show the install plan without touching any host
    Plan {
        #[command(flatten)]
        inventory: Inventory,
    },

    /// Install the cluster and start collector agents
    Install {
        #[command(flatten)]
        inventory: Inventory,

        /// Maximum steps executing at once
        #[arg(short, long)]
        workers: Option<usize>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,

        /// Keep supervising the started agents until interrupted
        #[arg(long)]
        supervise: bool,
    },

    /// Show the latest run status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Cancel the running install
    Cancel,

    /// Collector agent commands
    Agent {
        #[command(subcommand)]
        action: AgentCommands,
    },
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Run the metric collector on this node until interrupted
    Run {
        /// Host name attached to every sample
        #[arg(long)]
        host: String,

        /// Time-series sink URL (overrides config)
        #[arg(long)]
        sink: Option<String>,

        /// Sampling interval in seconds (overrides config)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Restart unhealthy collector agents on the selected hosts until interrupted
    Supervise {
        #[command(flatten)]
        inventory: Inventory,
    },

    /// Stop collector agents on the selected hosts
    Stop {
        #[command(flatten)]
        inventory: Inventory,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = PfsmonConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Init { path } => cmd_init(path).await,
        Commands::Plan { inventory } => cmd_plan(inventory),
        Commands::Install {
            inventory,
            workers,
            json,
            supervise,
        } => {
            let code = cmd_install(config, inventory, workers, json, supervise).await?;
            std::process::exit(code);
        }
        Commands::Status { json } => cmd_status(config, json).await,
        Commands::Cancel => cmd_cancel(config).await,
        Commands::Agent { action } => cmd_agent(config, action).await,
    }
}

async fn cmd_init(path: PathBuf) -> Result<()> {
    info!("Initializing pfsmon in {:?}", path);
    tokio::fs::create_dir_all(&path).await?;

    let config_path = path.join("pfsmon.toml");
    PfsmonConfig::write_default(&config_path)?;

    let catalog_path = path.join("catalog.toml");
    let hosts_path = path.join("hosts.toml");
    tokio::fs::write(&catalog_path, DEFAULT_CATALOG_TOML).await?;
    tokio::fs::write(&hosts_path, DEFAULT_HOSTS_TOML).await?;

    println!("Initialized pfsmon in {:?}", path);
    println!("Created:");
    println!("  pfsmon.toml");
    println!("  catalog.toml");
    println!("  hosts.toml");
    println!("\nNext steps:");
    println!("  1. List your hosts and their roles in hosts.toml");
    println!("  2. Run 'pfsmon plan' to review the install order");
    println!("  3. Run 'pfsmon install' and follow it with 'pfsmon status'");

    Ok(())
}

/// Load catalog and hosts, and build the plan for the selection
fn load_inventory(inventory: &Inventory) -> Result<(Catalog, HostRegistry, InstallPlan)> {
    let catalog = Catalog::load(&inventory.catalog).context("Failed to load catalog")?;
    let registry =
        HostRegistry::load(&inventory.hosts, &catalog).context("Failed to load host list")?;

    if inventory.only_hosts.is_empty() && inventory.only_roles.is_empty() {
        let plan = PlanBuilder::build(&registry, &catalog).context("Failed to build plan")?;
        return Ok((catalog, registry, plan));
    }

    let roles = inventory
        .only_roles
        .iter()
        .map(|r| r.parse::<Role>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;
    let selected = registry
        .select(&inventory.only_hosts, &roles)
        .context("Invalid host selection")?;
    let plan = PlanBuilder::build_selection(&selected, &registry, &catalog)
        .context("Failed to build plan")?;
    Ok((catalog, selected, plan))
}

fn cmd_plan(inventory: Inventory) -> Result<()> {
    let (_, _, plan) = load_inventory(&inventory)?;
    println!("{}", plan.render());
    Ok(())
}

fn build_executor(config: &PfsmonConfig, registry: &HostRegistry) -> Arc<dyn RemoteExecutor> {
    let ssh = SshExecutor::new(config.transport.clone())
        .with_logins(registry.hosts())
        .with_transfer_timeout(config.orchestrator.command_timeout());
    Arc::new(GuardedExecutor::from_config(ssh, &config.transport))
}

fn agent_manager(config: &PfsmonConfig, executor: Arc<dyn RemoteExecutor>) -> Arc<AgentManager> {
    Arc::new(AgentManager::new(
        executor,
        config.agent.clone(),
        config.pipeline.sink_url.clone(),
    ))
}

/// Run the agent supervisor until Ctrl-C
async fn supervise_until_interrupted(manager: Arc<AgentManager>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(Arc::clone(&manager).supervise(shutdown_rx));
    info!(
        "Supervising {} collector agents, press Ctrl-C to stop",
        manager.agents().await.len()
    );

    tokio::signal::ctrl_c().await?;
    shutdown_tx.send_replace(true);
    supervisor.await.context("Agent supervisor panicked")?;

    for agent in manager.agents().await {
        if agent.restarts > 0 {
            println!("{}: restarted {} times", agent.host, agent.restarts);
        }
    }
    Ok(())
}

async fn write_status(store: &StateStore, path: &Path) {
    let report = store.status().await;
    fail_open("write status snapshot", || async move {
        let json = serde_json::to_string_pretty(&report)?;
        tokio::fs::write(path, json).await?;
        Ok::<(), PfsError>(())
    })
    .await;
}

/// Run the install; returns the process exit code
async fn cmd_install(
    config: PfsmonConfig,
    inventory: Inventory,
    workers: Option<usize>,
    json: bool,
    supervise: bool,
) -> Result<i32> {
    // Config and plan errors abort here, before any host is touched
    let (catalog, registry, plan) = load_inventory(&inventory)?;

    let state_dir = config.orchestrator.state_dir.clone();
    tokio::fs::create_dir_all(&state_dir)
        .await
        .with_context(|| format!("Failed to create {}", state_dir.display()))?;
    let status_path = state_dir.join(STATUS_FILE);
    let cancel_path = state_dir.join(CANCEL_FILE);
    if cancel_path.exists() {
        tokio::fs::remove_file(&cancel_path).await?;
    }

    let mut orch_config =
        OrchestratorConfig::from_settings(&config.orchestrator, catalog.retry_policies().clone());
    if let Some(workers) = workers {
        orch_config = orch_config.with_workers(workers);
    }

    let executor = build_executor(&config, &registry);
    let mut orchestrator = Orchestrator::new(plan, &registry, Arc::clone(&executor), orch_config);
    let agents = config
        .orchestrator
        .start_agents
        .then(|| agent_manager(&config, Arc::clone(&executor)));
    if let Some(agents) = &agents {
        orchestrator = orchestrator.with_agent_manager(Arc::clone(agents));
    }

    let store = orchestrator.store();
    let cancel = orchestrator.cancel_handle();
    let mut run = tokio::spawn(orchestrator.run());
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    let report = loop {
        tokio::select! {
            result = &mut run => break result.context("Install run panicked")?,
            _ = tick.tick() => {
                write_status(&store, &status_path).await;
                if cancel_path.exists() && !cancel.is_cancelled() {
                    warn!("Cancel requested");
                    cancel.cancel();
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                warn!("Interrupted, cancelling install");
                cancel.cancel();
            }
        }
    };

    write_status(&store, &status_path).await;
    if cancel_path.exists() {
        fail_open("remove cancel marker", || async {
            tokio::fs::remove_file(&cancel_path).await?;
            Ok::<(), PfsError>(())
        })
        .await;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render());
    }

    match agents {
        Some(agents) if supervise && !report.cancelled => {
            supervise_until_interrupted(agents).await?
        }
        None if supervise => warn!("Agents are disabled in the config, nothing to supervise"),
        _ => {}
    }
    Ok(report.exit_code())
}

async fn cmd_status(config: PfsmonConfig, json: bool) -> Result<()> {
    let path = config.orchestrator.state_dir.join(STATUS_FILE);
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("No run status at {}", path.display()))?;
    let report: RunReport =
        serde_json::from_str(&content).context("Failed to parse run status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render());
    }
    Ok(())
}

async fn cmd_cancel(config: PfsmonConfig) -> Result<()> {
    let state_dir = &config.orchestrator.state_dir;
    tokio::fs::create_dir_all(state_dir).await?;
    tokio::fs::write(state_dir.join(CANCEL_FILE), b"cancel\n").await?;
    println!("Cancellation requested; steps not yet started will be skipped");
    Ok(())
}

async fn cmd_agent(config: PfsmonConfig, action: AgentCommands) -> Result<()> {
    match action {
        AgentCommands::Run {
            host,
            sink,
            interval,
        } => {
            let mut pipeline_config = config.pipeline.clone();
            if let Some(sink) = sink {
                pipeline_config.sink_url = sink;
            }
            if let Some(interval) = interval {
                pipeline_config.sample_interval_secs = interval.max(1);
            }

            let sink: Arc<dyn MetricSink> = Arc::new(
                HttpSink::new(pipeline_config.sink_url.clone()).context("Invalid sink URL")?,
            );
            let pipeline =
                MetricPipeline::new(host, sink, pipeline_config).with_default_samplers();

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let run = tokio::spawn(pipeline.run(shutdown_rx));

            tokio::signal::ctrl_c().await?;
            info!("Shutting down collector");
            shutdown_tx.send_replace(true);

            let summary = run.await.context("Collector panicked")?;
            println!(
                "Collector stopped: {} sampled, {} flushed, {} dropped, {} unsent",
                summary.sampled, summary.flushed, summary.dropped, summary.pending
            );
            Ok(())
        }

        AgentCommands::Supervise { inventory } => {
            let (_, registry, _) = load_inventory(&inventory)?;
            let manager = agent_manager(&config, build_executor(&config, &registry));
            for host in registry.hosts() {
                manager.adopt(&host.address).await;
            }
            supervise_until_interrupted(manager).await
        }

        AgentCommands::Stop { inventory } => {
            let (_, registry, _) = load_inventory(&inventory)?;
            let manager = agent_manager(&config, build_executor(&config, &registry));
            for host in registry.hosts() {
                manager.adopt(&host.address).await;
            }

            let stopped = manager.stop_all().await;
            println!("Stopped {} of {} collector agents", stopped, registry.len());
            Ok(())
        }
    }
}
