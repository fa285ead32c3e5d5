//! nav-uplink - navigation telemetry uplink agent
//!
//! # Usage
//!
//! ```bash
//! # Run with the default config search path
//! nav-uplink
//!
//! # Explicit config, info-level logs
//! nav-uplink --config ./config.toml --verbose start
//!
//! # Print a starter config
//! nav-uplink example-config > ~/.config/nav-uplink/config.toml
//! ```
//!
//! # Environment Variables
//!
//! - `NAV_UPLINK_CONFIG`: config file path
//! - `NAV_UPLINK_ACCESS_TOKEN`: device access token (overrides credentials.toml)
//! - `RUST_LOG`: log filter (overrides `--verbose` / `--debug`)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nav_uplink::acquisition::{AggregatorConfig, MessageSource, NavigationAggregator};
use nav_uplink::config::{self, AgentConfig};
use nav_uplink::identity::DeviceIdentity;
use nav_uplink::pipeline::IngestLoop;
use nav_uplink::storage::{DurableQueue, ProcessLock};
use nav_uplink::uplink::{ClientSettings, DeviceClient, GrpcUplink};

const EXAMPLE_CONFIG: &str = include_str!("../config_example.toml");

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "nav-uplink")]
#[command(about = "Streams fused GNSS/INS navigation data to a remote device service")]
#[command(version)]
struct CliArgs {
    /// Config file (default: $NAV_UPLINK_CONFIG, then the platform config dir)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at info level
    #[arg(short, long)]
    verbose: bool,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Run the agent (default)
    Start,
    /// Print the config and data directories
    Paths,
    /// Print an example configuration file
    ExampleConfig,
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    Ingest,
    BacklogMonitor,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::Ingest => write!(f, "Ingest"),
            TaskName::BacklogMonitor => write!(f, "BacklogMonitor"),
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!(task = %task_name, "Supervisor: task completed normally");
                    }
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "Supervisor: task failed");
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Supervisor: task panicked");
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {e}"));
                    }
                    None => {
                        // Sessions keep draining the backlog until shutdown
                        info!("Supervisor: all tasks completed, delivering backlog until shutdown");
                        cancel_token.cancelled().await;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Periodically log queue backlog and session states.
fn spawn_backlog_monitor(
    task_set: &mut JoinSet<Result<TaskName>>,
    client: Arc<DeviceClient>,
    period: Duration,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        interval.tick().await;

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => return Ok(TaskName::BacklogMonitor),
                _ = interval.tick() => {
                    let (state, event) = client.backlog();
                    info!(
                        state_ready = state.ready,
                        state_unacked = state.unacked,
                        event_ready = event.ready,
                        event_unacked = event.unacked,
                        sessions = ?client.session_states(),
                        "Uplink backlog"
                    );
                }
            }
        }
    });
}

// ============================================================================
// Agent
// ============================================================================

async fn run_agent(config_path: Option<PathBuf>) -> Result<()> {
    let (agent_config, loaded_from) = AgentConfig::load(config_path.as_deref())?;
    let data_dir = agent_config.data_dir()?;
    info!(
        config = %loaded_from.display(),
        data_dir = %data_dir.display(),
        server = %agent_config.server.uri(),
        "nav-uplink starting"
    );

    // Held until the queues are closed
    let process_lock = ProcessLock::acquire(&data_dir)?;

    let token = config::load_access_token(&data_dir)?;
    let identity = Arc::new(DeviceIdentity::from_access_token(&token).context("Invalid device access token")?);

    let queue_dir = data_dir.join("queues");
    let state_queue = Arc::new(
        DurableQueue::open(queue_dir.join("state"), agent_config.queue.state_options())
            .context("Failed to open state queue")?,
    );
    let event_queue = Arc::new(
        DurableQueue::open(queue_dir.join("event"), agent_config.queue.event_options())
            .context("Failed to open event queue")?,
    );

    let settings = ClientSettings::from_config(&agent_config);
    let uplink = Arc::new(
        GrpcUplink::new(&agent_config.server, Arc::clone(&identity), settings.connect_timeout)
            .context("Invalid device service endpoint")?,
    );
    let client = Arc::new(DeviceClient::new(identity, state_queue, event_queue, uplink, settings));

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown_token.cancel();
    });

    client.start(&cancel_token).await;

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    let supervised = spawn_ingest(&mut task_set, &agent_config, Arc::clone(&client), cancel_token.clone()).await;
    let result = match supervised {
        Ok(()) => {
            let report_secs = agent_config.uplink.backlog_report_secs;
            if report_secs > 0 {
                spawn_backlog_monitor(
                    &mut task_set,
                    Arc::clone(&client),
                    Duration::from_secs(report_secs),
                    cancel_token.clone(),
                );
            }
            run_supervisor(&mut task_set, cancel_token.clone()).await
        }
        Err(e) => Err(e),
    };

    cancel_token.cancel();
    while let Some(joined) = task_set.join_next().await {
        if let Ok(Err(e)) = joined {
            warn!(error = %e, "Task failed during shutdown");
        }
    }

    let stopped = client.stop(agent_config.uplink.stop_timeout()).await;
    drop(process_lock);

    result?;
    stopped.context("Uplink queue storage failed")?;
    info!("nav-uplink shutdown complete");
    Ok(())
}

async fn spawn_ingest(
    task_set: &mut JoinSet<Result<TaskName>>,
    agent_config: &AgentConfig,
    client: Arc<DeviceClient>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let location = agent_config.location.clone();
    let driver = location
        .driver
        .clone()
        .context("No receiver driver configured ([location.driver])")?;
    let mut source = MessageSource::open(&driver, location.format)
        .await
        .with_context(|| format!("Failed to open receiver driver {driver}"))?;

    let aggregator = NavigationAggregator::new(AggregatorConfig {
        orientation: location.orientation,
        gps_time: location.require_gps_time,
    });

    task_set.spawn(async move {
        let stats = IngestLoop::new(aggregator, client, &location, cancel_token)
            .run(&mut source)
            .await?;
        info!(forwarded = stats.forwarded, "Receiver input finished; queued records keep streaming");
        Ok(TaskName::Ingest)
    });
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn init_logging(args: &CliArgs) {
    let level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();
}

fn print_paths() {
    let show = |p: Option<PathBuf>| p.map_or_else(|| "<unavailable>".to_string(), |p| p.display().to_string());
    println!("config dir: {}", show(config::config_dir()));
    println!("data dir:   {}", show(config::data_dir()));
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging(&args);

    let result = match args.command.unwrap_or(SubCommand::Start) {
        SubCommand::Paths => {
            print_paths();
            Ok(())
        }
        SubCommand::ExampleConfig => {
            print!("{EXAMPLE_CONFIG}");
            Ok(())
        }
        SubCommand::Start => run_agent(args.config).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
