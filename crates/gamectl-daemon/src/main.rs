//! `gamectl`
//!
//! Drives the lifecycle core against the local container engine. Results
//! are printed as JSON on stdout; logs go to stderr.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use gamectl_core::config::{Config, EngineKind, load_config};
use gamectl_core::tracing_init::{default_filter, init_tracing};
use gamectl_daemon::engine::{ContainerEngine, DockerEngine, MemoryEngine};
use gamectl_daemon::lifecycle::{LifecycleManager, ManagerOptions, NewServer, SettingsUpdate};
use gamectl_daemon::logs::LogEvent;
use gamectl_daemon::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "gamectl")]
#[command(version, about = "GameControl - game server container lifecycle manager")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Settings file (defaults to the global settings.json if present)
    #[arg(long, global = true, env = "GAMECTL_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory for per-server data
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Database file path
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Container engine: "docker" or "memory" (dry run)
    #[arg(long, global = true)]
    engine: Option<EngineKind>,

    /// Docker socket path
    #[arg(long, global = true)]
    docker_socket: Option<String>,

    /// Game server image
    #[arg(long, global = true)]
    image: Option<String>,

    /// First port handed out to new servers
    #[arg(long, global = true)]
    base_port: Option<u16>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a server and launch its container
    Create(CreateArgs),
    /// List servers with live status and resource usage
    List,
    /// Show one server
    Show { id: String },
    /// Start a stopped server (relaunches a server whose launch failed)
    Start { id: String },
    /// Stop a running server
    Stop { id: String },
    /// Restart a server
    Restart { id: String },
    /// Delete a server, its container and its data
    Delete { id: String },
    /// Change settings; applied the next time the container is created
    Settings(SettingsArgs),
    /// Follow a server's logs until Ctrl+C
    Logs { id: String },
    /// Check that the container engine is reachable
    Health,
}

#[derive(Args, Debug)]
struct CreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    password: String,
    #[arg(long, default_value_t = 32)]
    max_players: u32,
    #[arg(long, default_value = "Palworld Server")]
    description: String,
    #[arg(long, default_value_t = 1.0)]
    exp_rate: f64,
    #[arg(long, default_value_t = 1.0)]
    capture_rate: f64,
    #[arg(long, default_value_t = 1.0)]
    spawn_rate: f64,
    /// Admin password; generated when omitted
    #[arg(long)]
    admin_secret: Option<String>,
}

#[derive(Args, Debug)]
struct SettingsArgs {
    id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    max_players: Option<u32>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    exp_rate: Option<f64>,
    #[arg(long)]
    capture_rate: Option<f64>,
    #[arg(long)]
    spawn_rate: Option<f64>,
    #[arg(long)]
    admin_secret: Option<String>,
}

impl From<CreateArgs> for NewServer {
    fn from(args: CreateArgs) -> Self {
        Self {
            name: args.name,
            password: args.password,
            max_players: args.max_players,
            description: args.description,
            exp_rate: args.exp_rate,
            capture_rate: args.capture_rate,
            spawn_rate: args.spawn_rate,
            admin_secret: args.admin_secret,
        }
    }
}

impl From<SettingsArgs> for SettingsUpdate {
    fn from(args: SettingsArgs) -> Self {
        Self {
            name: args.name,
            password: args.password,
            max_players: args.max_players,
            description: args.description,
            exp_rate: args.exp_rate,
            capture_rate: args.capture_rate,
            spawn_rate: args.spawn_rate,
            admin_secret: args.admin_secret,
        }
    }
}

/// Layer CLI flags over the file/env configuration.
fn resolve_config(args: &GlobalArgs) -> anyhow::Result<Config> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(dir) = &args.data_dir {
        config.daemon.data_dir = Some(dir.clone());
    }
    if let Some(path) = &args.db_path {
        config.daemon.database_path = Some(path.clone());
    }
    if let Some(level) = &args.log_level {
        config.daemon.log_level.clone_from(level);
    }
    if args.log_json {
        config.daemon.log_json = true;
    }
    if let Some(kind) = args.engine {
        config.engine.kind = kind;
    }
    if let Some(socket) = &args.docker_socket {
        config.engine.docker_socket = Some(socket.clone());
    }
    if let Some(image) = &args.image {
        config.engine.image.clone_from(image);
    }
    if let Some(port) = args.base_port {
        config.lifecycle.base_port = port;
    }
    config.validate()?;
    Ok(config)
}

fn build_engine(config: &Config) -> anyhow::Result<Arc<dyn ContainerEngine>> {
    Ok(match config.engine.kind {
        EngineKind::Docker => Arc::new(
            DockerEngine::connect(
                config.engine.docker_socket.as_deref(),
                Duration::from_secs(config.engine.request_timeout_secs),
            )
            .context("Failed to configure Docker client")?,
        ),
        EngineKind::Memory => {
            warn!("Using the in-memory engine; no containers will run");
            Arc::new(MemoryEngine::new())
        }
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    writeln!(io::stdout(), "{rendered}")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli.global)?;
    init_tracing(
        &default_filter(&config.daemon.log_level),
        config.daemon.log_json,
    );

    let data_dir = config.data_dir()?;
    let db_path = config.database_path()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        db = %db_path.display(),
        engine = ?config.engine.kind,
        "Starting gamectl"
    );

    let db = Database::open(&db_path).await?;
    let engine = build_engine(&config)?;
    let manager = LifecycleManager::new(
        db,
        &data_dir,
        engine,
        ManagerOptions::from_config(&config),
    );
    // The in-memory engine has no containers from earlier runs.
    if config.engine.kind == EngineKind::Docker {
        manager.recover().await?;
    }

    let result = run(&manager, cli.command).await;

    // Launch tasks die with the process; let them finish first.
    if manager.pending_launches() > 0 {
        info!("Waiting for launch to finish");
    }
    manager.wait_for_launches().await;
    result
}

async fn run(manager: &LifecycleManager, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Create(args) => print_json(&manager.create_server(args.into()).await?),
        Command::List => print_json(&manager.list_servers().await?),
        Command::Show { id } => print_json(&manager.get_server(&id).await?),
        Command::Start { id } => print_json(&manager.start_server(&id).await?),
        Command::Stop { id } => print_json(&manager.stop_server(&id).await?),
        Command::Restart { id } => print_json(&manager.restart_server(&id).await?),
        Command::Delete { id } => print_json(&manager.delete_server(&id).await?),
        Command::Settings(args) => {
            let id = args.id.clone();
            print_json(&manager.update_settings(&id, args.into()).await?)
        }
        Command::Logs { id } => follow_logs(manager, &id).await,
        Command::Health => print_json(&manager.health().await),
    }
}

async fn follow_logs(manager: &LifecycleManager, id: &str) -> anyhow::Result<()> {
    let mut logs = manager.stream_logs(id).await?;
    loop {
        tokio::select! {
            event = logs.recv() => {
                let Some(event) = event else { break };
                writeln!(io::stdout(), "{}", serde_json::to_string(&event)?)?;
                if let LogEvent::Error { message } = event {
                    anyhow::bail!("Log stream failed: {message}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, detaching from logs");
                break;
            }
        }
    }
    logs.close().await;
    Ok(())
}
