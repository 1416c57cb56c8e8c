//! `muster` binary: run the aggregator gateway, or inspect the registry
//! from the command line.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use muster::{Config, Gateway, RegistryStore, Startup};

#[derive(Parser)]
#[command(name = "muster", version, about = "Instance registry and aggregator gateway")]
struct Cli {
    /// Registry base directory (defaults to ~/.muster).
    #[arg(long, env = "MUSTER_BASE_DIR", global = true)]
    base_dir: Option<PathBuf>,

    /// Path to a TOML config file.
    #[arg(long, env = "MUSTER_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the aggregator gateway (the default).
    Serve {
        /// Preferred gateway port.
        #[arg(long, env = "MUSTER_PORT")]
        port: Option<u16>,
    },
    /// List registered instances.
    List,
    /// Print recent lifecycle events.
    Events {
        /// How many recent events to print.
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("muster=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.base_dir.is_some() {
        config.base_dir = cli.base_dir;
    }

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await
        }
        Command::List => list(config).await,
        Command::Events { limit } => events(config, limit).await,
    }
}

/// Run the gateway. If a live one already owns the registry, print its
/// endpoint and exit cleanly so callers can open it instead.
async fn serve(config: Config) -> anyhow::Result<()> {
    let gateway = Gateway::new(config)?;
    match gateway.start().await? {
        Startup::AlreadyRunning { endpoint } => {
            println!("gateway already running at http://{endpoint}");
            Ok(())
        }
        Startup::Running(running) => {
            println!("gateway listening at http://{}", running.endpoint());
            tokio::signal::ctrl_c().await?;
            running.shutdown().await?;
            Ok(())
        }
    }
}

async fn list(config: Config) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let instances = store.list().await?;
    if instances.is_empty() {
        println!("no registered instances");
        return Ok(());
    }
    for record in instances {
        println!(
            "{:<28} [{}] {} (last contact {})",
            record.label(),
            record.state,
            record.endpoint,
            record.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }
    Ok(())
}

async fn events(config: Config, limit: usize) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    for event in store.events(limit).await? {
        let detail = match (&event.project_name, &event.message) {
            (Some(project), _) => format!(" project={project}"),
            (None, Some(message)) => format!(" {message}"),
            (None, None) => String::new(),
        };
        println!(
            "{} {:<20} pid {}{}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.kind,
            event.pid,
            detail,
        );
    }
    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<RegistryStore> {
    Ok(RegistryStore::open(config.base_dir())?.with_lock_timeout(config.lock_timeout()))
}
