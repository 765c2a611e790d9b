//! Lockbroker CLI - session-based user and node locks

use anyhow::Context;
use clap::{Parser, Subcommand};
use lockbroker_core::client::{DEFAULT_URL, get_status};
use lockbroker_core::config::Config;
use lockbroker_core::domain::locking::{BrokerStatus, LockKind};
use lockbroker_core::server::LockServer;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lockbroker")]
#[command(author, version, about = "Session-based user and node lock broker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lock broker
    Serve {
        /// Address to listen on (overrides server.listen_addr)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Show locks and sessions of a running broker
    Status {
        /// Broker URL
        #[arg(short, long, default_value = DEFAULT_URL)]
        url: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Show config file path
    Path,
    /// Get a configuration value
    Get { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so `status --format json` stays parseable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lockbroker=info".parse()?)
                .add_directive("lockbroker_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { listen } => cmd_serve(cli.config.as_deref(), listen).await,
        Commands::Status { url } => cmd_status(&url, cli.format).await,
        Commands::Config { action } => cmd_config(cli.config.as_deref(), action, cli.format),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_serve(config_path: Option<&Path>, listen: Option<String>) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(listen) = listen {
        config.server.listen_addr = listen;
        config.validate()?;
    }

    let addr = config.server.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;

    if !config.alerts.enabled {
        warn!("Operator alerts are disabled; alerts will only be logged");
    }

    let server = LockServer::new(&config)?;
    let broker = server.broker().clone();

    let shutdown = broker.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            shutdown.cancel();
        }
    });

    server.run(listener).await?;

    if broker.has_failed() {
        anyhow::bail!("The lock broker stopped after an internal error");
    }
    Ok(())
}

async fn cmd_status(url: &str, format: OutputFormat) -> anyhow::Result<()> {
    let status = get_status(url).await.map_err(|e| {
        let hint = e.suggestion().map(|s| format!("\nHint: {}", s)).unwrap_or_default();
        anyhow::anyhow!("[{}] {}{}", e.code(), e, hint)
    })?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => print_status(&status),
    }
    Ok(())
}

fn print_status(status: &BrokerStatus) {
    println!("Locks:");
    let mut any_lock = false;
    for kind in LockKind::ALL {
        let Some(records) = status.locks.get(&kind) else {
            continue;
        };
        for (name, record) in records {
            any_lock = true;
            let holder = record.holder.as_deref().unwrap_or("-");
            if record.queue.is_empty() {
                println!("  {}:{}  holder {}", kind, name, holder);
            } else {
                println!("  {}:{}  holder {}  queue [{}]", kind, name, holder, record.queue.join(", "));
            }
        }
    }
    if !any_lock {
        println!("  (none)");
    }

    println!();
    println!("Sessions:");
    if status.sessions.is_empty() {
        println!("  (none)");
    }
    for (session_id, session) in &status.sessions {
        let gate = if session.gate_open { "runnable" } else { "blocked" };
        println!(
            "  {}  {}  held {}  needed {}",
            session_id, gate, session.held_locks, session.needed_locks
        );
    }

    if !status.lock_times.is_empty() {
        println!();
        println!("Held since:");
        for entry in &status.lock_times {
            println!("  {}:{}  {}", entry.kind, entry.name, entry.acquired_at.to_rfc3339());
        }
    }
}

fn cmd_config(config_path: Option<&Path>, action: ConfigAction, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                OutputFormat::Text => print!("{}", config.to_toml()?),
            }
        }
        ConfigAction::Path => {
            let path = match config_path {
                Some(path) => path.to_path_buf(),
                None => Config::config_path()?,
            };
            println!("{}", path.display());
        }
        ConfigAction::Get { key } => {
            let config = load_config(config_path)?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
    }
    Ok(())
}
