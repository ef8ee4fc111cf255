//! EngineHub
//!
//! HTTP service that runs chess engines as managed subprocesses.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::protocol::SessionSummary;
use daemon::{ApiClient, ApiServer, EngineService};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// EngineHub - chess engine sessions over HTTP.
#[derive(Parser, Debug)]
#[command(name = "enginehub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Service URL for client commands (defaults to the configured address)
    #[arg(long, global = true, value_name = "URL")]
    pub url: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the HTTP service
    Serve {
        /// Address to listen on (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Manage engine sessions on a running service
    #[command(subcommand)]
    Sessions(SessionsCommands),
}

/// Session management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List live sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start a new engine session
    Start {
        /// Engine executable (defaults to the configured engine)
        #[arg(long, short)]
        engine: Option<String>,
    },

    /// Send one command to a session and print the reply
    Send {
        /// Session ID
        session_id: String,

        /// Command line to send, e.g. "go depth 10"
        command: String,

        /// How long to wait for a reply, in milliseconds
        #[arg(long, short)]
        timeout_ms: Option<u64>,
    },

    /// Stop a session
    Stop {
        /// Session ID
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    init_tracing(cli.verbose, &config.daemon.log_level);
    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            run_server(config).await?;
        }
        Commands::Sessions(cmd) => {
            let url = cli
                .url
                .unwrap_or_else(|| format!("http://{}:{}", config.server.host, config.server.port));
            let client = ApiClient::new(url)?;
            run_sessions_command(&client, cmd).await?;
        }
    }

    Ok(())
}

/// Initialize tracing. `RUST_LOG` wins over `--verbose` and the config level.
fn init_tracing(verbose: bool, log_level: &str) {
    let default = if verbose { "debug" } else { log_level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run the service until SIGINT/SIGTERM, then stop every engine.
async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("EngineHub starting...");

    let service = EngineService::new(config)?;
    let server = ApiServer::bind(service.clone()).await?;
    let shutdown = CancellationToken::new();
    let mut server_task = tokio::spawn(server.serve(shutdown.clone()));

    tokio::select! {
        result = &mut server_task => {
            result.context("API server task failed")??;
            tracing::warn!("API server exited on its own");
        }
        signal = wait_for_shutdown_signal() => {
            signal?;
            tracing::info!("Received shutdown signal");
            shutdown.cancel();
            server_task.await.context("API server task failed")??;
        }
    }

    service.shutdown().await;
    tracing::info!("EngineHub stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl-C).
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}

async fn run_sessions_command(client: &ApiClient, cmd: SessionsCommands) -> anyhow::Result<()> {
    match cmd {
        SessionsCommands::List { json } => {
            let sessions = client
                .sessions()
                .await
                .with_context(|| format!("Failed to query sessions from {}", client.base_url()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions_table(&sessions);
            }
        }
        SessionsCommands::Start { engine } => {
            let response = client.initialize(engine).await?;
            println!("Session started: {}", response.session_id);
            println!("  Engine: {}", response.engine_path);
            if let Some(pid) = response.pid {
                println!("  PID:    {}", pid);
            }
        }
        SessionsCommands::Send {
            session_id,
            command,
            timeout_ms,
        } => {
            let response = client.command(&session_id, &command, timeout_ms).await?;
            println!("{}", response.response);
            tracing::debug!(outcome = ?response.outcome, "Command completed");
        }
        SessionsCommands::Stop { session_id } => {
            let response = client.cleanup(&session_id).await?;
            if response.removed {
                println!("Session {} stopped", session_id);
            } else {
                println!("Session {} was not running", session_id);
            }
        }
    }
    Ok(())
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    // Calculate column widths
    let id_width = sessions
        .iter()
        .map(|s| s.id.len())
        .max()
        .unwrap_or(8)
        .max(8);
    let engine_width = sessions
        .iter()
        .map(|s| s.engine_path.chars().count())
        .max()
        .unwrap_or(6)
        .clamp(6, 40);

    // Print header
    println!(
        "{:<id_width$}  {:<engine_width$}  {:>8}  {:>7}  {:>12}",
        "ID",
        "ENGINE",
        "PID",
        "LINES",
        "STARTED",
        id_width = id_width,
        engine_width = engine_width
    );
    println!("{}", "-".repeat(id_width + engine_width + 35));

    // Print rows
    for session in sessions {
        let pid = session
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<id_width$}  {:<engine_width$}  {:>8}  {:>7}  {:>12}",
            session.id,
            truncate_str(&session.engine_path, engine_width),
            pid,
            session.lines_received,
            format_relative_time(session.created_at),
            id_width = id_width,
            engine_width = engine_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(timestamp);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum length, keeping the end and adding "..." in front.
///
/// Engine paths differ in their last components, so those are kept.
fn truncate_str(s: &str, max_len: usize) -> String {
    let len = s.chars().count();
    if len <= max_len {
        s.to_string()
    } else {
        let keep = max_len.saturating_sub(3);
        let tail: String = s.chars().skip(len - keep).collect();
        format!("...{}", tail)
    }
}
