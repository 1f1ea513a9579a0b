//! termbridge
//!
//! Serves PTY-backed shells to remote terminal emulators over WebSocket.

use std::path::{Path, PathBuf};

use anyhow::Context;
use bridge::config::{default_config_path, Config};
use bridge::server::{BridgeEvent, BridgeServer};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// termbridge - remote terminal bridge.
#[derive(Parser, Debug)]
#[command(name = "termbridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start serving terminals
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,

        /// Shell to run for new sessions (overrides the config file)
        #[arg(long, value_name = "PATH")]
        shell: Option<String>,
    },

    /// Print the configuration as TOML
    Config {
        /// Print the built-in defaults instead of the effective configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    match cli.command {
        Commands::Config { default } => {
            let shown = if default { Config::default() } else { config };
            print!("{}", shown.to_toml()?);
            Ok(())
        }
        Commands::Serve { listen, shell } => {
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            if let Some(shell) = shell {
                config.session.default_shell = shell;
            }

            let level = if cli.verbose {
                "debug".to_string()
            } else {
                config.logging.level.to_lowercase()
            };
            let _guard = init_tracing(&level, config.logging.file.as_deref())?;

            tracing::info!("termbridge starting...");
            tracing::debug!("Using config file: {:?}", config_path);

            config.validate()?;
            run(config).await
        }
    }
}

/// Runs the server until SIGINT or SIGTERM.
async fn run(config: Config) -> anyhow::Result<()> {
    let mut server = BridgeServer::new(config);
    let mut events = server.subscribe();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BridgeEvent::StateChanged(state) => tracing::debug!("Server state: {:?}", state),
                BridgeEvent::Listening(addr) => {
                    tracing::info!("Accepting terminals at ws://{}", addr)
                }
                BridgeEvent::ClientConnected { connection_id } => {
                    tracing::debug!(connection_id = %connection_id, "Client connected")
                }
                BridgeEvent::ClientDisconnected {
                    connection_id,
                    reason,
                } => tracing::debug!(
                    connection_id = %connection_id,
                    reason = %reason,
                    "Client disconnected"
                ),
            }
        }
    });

    server
        .run_until(async {
            if let Err(e) = wait_for_shutdown_signal().await {
                tracing::error!("Failed to listen for shutdown signals: {}", e);
            }
        })
        .await
}

/// Initializes logging to stderr, and to `file` when given.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing(level: &str, file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

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

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C");
    Ok(())
}
