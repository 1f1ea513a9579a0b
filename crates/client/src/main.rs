//! termbridge-attach
//!
//! Attaches the local terminal to a shell served by a termbridge bridge.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use client::attach::{self, AttachOptions};
use client::{ControllerOptions, WritePolicy};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// termbridge-attach - use a remote shell from this terminal.
#[derive(Parser, Debug)]
#[command(name = "termbridge-attach")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Bridge URL
    #[arg(default_value = "ws://127.0.0.1:9000")]
    pub url: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Write logs to this file (the terminal itself is in raw mode)
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Queue keystrokes typed before the shell is ready instead of rejecting them
    #[arg(long)]
    pub queue_writes: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _guard = match cli.log_file {
        Some(ref path) => Some(init_tracing(cli.verbose, path)?),
        None => None,
    };

    let options = AttachOptions {
        url: cli.url.clone(),
        controller: ControllerOptions {
            write_policy: if cli.queue_writes {
                WritePolicy::QueueUntilReady
            } else {
                WritePolicy::Reject
            },
            ..Default::default()
        },
    };

    let detach = attach::run(options).await?;
    tracing::info!("Detached: {}", detach);
    eprintln!("\r\n[termbridge] {}", detach);
    Ok(())
}

/// Logs to `path` only.
fn init_tracing(verbose: bool, path: &Path) -> anyhow::Result<WorkerGuard> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}
