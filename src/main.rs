mod cli;
mod client;
mod config;
mod ipc;
mod pty;
mod server;
mod spawner;

use std::sync::Mutex;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;
    cli::run(cli).await
}

/// Logs go to stderr: stdout carries the remote terminal in `connect`. The
/// spawner also appends to its log file.
fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose {
        "debug"
    } else if matches!(cli.command, Commands::Connect { .. }) {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::from_default_env().add_directive(format!("termbridge={}", level).parse()?);

    if let Commands::Spawner { .. } = cli.command {
        config::ensure_dirs()?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(config::spawner_log_path()?)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::io::stderr.and(Mutex::new(file)))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}
