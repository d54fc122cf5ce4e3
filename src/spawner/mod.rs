//! The process broker: launches one PTY server per `spawn` request on a port
//! from the configured range, and reaps servers whose requester went away.

mod broker;
mod instances;
mod launch;
mod ports;

pub use broker::{kill_instance, spawn_instance, Broker, SharedRegistry};
pub use instances::{ConnectionId, Instance, InstanceRegistry};
pub use launch::{Launch, ProcessLauncher, ServerHandle, ServerProcess, Termination, KILL_GRACE};
pub use ports::PortPool;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::{self, SpawnerConfig};

/// Entry point of `termbridge spawner`.
pub async fn run_spawner(
    spawner: SpawnerConfig,
    config_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    config::ensure_dirs()?;

    let launcher = ProcessLauncher::current(config_path, verbose)?;
    let listener = TcpListener::bind((spawner.bind.as_str(), spawner.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", spawner.bind, spawner.port))?;

    let pid_path = config::spawner_pid_path()?;
    std::fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("Failed to write {}", pid_path.display()))?;

    let broker = Broker::new(launcher, spawner);
    let shutdown = broker.shutdown_handle();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
            _ = sigterm.recv() => tracing::info!("Terminated"),
        }
        let _ = shutdown.send(());
    });

    let result = broker.run(listener).await;
    let _ = std::fs::remove_file(&pid_path);
    result
}
