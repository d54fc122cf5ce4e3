//! The per-user PTY server: owns shells on pseudo-terminals and serves the
//! session RPC surface on the port the spawner allocated.

mod rpc;
mod session;

pub use rpc::{bind, dispatch, PtyServer};
pub use session::{RemoveReason, Session, SessionManager};

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::signal::unix::{signal, SignalKind};

use crate::config::Settings;
use crate::pty::UserContext;

/// Entry point of `termbridge server <PORT> <UID>`.
pub async fn run_server(port: u16, uid: u32, settings: &Settings) -> Result<()> {
    let user = UserContext::from_uid(uid)?
        .with_context(|| format!("Unknown uid {}", uid))?
        .with_shell(settings.server.shell.as_deref());

    if !user.is_reachable_from_current() {
        bail!(
            "Refusing to serve uid {} ({}) from uid {}",
            uid,
            user.name,
            nix::unistd::geteuid()
        );
    }

    tracing::info!(port, uid, user = %user.name, shell = %user.shell.display(), "Starting server");

    let sessions = Arc::new(SessionManager::new(user, settings.server.term.clone()));
    let server = PtyServer::new(sessions, settings.server.clone());
    let listener = bind(&settings.server, port).await?;

    let shutdown = server.shutdown_handle();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
            _ = sigterm.recv() => tracing::info!("Terminated"),
            _ = sighup.recv() => tracing::info!("Hung up"),
        }
        let _ = shutdown.send(());
    });

    server.run(listener).await
}
