use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;

use crate::config::ServerConfig;
use crate::ipc::{self, MessageCodec, ServerCommand, ServerEvent};

use super::session::SessionManager;

/// Serves the session RPC surface on one TCP port.
pub struct PtyServer {
    sessions: Arc<SessionManager>,
    config: ServerConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl PtyServer {
    pub fn new(sessions: Arc<SessionManager>, config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            sessions,
            config,
            shutdown_tx,
        }
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    /// Sending on this stops [`PtyServer::run`].
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept clients and sweep idle sessions until shutdown, then destroy
    /// every remaining session.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, idle_timeout = ?self.config.idle_timeout(), "Server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let idle_timeout = self.config.idle_timeout();

        loop {
            tokio::select! {
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, peer)) => {
                            tracing::info!(%peer, "Client connected");
                            let sessions = self.sessions.clone();
                            let mut shutdown_rx = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                tokio::select! {
                                    res = handle_client(stream, sessions) => {
                                        if let Err(e) = res {
                                            tracing::error!(%peer, error = %e, "Client handler error");
                                        }
                                    }
                                    _ = shutdown_rx.recv() => {}
                                }
                                tracing::info!(%peer, "Client disconnected");
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Accept error");
                        }
                    }
                }
                _ = sweep.tick() => {
                    let expired = self.sessions.sweep_idle(idle_timeout).await;
                    if !expired.is_empty() {
                        tracing::info!(count = expired.len(), "Reclaimed idle sessions");
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Received shutdown signal");
                    break;
                }
            }
        }

        let count = self.sessions.destroy_all().await;
        tracing::info!(sessions = count, "Server exited cleanly");
        Ok(())
    }
}

async fn handle_client(stream: TcpStream, sessions: Arc<SessionManager>) -> Result<()> {
    stream.set_nodelay(true).ok();
    let mut framed = Framed::new(stream, MessageCodec);

    if !ipc::server_handshake(&mut framed).await? {
        return Ok(());
    }

    // Subscribe before the first command so no output of a fresh session is missed
    let mut events = sessions.subscribe();

    loop {
        tokio::select! {
            msg = framed.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        let cmd: ServerCommand = match serde_json::from_slice(&msg) {
                            Ok(cmd) => cmd,
                            Err(e) => {
                                tracing::warn!(error = %e, "Unparseable command dropped");
                                continue;
                            }
                        };
                        if let Some(reply) = dispatch(&sessions, cmd).await {
                            ipc::send_json(&mut framed, &reply).await?;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Read error from client");
                        break;
                    }
                    None => break,
                }
            }
            event = events.recv() => {
                match event {
                    Some(event) => ipc::send_json(&mut framed, &event).await?,
                    None => break,
                }
            }
        }
    }

    Ok(())
}

/// Apply one command. Returns the reply for commands that carry a `seq`.
pub async fn dispatch(sessions: &Arc<SessionManager>, cmd: ServerCommand) -> Option<ServerEvent> {
    match cmd {
        ServerCommand::Spawn { seq, cols, rows } => Some(match sessions.spawn(cols, rows).await {
            Ok(id) => ServerEvent::Spawned {
                seq,
                id: Some(id),
                error: None,
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn PTY");
                ServerEvent::Spawned {
                    seq,
                    id: None,
                    error: Some(e.to_string()),
                }
            }
        }),
        ServerCommand::Data { id, data } => {
            sessions.write(&id, &data).await;
            None
        }
        ServerCommand::Resize { id, cols, rows } => {
            sessions.resize(&id, cols, rows).await;
            None
        }
        ServerCommand::Process { seq, id } => Some(ServerEvent::Process {
            seq,
            name: sessions.process_name(&id).await,
        }),
        ServerCommand::Ping { id } => {
            sessions.ping(&id).await;
            None
        }
        ServerCommand::Destroy { id } => {
            sessions.destroy(&id).await;
            None
        }
    }
}

/// Bind the server's listener on `bind:port`.
pub async fn bind(config: &ServerConfig, port: u16) -> Result<TcpListener> {
    TcpListener::bind((config.bind.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.bind, port))
}
