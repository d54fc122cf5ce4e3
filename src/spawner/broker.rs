use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_util::codec::Framed;
use tokio_util::task::TaskTracker;

use crate::config::SpawnerConfig;
use crate::ipc::{
    self, BrokerCommand, BrokerResponse, MessageCodec, ERR_IDENTITY_FORBIDDEN,
    ERR_IDENTITY_UNKNOWN, ERR_INTERNAL, ERR_INVALID_COMMAND, ERR_PORTS_EXHAUSTED,
    ERR_SPAWN_FAILED,
};
use crate::pty::UserContext;

use super::instances::{ConnectionId, InstanceRegistry};
use super::launch::{Launch, ServerHandle};
use super::ports::PortPool;

pub type SharedRegistry<H> = Arc<Mutex<InstanceRegistry<H>>>;

/// Accepts control connections and launches one server per `spawn` request.
pub struct Broker<L: Launch> {
    registry: SharedRegistry<L::Handle>,
    launcher: Arc<L>,
    config: SpawnerConfig,
    shutdown_tx: broadcast::Sender<()>,
    terminations: TaskTracker,
}

impl<L: Launch> Broker<L> {
    pub fn new(launcher: L, config: SpawnerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let ports = PortPool::new(config.port_range_start, config.port_range_end);
        Self {
            registry: Arc::new(Mutex::new(InstanceRegistry::new(ports))),
            launcher: Arc::new(launcher),
            config,
            shutdown_tx,
            terminations: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> SharedRegistry<L::Handle> {
        self.registry.clone()
    }

    /// Sending on this stops [`Broker::run`].
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Serve control connections and sweep orphaned instances until shutdown,
    /// then kill every instance and drop every connection. Returns only once
    /// every server it ever terminated has been reaped.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(
            %addr,
            ports = %format!("{}-{}", self.config.port_range_start, self.config.port_range_end),
            "Spawner listening"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, peer)) => {
                            let conn = self.registry.lock().await.connect();
                            tracing::info!(%peer, %conn, "Control connection opened");
                            let registry = self.registry.clone();
                            let launcher = self.launcher.clone();
                            let terminations = self.terminations.clone();
                            let mut shutdown_rx = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                tokio::select! {
                                    res = handle_control(stream, conn, &registry, &launcher, &terminations) => {
                                        if let Err(e) = res {
                                            tracing::error!(%peer, %conn, error = %e, "Control handler error");
                                        }
                                    }
                                    _ = shutdown_rx.recv() => {}
                                }
                                registry.lock().await.disconnect(conn);
                                tracing::info!(%peer, %conn, "Control connection closed");
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Accept error");
                        }
                    }
                }
                _ = sweep.tick() => {
                    let reaped = self.registry.lock().await.sweep();
                    if !reaped.is_empty() {
                        tracing::info!(count = reaped.len(), "Reaped orphaned servers");
                    }
                    for (_, termination) in reaped {
                        self.terminations.spawn(termination);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Received shutdown signal");
                    break;
                }
            }
        }

        let pending = {
            let mut registry = self.registry.lock().await;
            registry.close();
            registry.kill_all()
        };
        let count = pending.len();
        for termination in pending {
            self.terminations.spawn(termination);
        }
        self.terminations.close();
        self.terminations.wait().await;
        tracing::info!(servers = count, "Spawner exited cleanly");
        Ok(())
    }
}

async fn handle_control<L: Launch>(
    stream: TcpStream,
    conn: ConnectionId,
    registry: &SharedRegistry<L::Handle>,
    launcher: &Arc<L>,
    terminations: &TaskTracker,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    let mut framed = Framed::new(stream, MessageCodec);

    if !ipc::server_handshake(&mut framed).await? {
        return Ok(());
    }

    while let Some(msg) = framed.next().await {
        let msg = msg.context("Read error")?;
        let resp = match serde_json::from_slice::<BrokerCommand>(&msg) {
            Ok(BrokerCommand::Spawn { identity }) => {
                spawn_instance(registry, launcher.as_ref(), conn, &identity).await
            }
            Ok(BrokerCommand::Kill { pid }) => {
                kill_instance(registry, terminations, conn, pid).await
            }
            Err(e) => {
                tracing::warn!(%conn, error = %e, "Invalid broker command");
                BrokerResponse::err(ERR_INVALID_COMMAND, e.to_string())
            }
        };
        ipc::send_json(&mut framed, &resp).await?;
    }

    Ok(())
}

/// Resolve `identity`, allocate a port and launch a server owned by `conn`.
pub async fn spawn_instance<L: Launch>(
    registry: &SharedRegistry<L::Handle>,
    launcher: &L,
    conn: ConnectionId,
    identity: &str,
) -> BrokerResponse {
    let user = match UserContext::resolve(identity) {
        Ok(Some(user)) => user,
        Ok(None) => {
            tracing::warn!(%conn, identity, "Unknown identity");
            return BrokerResponse::err(
                ERR_IDENTITY_UNKNOWN,
                format!("No such user: {}", identity),
            );
        }
        Err(e) => {
            tracing::error!(%conn, identity, error = %e, "User lookup failed");
            return BrokerResponse::err(ERR_INTERNAL, e.to_string());
        }
    };

    if !user.is_reachable_from_current() {
        tracing::warn!(%conn, identity, "Identity not permitted");
        return BrokerResponse::err(
            ERR_IDENTITY_FORBIDDEN,
            format!("Spawner may not start servers for {}", user.name),
        );
    }

    let mut registry = registry.lock().await;
    if registry.is_closed() {
        tracing::warn!(%conn, identity, "Spawn refused during shutdown");
        return BrokerResponse::err(ERR_SPAWN_FAILED, "Spawner is shutting down");
    }
    let Some(port) = registry.allocate_port() else {
        tracing::warn!(%conn, "Port range exhausted");
        return BrokerResponse::err(ERR_PORTS_EXHAUSTED, "No free port in range");
    };

    match launcher.launch(&user, port) {
        Ok(handle) => {
            let pid = registry.insert(conn, port, user.name.clone(), handle);
            tracing::info!(%conn, pid, port, user = %user.name, "Spawned server");
            BrokerResponse::spawned(pid, port)
        }
        Err(e) => {
            registry.release_port(port);
            tracing::error!(%conn, port, error = %e, "Failed to launch server");
            BrokerResponse::err(ERR_SPAWN_FAILED, format!("{:#}", e))
        }
    }
}

/// Kill a server owned by `conn`. Unknown pids, and pids owned by other
/// connections, are acknowledged without effect. The server is reaped on
/// `terminations`.
pub async fn kill_instance<H: ServerHandle>(
    registry: &SharedRegistry<H>,
    terminations: &TaskTracker,
    conn: ConnectionId,
    pid: u32,
) -> BrokerResponse {
    let mut registry = registry.lock().await;
    match registry.owner_of(pid) {
        Some(owner) if owner == conn => {
            if let Some(termination) = registry.kill(pid) {
                terminations.spawn(termination);
            }
        }
        Some(owner) => {
            tracing::warn!(%conn, %owner, pid, "Refusing to kill server owned by another connection");
        }
        None => {
            tracing::debug!(%conn, pid, "Kill for unknown pid");
        }
    }
    BrokerResponse::ok()
}
