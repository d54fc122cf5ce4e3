use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::ipc::{ServerCommand, SessionId, NULL_PROCESS};

use super::connector::Connector;
use super::error::BridgeError;
use super::link::{ControlLink, DataLink};
use super::registry::Routed;

/// Lifecycle of a bridge.
///
/// `Idle -> Negotiating -> SocketOpen -> Active -> Destroyed`. A failed
/// negotiation falls back to `Idle`; `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    /// Waiting for the spawner to launch a server.
    Negotiating,
    /// Data socket open, waiting for the server to open a PTY.
    SocketOpen,
    Active,
    Destroyed,
}

/// Notifications for the terminal UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Connected(SessionId),
    Data(Bytes),
    Title {
        process: String,
        cols: u16,
        rows: u16,
    },
    Destroyed,
}

struct Inner {
    state: BridgeState,
    id: Option<SessionId>,
    pid: Option<u32>,
    control: Option<Arc<ControlLink>>,
    data: Option<Arc<DataLink>>,
    size: (u16, u16),
    title: Option<(String, u16, u16)>,
    cancel: Option<oneshot::Sender<()>>,
}

/// Everything negotiation acquired, taken out of a bridge for release.
struct Held {
    id: Option<SessionId>,
    pid: Option<u32>,
    control: Option<Arc<ControlLink>>,
    data: Option<Arc<DataLink>>,
}

#[derive(Clone)]
struct Core {
    connector: Arc<Connector>,
    host: String,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<BridgeEvent>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    fn take_held(inner: &mut Inner) -> Held {
        inner.cancel.take();
        Held {
            id: inner.id.take(),
            pid: inner.pid.take(),
            control: inner.control.take(),
            data: inner.data.take(),
        }
    }

    /// Unroute the session, stop the server and give back the control link.
    fn release(&self, held: Held, notify_server: bool) {
        if let (Some(id), Some(data)) = (&held.id, &held.data) {
            self.connector.registry().unregister(&data.route(id.clone()));
            if notify_server {
                let _ = data.send(ServerCommand::Destroy { id: id.clone() });
            }
        }
        drop(held.data);

        let Some(control) = held.control else {
            return;
        };
        let connector = self.connector.clone();
        let host = self.host.clone();
        let pid = held.pid;
        let release = async move {
            if let Some(pid) = pid {
                if let Err(e) = control.kill(pid).await {
                    tracing::debug!(pid, error = %e, "Broker kill failed");
                }
            }
            drop(control);
            connector.release(&host).await;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release);
            }
            Err(_) => tracing::warn!(host = %self.host, "No runtime to release control link"),
        }
    }

    /// Move to `Destroyed` and release everything. Only the first call has
    /// any effect.
    fn teardown(&self, notify_server: bool) {
        let held = {
            let mut inner = self.lock();
            if inner.state == BridgeState::Destroyed {
                return;
            }
            inner.state = BridgeState::Destroyed;
            Self::take_held(&mut inner)
        };
        if let Some(id) = &held.id {
            tracing::info!(session = %id, host = %self.host, "Bridge destroyed");
        }
        self.release(held, notify_server);
        self.emit(BridgeEvent::Destroyed);
    }

    /// Undo a failed or abandoned negotiation and return to `Idle`.
    fn abort_negotiation(&self) {
        let held = {
            let mut inner = self.lock();
            if !matches!(
                inner.state,
                BridgeState::Negotiating | BridgeState::SocketOpen
            ) {
                return;
            }
            inner.state = BridgeState::Idle;
            Self::take_held(&mut inner)
        };
        self.release(held, true);
    }

    /// Emit a title when the process name or the size changed.
    fn update_title(&self, process: Option<String>) {
        let title = {
            let mut inner = self.lock();
            if inner.state != BridgeState::Active {
                return;
            }
            let process = match process.or_else(|| inner.title.as_ref().map(|t| t.0.clone())) {
                Some(process) => process,
                None => return,
            };
            let title = (process, inner.size.0, inner.size.1);
            if inner.title.as_ref() == Some(&title) {
                return;
            }
            inner.title = Some(title.clone());
            title
        };
        self.emit(BridgeEvent::Title {
            process: title.0,
            cols: title.1,
            rows: title.2,
        });
    }

    /// The data link and session id, when active.
    fn active(&self) -> Option<(Arc<DataLink>, SessionId)> {
        let inner = self.lock();
        if inner.state != BridgeState::Active {
            return None;
        }
        Some((inner.data.clone()?, inner.id.clone()?))
    }
}

/// One terminal window's remote PTY session.
///
/// The two-hop negotiation (spawner, then server) hides behind
/// [`Bridge::connect`]; afterwards the bridge forwards input and resizes,
/// keeps the session alive with pings, and polls the foreground process for
/// the window title. Dropping a bridge destroys it.
pub struct Bridge {
    core: Core,
    events: mpsc::UnboundedReceiver<BridgeEvent>,
}

impl Bridge {
    pub(super) fn new(connector: Arc<Connector>, host: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            core: Core {
                connector,
                host,
                inner: Arc::new(Mutex::new(Inner {
                    state: BridgeState::Idle,
                    id: None,
                    pid: None,
                    control: None,
                    data: None,
                    size: (crate::ipc::default_cols(), crate::ipc::default_rows()),
                    title: None,
                    cancel: None,
                })),
                events: tx,
            },
            events: rx,
        }
    }

    pub fn host(&self) -> &str {
        &self.core.host
    }

    pub fn state(&self) -> BridgeState {
        self.core.lock().state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.core.lock().id.clone()
    }

    /// Local terminal size, updated by every [`Bridge::resize`].
    pub fn size(&self) -> (u16, u16) {
        self.core.lock().size
    }

    /// Next event for the UI.
    pub async fn next_event(&mut self) -> Option<BridgeEvent> {
        self.events.recv().await
    }

    /// Negotiate a server and a PTY of `cols` x `rows`. Only valid while
    /// `Idle`; on failure the bridge is `Idle` again.
    pub async fn connect(&mut self, cols: u16, rows: u16) -> Result<SessionId, BridgeError> {
        {
            let mut inner = self.core.lock();
            if inner.state != BridgeState::Idle {
                return Err(BridgeError::InvalidState(inner.state));
            }
            inner.state = BridgeState::Negotiating;
            inner.size = (cols, rows);
        }

        // Also rolls back when this future is dropped mid-negotiation
        let _rollback = Rollback(&self.core);
        let result = self.negotiate(cols, rows).await;
        if let Err(e) = &result {
            tracing::warn!(host = %self.core.host, error = %e, "Negotiation failed");
        }
        result
    }

    async fn negotiate(&self, cols: u16, rows: u16) -> Result<SessionId, BridgeError> {
        let core = &self.core;
        let connector = core.connector.clone();

        let control = connector.acquire(&core.host).await?;
        core.lock().control = Some(control.clone());

        let (pid, port) = control.spawn(connector.identity()).await?;
        core.lock().pid = Some(pid);
        tracing::debug!(host = %core.host, pid, port, "Server launched");

        let (inbox, routed) = mpsc::unbounded_channel();
        let data = Arc::new(
            DataLink::connect(
                &core.host,
                port,
                connector.config().connect_timeout(),
                connector.registry(),
                inbox,
            )
            .await?,
        );
        {
            let mut inner = core.lock();
            inner.data = Some(data.clone());
            inner.state = BridgeState::SocketOpen;
        }

        let id = data.spawn(cols, rows).await?;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut inner = core.lock();
            inner.id = Some(id.clone());
            if inner.state != BridgeState::SocketOpen {
                return Err(BridgeError::InvalidState(inner.state));
            }
            inner.state = BridgeState::Active;
            inner.cancel = Some(cancel_tx);
        }
        tracing::info!(session = %id, host = %core.host, pid, port, "Bridge active");

        core.emit(BridgeEvent::Connected(id.clone()));
        tokio::spawn(run_session(
            core.clone(),
            data,
            id.clone(),
            routed,
            cancel_rx,
            connector.config().heartbeat(),
            connector.config().title_poll(),
        ));
        Ok(id)
    }

    /// Forward input to the PTY. No-op unless active.
    pub fn write(&self, data: impl Into<Bytes>) {
        if let Some((link, id)) = self.core.active() {
            let _ = link.send(ServerCommand::Data {
                id,
                data: data.into(),
            });
        }
    }

    /// Record the local terminal size and, when active, resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) {
        self.core.lock().size = (cols, rows);
        if let Some((link, id)) = self.core.active() {
            let _ = link.send(ServerCommand::Resize {
                id,
                cols: Some(cols),
                rows: Some(rows),
            });
            self.core.update_title(None);
        }
    }

    /// Tear the session down. Idempotent.
    pub fn destroy(&self) {
        self.core.teardown(true);
    }
}

/// Returns an unfinished negotiation to `Idle` on drop. A no-op once the
/// bridge is `Active`.
struct Rollback<'a>(&'a Core);

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        self.0.abort_negotiation();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.core.abort_negotiation();
        self.core.teardown(true);
    }
}

async fn run_session(
    core: Core,
    data: Arc<DataLink>,
    id: SessionId,
    mut routed: mpsc::UnboundedReceiver<Routed>,
    mut cancel: oneshot::Receiver<()>,
    heartbeat: Duration,
    title_poll: Duration,
) {
    let start = tokio::time::Instant::now();
    let mut heartbeat = tokio::time::interval_at(start + heartbeat, heartbeat);
    let mut title_poll = tokio::time::interval(title_poll);
    title_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut cancel => break,
            msg = routed.recv() => match msg {
                Some(Routed::Data(bytes)) => core.emit(BridgeEvent::Data(bytes)),
                Some(Routed::Kill) => {
                    tracing::info!(session = %id, "Server closed session");
                    core.teardown(false);
                    break;
                }
                Some(Routed::Disconnected) | None => {
                    tracing::info!(session = %id, "Data link closed");
                    core.teardown(false);
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if data.send(ServerCommand::Ping { id: id.clone() }).is_err() {
                    core.teardown(false);
                    break;
                }
            }
            _ = title_poll.tick() => {
                match data.process(&id).await {
                    Ok(name) if name == NULL_PROCESS => {
                        tracing::info!(session = %id, "Server no longer knows session");
                        core.teardown(false);
                        break;
                    }
                    Ok(name) => core.update_title(Some(name)),
                    Err(_) => {
                        core.teardown(false);
                        break;
                    }
                }
            }
        }
    }
}
