use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::ipc::{
    self, BrokerCommand, BrokerResponse, MessageCodec, ServerCommand, ServerEvent, SessionId,
    ERR_SPAWN_FAILED,
};

use super::error::BridgeError;
use super::registry::{Inbox, LinkId, Route, Routed, SessionRegistry};

const CONNECT_RETRY: Duration = Duration::from_millis(50);

async fn connect_with_retry(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, BridgeError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) if tokio::time::Instant::now() >= deadline => {
                return Err(BridgeError::Negotiation(format!(
                    "{}:{} unreachable: {}",
                    host, port, e
                )));
            }
            Err(_) => tokio::time::sleep(CONNECT_RETRY).await,
        }
    }
}

// ── Control link (client ↔ spawner) ──────────────────────────

/// Request/response channel to the spawner of one host. Requests are
/// serialised: the socket carries at most one negotiation at a time.
pub struct ControlLink {
    host: String,
    framed: Arc<tokio::sync::Mutex<Framed<TcpStream, MessageCodec>>>,
    closed: Arc<AtomicBool>,
}

impl ControlLink {
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, BridgeError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(BridgeError::Negotiation(format!(
                    "spawner at {}:{} unreachable: {}",
                    host, port, e
                )))
            }
            Err(_) => {
                return Err(BridgeError::Negotiation(format!(
                    "timed out connecting to spawner at {}:{}",
                    host, port
                )))
            }
        };
        stream.set_nodelay(true).ok();
        let mut framed = Framed::new(stream, MessageCodec);
        ipc::client_handshake(&mut framed)
            .await
            .map_err(BridgeError::negotiation)?;

        tracing::debug!(host, port, "Control link open");
        Ok(Self {
            host: host.to_string(),
            framed: Arc::new(tokio::sync::Mutex::new(framed)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// One round trip. The exchange runs on its own task holding the socket,
    /// so a caller that gives up early never leaves a reply on the wire for
    /// the next request.
    async fn request(&self, cmd: BrokerCommand) -> Result<BrokerResponse, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::LinkClosed);
        }
        let mut framed = self.framed.clone().lock_owned().await;
        let closed = self.closed.clone();
        let exchange = tokio::spawn(async move {
            if closed.load(Ordering::SeqCst) {
                return None;
            }
            let result: anyhow::Result<Option<BrokerResponse>> = async {
                ipc::send_json(&mut *framed, &cmd).await?;
                ipc::recv_json::<BrokerResponse, _>(&mut *framed).await
            }
            .await;
            match result {
                Ok(Some(resp)) => Some(resp),
                Ok(None) | Err(_) => {
                    closed.store(true, Ordering::SeqCst);
                    None
                }
            }
        });
        match exchange.await {
            Ok(Some(resp)) => Ok(resp),
            Ok(None) | Err(_) => Err(BridgeError::LinkClosed),
        }
    }

    /// Ask the spawner for a server running as `identity`. Returns `(pid, port)`.
    pub async fn spawn(&self, identity: &str) -> Result<(u32, u16), BridgeError> {
        let resp = self
            .request(BrokerCommand::Spawn {
                identity: identity.to_string(),
            })
            .await?;
        if !resp.ok {
            return Err(rejected(resp));
        }
        match (resp.pid, resp.port) {
            (Some(pid), Some(port)) => Ok((pid, port)),
            _ => Err(BridgeError::Negotiation(
                "spawn reply without pid or port".into(),
            )),
        }
    }

    pub async fn kill(&self, pid: u32) -> Result<(), BridgeError> {
        let resp = self.request(BrokerCommand::Kill { pid }).await?;
        if resp.ok {
            Ok(())
        } else {
            Err(rejected(resp))
        }
    }
}

fn rejected(resp: BrokerResponse) -> BridgeError {
    BridgeError::Rejected {
        code: resp.error.unwrap_or_default(),
        message: resp.message.unwrap_or_default(),
    }
}

// ── Data link (client ↔ server) ──────────────────────────────

enum Pending {
    Spawn(oneshot::Sender<Result<SessionId, String>>),
    Process(oneshot::Sender<String>),
}

/// In-flight requests by `seq`. `None` once the link is closed.
type PendingMap = Arc<Mutex<Option<HashMap<u64, Pending>>>>;

/// One bridge's dedicated socket to a server.
///
/// Session events are routed through the shared [`SessionRegistry`], scoped
/// to this link; replies complete the matching in-flight request. A session
/// id returned by `spawn` is registered to the link's inbox before the caller
/// sees it, so no output of the new session can be dropped.
pub struct DataLink {
    link: LinkId,
    writer: mpsc::UnboundedSender<ServerCommand>,
    pending: PendingMap,
    next_seq: AtomicU64,
    reader: JoinHandle<()>,
}

impl DataLink {
    /// Connect to the server at `host:port`, retrying until `timeout` while
    /// it starts listening.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        registry: Arc<SessionRegistry>,
        inbox: Inbox,
    ) -> Result<Self, BridgeError> {
        let stream = connect_with_retry(host, port, timeout).await?;
        let mut framed = Framed::new(stream, MessageCodec);
        ipc::client_handshake(&mut framed)
            .await
            .map_err(BridgeError::negotiation)?;
        tracing::debug!(host, port, "Data link open");

        let (sink, stream) = framed.split();
        let (writer, commands) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(Some(HashMap::new())));
        let link = registry.open_link();

        tokio::spawn(write_loop(sink, commands));
        let reader = tokio::spawn(read_loop(stream, link, pending.clone(), registry, inbox));

        Ok(Self {
            link,
            writer,
            pending,
            next_seq: AtomicU64::new(1),
            reader,
        })
    }

    /// Registry key of a session opened on this link.
    pub fn route(&self, id: SessionId) -> Route {
        Route::new(self.link, id)
    }

    /// Queue a command. Fails only once the link is gone.
    pub fn send(&self, cmd: ServerCommand) -> Result<(), BridgeError> {
        self.writer.send(cmd).map_err(|_| BridgeError::LinkClosed)
    }

    fn register(&self, pending: Pending) -> Result<u64, BridgeError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut map = self.pending.lock().map_err(|_| BridgeError::LinkClosed)?;
        match map.as_mut() {
            Some(map) => {
                map.insert(seq, pending);
                Ok(seq)
            }
            None => Err(BridgeError::LinkClosed),
        }
    }

    fn forget(&self, seq: u64) {
        if let Ok(mut map) = self.pending.lock() {
            if let Some(map) = map.as_mut() {
                map.remove(&seq);
            }
        }
    }

    /// Open a PTY session on the server.
    pub async fn spawn(&self, cols: u16, rows: u16) -> Result<SessionId, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let seq = self.register(Pending::Spawn(tx))?;
        if let Err(e) = self.send(ServerCommand::Spawn { seq, cols, rows }) {
            self.forget(seq);
            return Err(e);
        }
        match rx.await {
            Ok(Ok(id)) => Ok(id),
            Ok(Err(message)) => Err(BridgeError::Rejected {
                code: ERR_SPAWN_FAILED.to_string(),
                message,
            }),
            Err(_) => Err(BridgeError::LinkClosed),
        }
    }

    /// Foreground process name of `id`, `"null"` if the server does not know it.
    pub async fn process(&self, id: &SessionId) -> Result<String, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let seq = self.register(Pending::Process(tx))?;
        if let Err(e) = self.send(ServerCommand::Process {
            seq,
            id: id.clone(),
        }) {
            self.forget(seq);
            return Err(e);
        }
        rx.await.map_err(|_| BridgeError::LinkClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().map(|map| map.is_none()).unwrap_or(true)
    }
}

impl Drop for DataLink {
    fn drop(&mut self) {
        // Queued commands are still flushed by the writer task
        self.reader.abort();
    }
}

async fn write_loop(
    mut sink: SplitSink<Framed<TcpStream, MessageCodec>, Bytes>,
    mut commands: mpsc::UnboundedReceiver<ServerCommand>,
) {
    while let Some(cmd) = commands.recv().await {
        let json = match serde_json::to_vec(&cmd) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode command");
                continue;
            }
        };
        if let Err(e) = sink.send(Bytes::from(json)).await {
            tracing::debug!(error = %e, "Data link write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<Framed<TcpStream, MessageCodec>>,
    link: LinkId,
    pending: PendingMap,
    registry: Arc<SessionRegistry>,
    inbox: Inbox,
) {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "Data link read failed");
                break;
            }
        };
        let event: ServerEvent = match serde_json::from_slice(&frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable server event dropped");
                continue;
            }
        };

        match event {
            ServerEvent::Spawned { seq, id, error } => {
                let Some(Pending::Spawn(tx)) = take_pending(&pending, seq) else {
                    continue;
                };
                match id {
                    Some(id) => {
                        let route = Route::new(link, id.clone());
                        if !registry.register(route.clone(), inbox.clone()) {
                            let _ = tx.send(Err(format!("session {} already routed", id)));
                            continue;
                        }
                        if tx.send(Ok(id)).is_err() {
                            registry.unregister(&route);
                        }
                    }
                    None => {
                        let _ = tx.send(Err(error.unwrap_or_else(|| "spawn failed".into())));
                    }
                }
            }
            ServerEvent::Process { seq, name } => {
                if let Some(Pending::Process(tx)) = take_pending(&pending, seq) {
                    let _ = tx.send(name);
                }
            }
            ServerEvent::Data { id, data } => {
                registry.route(&Route::new(link, id), Routed::Data(data));
            }
            ServerEvent::Kill { id } => {
                registry.route(&Route::new(link, id), Routed::Kill);
            }
        }
    }

    // Dropping the senders fails every waiter
    if let Ok(mut map) = pending.lock() {
        map.take();
    }
    let _ = inbox.send(Routed::Disconnected);
}

fn take_pending(pending: &PendingMap, seq: u64) -> Option<Pending> {
    let mut map = pending.lock().ok()?;
    map.as_mut()?.remove(&seq)
}
