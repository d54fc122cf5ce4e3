//! Client side: session bridges that negotiate a server through the spawner,
//! then stream one PTY session over a dedicated data socket.

mod bridge;
mod connector;
mod error;
mod link;
mod registry;
mod terminal;

pub use bridge::{Bridge, BridgeEvent, BridgeState};
pub use connector::Connector;
pub use error::BridgeError;
pub use link::{ControlLink, DataLink};
pub use registry::{Routed, SessionRegistry};
pub use terminal::attach;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    use crate::config::{ClientConfig, ServerConfig, SpawnerConfig};
    use crate::ipc::{SessionId, ERR_IDENTITY_UNKNOWN, NULL_PROCESS};
    use crate::pty::UserContext;
    use crate::server::{PtyServer, SessionManager};
    use crate::spawner::{Broker, Launch, ServerHandle, SharedRegistry, Termination};

    type Servers = Arc<Mutex<HashMap<u32, Arc<SessionManager>>>>;

    /// Runs each requested server as a task of the test runtime.
    #[derive(Default)]
    struct InProcessLauncher {
        next_pid: AtomicU32,
        servers: Servers,
    }

    struct InProcessServer {
        pid: u32,
        shutdown: broadcast::Sender<()>,
    }

    impl ServerHandle for InProcessServer {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn terminate(self) -> Termination {
            Box::pin(async move {
                for _ in 0..100 {
                    if self.shutdown.send(()).is_ok() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        }
    }

    impl Launch for InProcessLauncher {
        type Handle = InProcessServer;

        fn launch(&self, user: &UserContext, port: u16) -> anyhow::Result<InProcessServer> {
            let listener = std::net::TcpListener::bind(("127.0.0.1", port))?;
            listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(listener)?;

            let user = user.clone().with_shell(Some("/bin/sh"));
            let sessions = Arc::new(SessionManager::new(user, "xterm-256color"));
            let server = PtyServer::new(sessions.clone(), ServerConfig::default());
            let shutdown = server.shutdown_handle();
            tokio::spawn(async move { server.run(listener).await });

            let pid = 50_000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.servers.lock().unwrap().insert(pid, sessions);
            Ok(InProcessServer { pid, shutdown })
        }
    }

    struct Harness {
        connector: Arc<Connector>,
        instances: SharedRegistry<InProcessServer>,
        servers: Servers,
        _shutdown: broadcast::Sender<()>,
    }

    impl Harness {
        async fn start() -> Self {
            Self::start_as(UserContext::current().unwrap().name).await
        }

        async fn start_as(identity: impl Into<String>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let spawner_port = listener.local_addr().unwrap().port();
            let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let base = unused.local_addr().unwrap().port();
            drop(unused);

            let launcher = InProcessLauncher::default();
            let servers = launcher.servers.clone();
            let broker = Broker::new(
                launcher,
                SpawnerConfig {
                    bind: "127.0.0.1".into(),
                    port: spawner_port,
                    port_range_start: base,
                    port_range_end: base.saturating_add(3),
                    sweep_interval_ms: 100,
                },
            );
            let instances = broker.registry();
            let shutdown = broker.shutdown_handle();
            tokio::spawn(async move { broker.run(listener).await });

            let connector = Connector::new(
                ClientConfig {
                    host: "127.0.0.1".into(),
                    spawner_port,
                    title_poll_ms: 100,
                    heartbeat_ms: 100,
                    connect_timeout_ms: 2000,
                },
                identity,
            );

            Self {
                connector,
                instances,
                servers,
                _shutdown: shutdown,
            }
        }

        fn bridge(&self) -> Bridge {
            self.connector.bridge("127.0.0.1")
        }

        /// The server-side session table holding `id`.
        async fn sessions_for(&self, id: &SessionId) -> Option<Arc<SessionManager>> {
            let all: Vec<_> = self.servers.lock().unwrap().values().cloned().collect();
            for sessions in all {
                if sessions.contains(id).await {
                    return Some(sessions);
                }
            }
            None
        }
    }

    /// Wait for the first event matching `pred`, skipping others.
    async fn wait_for<F>(bridge: &mut Bridge, mut pred: F) -> BridgeEvent
    where
        F: FnMut(&BridgeEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match bridge.next_event().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for bridge event")
    }

    macro_rules! eventually {
        ($cond:expr) => {{
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while !$cond {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "condition not reached: {}",
                    stringify!($cond)
                );
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }};
    }

    /// Collects events for `window` and counts the `Destroyed` ones.
    async fn count_destroyed(bridge: &mut Bridge, window: Duration) -> usize {
        let mut count = 0;
        let _ = tokio::time::timeout(window, async {
            while let Some(event) = bridge.next_event().await {
                if event == BridgeEvent::Destroyed {
                    count += 1;
                }
            }
        })
        .await;
        count
    }

    #[tokio::test]
    async fn test_connect_reaches_active_and_routes_output() {
        let h = Harness::start().await;
        let mut bridge = h.bridge();
        assert_eq!(bridge.state(), BridgeState::Idle);

        let id = bridge.connect(80, 24).await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Active);
        assert_eq!(bridge.session_id(), Some(id.clone()));
        assert_eq!(h.connector.registry().len(), 1);
        assert_eq!(
            bridge.next_event().await,
            Some(BridgeEvent::Connected(id.clone()))
        );

        bridge.write(&b"echo hello-bridge\n"[..]);
        let mut output = Vec::new();
        let mut title = None;
        wait_for(&mut bridge, |event| {
            match event {
                BridgeEvent::Data(data) => output.extend_from_slice(data),
                BridgeEvent::Title {
                    process,
                    cols,
                    rows,
                } => title = Some((process.clone(), *cols, *rows)),
                _ => {}
            }
            title.is_some() && String::from_utf8_lossy(&output).contains("hello-bridge")
        })
        .await;

        let (process, cols, rows) = title.unwrap();
        assert_ne!(process, NULL_PROCESS);
        assert_eq!((cols, rows), (80, 24));
    }

    #[tokio::test]
    async fn test_resize_keeps_session_valid() {
        let h = Harness::start().await;
        let mut bridge = h.bridge();
        let id = bridge.connect(80, 24).await.unwrap();

        bridge.resize(100, 40);
        assert_eq!(bridge.size(), (100, 40));
        wait_for(&mut bridge, |e| {
            matches!(e, BridgeEvent::Title { cols: 100, rows: 40, .. })
        })
        .await;

        let sessions = h.sessions_for(&id).await.expect("session on server");
        assert_ne!(sessions.process_name(&id).await, NULL_PROCESS);
        assert_eq!(bridge.state(), BridgeState::Active);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let h = Harness::start().await;
        let mut bridge = h.bridge();
        let id = bridge.connect(80, 24).await.unwrap();
        let sessions = h.sessions_for(&id).await.expect("session on server");

        bridge.destroy();
        bridge.destroy();
        assert_eq!(bridge.state(), BridgeState::Destroyed);
        assert!(h.connector.registry().is_empty());
        assert_eq!(count_destroyed(&mut bridge, Duration::from_millis(300)).await, 1);

        // Writes after teardown go nowhere
        bridge.write(&b"ls\n"[..]);
        assert!(bridge.connect(80, 24).await.is_err());

        eventually!(!sessions.contains(&id).await);
        eventually!(h.instances.lock().await.is_empty());
        eventually!(h.connector.link_count().await == 0);
    }

    #[tokio::test]
    async fn test_server_kill_destroys_bridge() {
        let h = Harness::start().await;
        let mut bridge = h.bridge();
        let id = bridge.connect(80, 24).await.unwrap();

        let sessions = h.sessions_for(&id).await.expect("session on server");
        assert!(sessions.destroy(&id).await);

        wait_for(&mut bridge, |e| *e == BridgeEvent::Destroyed).await;
        assert_eq!(bridge.state(), BridgeState::Destroyed);
        assert!(h.connector.registry().is_empty());
        assert_eq!(count_destroyed(&mut bridge, Duration::from_millis(300)).await, 0);
    }

    #[tokio::test]
    async fn test_shell_exit_destroys_bridge() {
        let h = Harness::start().await;
        let mut bridge = h.bridge();
        bridge.connect(80, 24).await.unwrap();

        bridge.write(&b"exit\n"[..]);
        wait_for(&mut bridge, |e| *e == BridgeEvent::Destroyed).await;
        assert_eq!(bridge.state(), BridgeState::Destroyed);
    }

    #[tokio::test]
    async fn test_server_shutdown_destroys_bridge() {
        let h = Harness::start().await;
        let mut bridge = h.bridge();
        bridge.connect(80, 24).await.unwrap();

        let killed = h.instances.lock().await.kill_all();
        assert_eq!(killed.len(), 1);
        futures_util::future::join_all(killed).await;

        wait_for(&mut bridge, |e| *e == BridgeEvent::Destroyed).await;
        assert_eq!(bridge.state(), BridgeState::Destroyed);
    }

    #[tokio::test]
    async fn test_rejected_identity_returns_to_idle() {
        let h = Harness::start_as("no-such-user-termbridge").await;
        let mut bridge = h.bridge();

        match bridge.connect(80, 24).await {
            Err(BridgeError::Rejected { code, .. }) => assert_eq!(code, ERR_IDENTITY_UNKNOWN),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(bridge.state(), BridgeState::Idle);
        eventually!(h.connector.link_count().await == 0);

        // A retry from Idle is allowed and fails the same way
        assert!(matches!(
            bridge.connect(80, 24).await,
            Err(BridgeError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_spawner_is_negotiation_error() {
        let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let connector = Connector::new(
            ClientConfig {
                spawner_port: port,
                connect_timeout_ms: 200,
                ..ClientConfig::default()
            },
            "nobody",
        );
        let mut bridge = connector.bridge("127.0.0.1");
        assert!(matches!(
            bridge.connect(80, 24).await,
            Err(BridgeError::Negotiation(_))
        ));
        assert_eq!(bridge.state(), BridgeState::Idle);
    }

    #[tokio::test]
    async fn test_connect_while_active_is_invalid() {
        let h = Harness::start().await;
        let mut bridge = h.bridge();
        bridge.connect(80, 24).await.unwrap();

        assert!(matches!(
            bridge.connect(80, 24).await,
            Err(BridgeError::InvalidState(BridgeState::Active))
        ));
    }

    #[tokio::test]
    async fn test_bridges_share_one_control_link() {
        let h = Harness::start().await;
        let mut first = h.bridge();
        let mut second = h.bridge();
        let a = first.connect(80, 24).await.unwrap();
        let b = second.connect(80, 24).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(h.connector.link_count().await, 1);
        assert_eq!(h.instances.lock().await.len(), 2);

        first.destroy();
        eventually!(h.instances.lock().await.len() == 1);
        assert_eq!(h.connector.link_count().await, 1);

        drop(second);
        eventually!(h.connector.link_count().await == 0);
    }
}
