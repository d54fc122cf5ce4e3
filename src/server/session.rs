use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::ipc::{ServerEvent, SessionId, NULL_PROCESS};
use crate::pty::{PtyProcess, SpawnOptions, UserContext};

/// How long the exit watcher waits for buffered output before reporting `kill`
const FORWARD_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Events queued per client before the fan-out waits for it to catch up
const SUBSCRIBER_BUFFER: usize = 256;

type Subscribers = Arc<Mutex<Vec<mpsc::Sender<ServerEvent>>>>;

/// Why a session left the table; only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    Destroyed,
    Exited,
    IdleTimeout,
    Shutdown,
}

/// One PTY bound to a session id.
#[derive(Debug)]
pub struct Session {
    pub pty: Arc<PtyProcess>,
    /// Refreshed by client activity only (data, resize, process, ping)
    pub last_heartbeat: Instant,
}

/// Owns every PTY of one server process and fans their events out to all
/// connected clients.
///
/// Events go out in order and are never dropped: a client that falls behind
/// holds up the fan-out (and with it the output it has yet to read) until it
/// catches up or disconnects. Must be created inside a Tokio runtime.
pub struct SessionManager {
    user: UserContext,
    term: String,
    sessions: RwLock<HashMap<SessionId, Session>>,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    subscribers: Subscribers,
    terminations: TaskTracker,
}

impl SessionManager {
    pub fn new(user: UserContext, term: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let subscribers = Subscribers::default();
        tokio::spawn(fan_out(events_rx, subscribers.clone()));
        Self {
            user,
            term: term.into(),
            sessions: RwLock::new(HashMap::new()),
            events_tx,
            subscribers,
            terminations: TaskTracker::new(),
        }
    }

    /// Receive `data`/`kill` events for every session, starting with the
    /// next one published.
    pub fn subscribe(&self) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Start a login shell on a new PTY and register it.
    pub async fn spawn(self: &Arc<Self>, cols: u16, rows: u16) -> Result<SessionId> {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let opts = SpawnOptions {
            cols,
            rows,
            term: self.term.clone(),
        };
        let (pty, exit_rx) = PtyProcess::spawn(&self.user, &opts, output_tx)?;
        let id = pty.id().clone();
        let pid = pty.pid();
        let pty = Arc::new(pty);

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&id) {
                self.terminations.spawn(pty.terminate());
                bail!("Session id {} is already live", id);
            }
            sessions.insert(
                id.clone(),
                Session {
                    pty,
                    last_heartbeat: Instant::now(),
                },
            );
        }

        let forwarder = self.spawn_output_forwarder(id.clone(), output_rx);
        self.spawn_exit_watcher(exit_rx, forwarder, id.clone(), pid);

        tracing::info!(session = %id, pid, cols, rows, "Created session");
        Ok(id)
    }

    /// Forward input to a session. Unknown ids are ignored.
    pub async fn write(&self, id: &SessionId, data: &[u8]) {
        let Some(pty) = self.touch(id).await else {
            tracing::debug!(session = %id, "Write for unknown session dropped");
            return;
        };
        if let Err(e) = pty.write(data).await {
            tracing::warn!(session = %id, error = %e, "PTY write failed");
        }
    }

    /// Resize a session. Requests missing a dimension, or with a zero
    /// dimension, are dropped. Returns whether the resize was applied.
    pub async fn resize(&self, id: &SessionId, cols: Option<u16>, rows: Option<u16>) -> bool {
        let (cols, rows) = match (cols, rows) {
            (Some(c), Some(r)) if c > 0 && r > 0 => (c, r),
            _ => {
                tracing::warn!(session = %id, ?cols, ?rows, "Malformed resize dropped");
                return false;
            }
        };
        match self.touch(id).await {
            Some(pty) => {
                pty.resize(cols, rows);
                true
            }
            None => false,
        }
    }

    /// Foreground process name, or `"null"` for unknown ids.
    pub async fn process_name(&self, id: &SessionId) -> String {
        match self.touch(id).await {
            Some(pty) => pty.foreground_process_name(),
            None => NULL_PROCESS.to_string(),
        }
    }

    /// Explicit keepalive from a client.
    pub async fn ping(&self, id: &SessionId) -> bool {
        self.touch(id).await.is_some()
    }

    /// Explicit teardown. Returns false when the id was not live.
    pub async fn destroy(&self, id: &SessionId) -> bool {
        self.remove(id, None, RemoveReason::Destroyed).await
    }

    /// Tear down every session (server shutdown) and wait until every shell
    /// this manager ever terminated has been reaped.
    pub async fn destroy_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.read().await.keys().cloned().collect();
        let mut count = 0;
        for id in ids {
            if self.remove(&id, None, RemoveReason::Shutdown).await {
                count += 1;
            }
        }
        self.terminations.close();
        self.terminations.wait().await;
        count
    }

    /// Sessions whose last heartbeat is older than `timeout` at `now`.
    pub async fn expired_at(&self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_heartbeat) > timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Destroy every session idle for longer than `timeout`.
    pub async fn sweep_idle(&self, timeout: Duration) -> Vec<SessionId> {
        self.sweep_idle_at(Instant::now(), timeout).await
    }

    pub async fn sweep_idle_at(&self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        let mut removed = Vec::new();
        for id in self.expired_at(now, timeout).await {
            if self.remove(&id, None, RemoveReason::IdleTimeout).await {
                removed.push(id);
            }
        }
        removed
    }

    /// Refresh a session's heartbeat and hand out its PTY.
    async fn touch(&self, id: &SessionId) -> Option<Arc<PtyProcess>> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id)?;
        session.last_heartbeat = Instant::now();
        Some(session.pty.clone())
    }

    /// The single removal path. Only the call that actually removes the entry
    /// terminates the PTY and publishes `kill`. With `expected_pid`, the
    /// entry is only removed if it still belongs to that shell.
    async fn remove(&self, id: &SessionId, expected_pid: Option<u32>, reason: RemoveReason) -> bool {
        let session = {
            let mut sessions = self.sessions.write().await;
            match (sessions.get(id), expected_pid) {
                (None, _) => return false,
                (Some(s), Some(pid)) if s.pty.pid() != pid => return false,
                _ => {}
            }
            sessions.remove(id)
        };
        let Some(session) = session else {
            return false;
        };

        if reason != RemoveReason::Exited {
            self.terminations.spawn(session.pty.terminate());
        }
        let _ = self.events_tx.send(ServerEvent::Kill { id: id.clone() });

        tracing::info!(session = %id, pid = session.pty.pid(), ?reason, "Removed session");
        true
    }

    fn spawn_output_forwarder(
        &self,
        id: SessionId,
        mut output_rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> tokio::task::JoinHandle<()> {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(data) = output_rx.recv().await {
                let _ = events_tx.send(ServerEvent::Data {
                    id: id.clone(),
                    data,
                });
            }
        })
    }

    /// Remove the session once its shell exits, after pending output went out.
    fn spawn_exit_watcher(
        self: &Arc<Self>,
        exit_rx: oneshot::Receiver<Option<i32>>,
        forwarder: tokio::task::JoinHandle<()>,
        id: SessionId,
        expected_pid: u32,
    ) {
        let sm = Arc::clone(self);
        tokio::spawn(async move {
            let code = exit_rx.await.ok().flatten();
            let _ = tokio::time::timeout(FORWARD_DRAIN_TIMEOUT, forwarder).await;

            if sm.remove(&id, Some(expected_pid), RemoveReason::Exited).await {
                tracing::info!(session = %id, code = ?code, "PTY exited");
            }
        });
    }
}

/// Deliver every event to every subscriber, in order. Waits on full
/// subscribers; closed ones are dropped. With no subscribers the event is
/// discarded, so output is not buffered for late clients.
async fn fan_out(mut events: mpsc::UnboundedReceiver<ServerEvent>, subscribers: Subscribers) {
    while let Some(event) = events.recv().await {
        let targets: Vec<_> = match subscribers.lock() {
            Ok(list) => list.clone(),
            Err(_) => break,
        };
        let mut closed = false;
        for target in &targets {
            if target.send(event.clone()).await.is_err() {
                closed = true;
            }
        }
        if closed {
            if let Ok(mut list) = subscribers.lock() {
                list.retain(|s| !s.is_closed());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<SessionManager> {
        let user = UserContext::current().unwrap().with_shell(Some("/bin/sh"));
        Arc::new(SessionManager::new(user, "xterm-256color"))
    }

    async fn next_kill(rx: &mut mpsc::Receiver<ServerEvent>) -> Option<SessionId> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(ServerEvent::Kill { id })) => return Some(id),
                Ok(Some(_)) => {}
                Ok(None) => return None,
                Err(_) => {}
            }
        }
        None
    }

    #[tokio::test]
    async fn test_spawn_resize_process_destroy() {
        let sm = manager();
        let id = sm.spawn(80, 24).await.unwrap();
        assert_eq!(sm.session_count().await, 1);

        assert!(sm.resize(&id, Some(100), Some(40)).await);
        {
            let sessions = sm.sessions.read().await;
            assert_eq!(sessions[&id].pty.size(), (100, 40));
        }
        assert_ne!(sm.process_name(&id).await, NULL_PROCESS);

        assert!(sm.destroy(&id).await);
        assert_eq!(sm.session_count().await, 0);
        // Second destroy is a no-op
        assert!(!sm.destroy(&id).await);
    }

    #[tokio::test]
    async fn test_malformed_resize_dropped() {
        let sm = manager();
        let id = sm.spawn(80, 24).await.unwrap();

        assert!(!sm.resize(&id, Some(120), None).await);
        assert!(!sm.resize(&id, None, Some(50)).await);
        assert!(!sm.resize(&id, Some(0), Some(50)).await);
        {
            let sessions = sm.sessions.read().await;
            assert_eq!(sessions[&id].pty.size(), (80, 24));
        }
        sm.destroy_all().await;
    }

    #[tokio::test]
    async fn test_unknown_id_is_noop() {
        let sm = manager();
        let ghost = SessionId::new("pty-ghost");
        sm.write(&ghost, b"ls\n").await;
        assert!(!sm.resize(&ghost, Some(10), Some(10)).await);
        assert!(!sm.ping(&ghost).await);
        assert_eq!(sm.process_name(&ghost).await, NULL_PROCESS);
        assert!(!sm.destroy(&ghost).await);
    }

    #[tokio::test]
    async fn test_idle_expiry_boundary() {
        let sm = manager();
        let id = sm.spawn(80, 24).await.unwrap();
        let timeout = Duration::from_secs(60);
        let born = sm.sessions.read().await[&id].last_heartbeat;

        assert!(sm.expired_at(born + Duration::from_secs(59), timeout).await.is_empty());
        assert!(sm.expired_at(born + timeout, timeout).await.is_empty());
        assert_eq!(
            sm.expired_at(born + Duration::from_secs(61), timeout).await,
            vec![id.clone()]
        );
        sm.destroy_all().await;
    }

    #[tokio::test]
    async fn test_sweep_reclaims_and_notifies() {
        let sm = manager();
        let mut events = sm.subscribe();
        let id = sm.spawn(80, 24).await.unwrap();
        let later = Instant::now() + Duration::from_secs(61);

        let removed = sm.sweep_idle_at(later, Duration::from_secs(60)).await;
        assert_eq!(removed, vec![id.clone()]);
        assert_eq!(sm.session_count().await, 0);
        assert_eq!(next_kill(&mut events).await, Some(id));
    }

    #[tokio::test]
    async fn test_activity_refreshes_heartbeat() {
        let sm = manager();
        let id = sm.spawn(80, 24).await.unwrap();
        let born = sm.sessions.read().await[&id].last_heartbeat;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sm.ping(&id).await);
        let refreshed = sm.sessions.read().await[&id].last_heartbeat;
        assert!(refreshed > born);
        sm.destroy_all().await;
    }

    #[tokio::test]
    async fn test_shell_exit_removes_session_once() {
        let sm = manager();
        let mut events = sm.subscribe();
        let id = sm.spawn(80, 24).await.unwrap();

        sm.write(&id, b"exit\n").await;
        assert_eq!(next_kill(&mut events).await, Some(id.clone()));
        assert!(!sm.contains(&id).await);
        assert!(!sm.destroy(&id).await);
    }

    #[tokio::test]
    async fn test_slow_subscriber_gets_every_byte() {
        let sm = manager();
        let mut events = sm.subscribe();
        let id = sm.spawn(80, 24).await.unwrap();
        sm.write(&id, b"echo first-$((1+1)); yes | head -n 200000; echo last-$((2+2))\n")
            .await;

        // Fall well behind before reading anything
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let mut output = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Some(ServerEvent::Data { id: from, data })) if from == id => {
                    output.extend_from_slice(&data);
                    if output.windows(6).any(|w| w == b"last-4") {
                        break;
                    }
                }
                Ok(Some(_)) | Err(_) => {}
                Ok(None) => break,
            }
        }

        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("first-2"));
        assert!(text.contains("last-4"));
        // 200000 lines of "y", each CRLF-terminated by the terminal
        assert!(text.matches("y\r\n").count() >= 200_000);
        sm.destroy_all().await;
    }

    #[tokio::test]
    async fn test_closed_subscriber_does_not_block_others() {
        let sm = manager();
        let dropped = sm.subscribe();
        let mut events = sm.subscribe();
        drop(dropped);

        let id = sm.spawn(80, 24).await.unwrap();
        sm.destroy(&id).await;
        assert_eq!(next_kill(&mut events).await, Some(id));
    }

    #[tokio::test]
    async fn test_destroy_all_waits_for_shells() {
        let sm = manager();
        let id = sm.spawn(80, 24).await.unwrap();
        let pid = sm.sessions.read().await[&id].pty.pid();

        assert_eq!(sm.destroy_all().await, 1);
        let gone = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None);
        assert!(gone.is_err());
    }
}
