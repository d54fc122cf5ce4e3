use std::collections::{HashMap, HashSet};
use std::fmt;

use super::launch::{ServerHandle, Termination};
use super::ports::PortPool;

/// Identifies one control connection to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A running server process, its port, and the connection that asked for it.
#[derive(Debug)]
pub struct Instance<H> {
    pub handle: H,
    pub port: u16,
    pub owner: ConnectionId,
    pub user: String,
}

/// Every server the broker launched, keyed by pid.
pub struct InstanceRegistry<H> {
    instances: HashMap<u32, Instance<H>>,
    ports: PortPool,
    connected: HashSet<ConnectionId>,
    next_conn: u64,
    closed: bool,
}

impl<H: ServerHandle> InstanceRegistry<H> {
    pub fn new(ports: PortPool) -> Self {
        Self {
            instances: HashMap::new(),
            ports,
            connected: HashSet::new(),
            next_conn: 1,
            closed: false,
        }
    }

    /// Register a new control connection.
    pub fn connect(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_conn);
        self.next_conn += 1;
        self.connected.insert(id);
        id
    }

    /// Mark a connection closed. Its instances are reaped by the next sweep.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        self.connected.remove(&conn);
    }

    pub fn is_connected(&self, conn: ConnectionId) -> bool {
        self.connected.contains(&conn)
    }

    /// Refuse further launches. Set once the broker starts shutting down.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn allocate_port(&mut self) -> Option<u16> {
        self.ports.allocate()
    }

    pub fn release_port(&mut self, port: u16) {
        self.ports.release(port);
    }

    /// Record a launched server. Returns its pid.
    pub fn insert(&mut self, owner: ConnectionId, port: u16, user: String, handle: H) -> u32 {
        let pid = handle.pid();
        self.instances.insert(
            pid,
            Instance {
                handle,
                port,
                owner,
                user,
            },
        );
        pid
    }

    pub fn get(&self, pid: u32) -> Option<&Instance<H>> {
        self.instances.get(&pid)
    }

    pub fn owner_of(&self, pid: u32) -> Option<ConnectionId> {
        self.instances.get(&pid).map(|i| i.owner)
    }

    /// Terminate the server and free its port. `None` for unknown pids.
    pub fn kill(&mut self, pid: u32) -> Option<Termination> {
        let instance = self.instances.remove(&pid)?;
        self.ports.release(instance.port);
        tracing::info!(pid, port = instance.port, user = %instance.user, owner = %instance.owner, "Killing server");
        Some(instance.handle.terminate())
    }

    /// Kill every instance whose owning connection has closed, and forget
    /// servers that already exited on their own.
    pub fn sweep(&mut self) -> Vec<(u32, Termination)> {
        let mut reaped = Vec::new();
        for (pid, instance) in self.instances.iter_mut() {
            if !self.connected.contains(&instance.owner) || instance.handle.exited() {
                reaped.push(*pid);
            }
        }
        reaped
            .into_iter()
            .filter_map(|pid| self.kill(pid).map(|t| (pid, t)))
            .collect()
    }

    pub fn kill_all(&mut self) -> Vec<Termination> {
        let pids: Vec<u32> = self.instances.keys().copied().collect();
        pids.into_iter().filter_map(|pid| self.kill(pid)).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn ports_in_use(&self) -> usize {
        self.ports.in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeHandle {
        pid: u32,
        terminated: Arc<AtomicUsize>,
        exited: bool,
    }

    impl ServerHandle for FakeHandle {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn terminate(self) -> Termination {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn exited(&mut self) -> bool {
            self.exited
        }
    }

    fn registry() -> InstanceRegistry<FakeHandle> {
        InstanceRegistry::new(PortPool::new(26490, 26999))
    }

    fn launch(
        reg: &mut InstanceRegistry<FakeHandle>,
        owner: ConnectionId,
        pid: u32,
        terminated: &Arc<AtomicUsize>,
    ) -> u16 {
        let port = reg.allocate_port().unwrap();
        reg.insert(
            owner,
            port,
            "alice".into(),
            FakeHandle {
                pid,
                terminated: terminated.clone(),
                exited: false,
            },
        );
        port
    }

    #[test]
    fn test_two_spawns_get_successive_ports() {
        let mut reg = registry();
        let terminated = Arc::new(AtomicUsize::new(0));
        let a = reg.connect();
        let b = reg.connect();
        assert_ne!(a, b);

        assert_eq!(launch(&mut reg, a, 100, &terminated), 26490);
        assert_eq!(launch(&mut reg, b, 101, &terminated), 26491);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.owner_of(101), Some(b));
    }

    #[test]
    fn test_kill_is_idempotent_and_frees_port() {
        let mut reg = registry();
        let terminated = Arc::new(AtomicUsize::new(0));
        let conn = reg.connect();
        launch(&mut reg, conn, 100, &terminated);

        assert!(reg.kill(100).is_some());
        assert!(reg.kill(100).is_none());
        assert!(reg.kill(999).is_none());
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        assert_eq!(reg.ports_in_use(), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_sweep_kills_only_disconnected_owners() {
        let mut reg = registry();
        let terminated = Arc::new(AtomicUsize::new(0));
        let gone = reg.connect();
        let alive = reg.connect();
        launch(&mut reg, gone, 100, &terminated);
        launch(&mut reg, gone, 101, &terminated);
        launch(&mut reg, alive, 102, &terminated);

        assert!(reg.sweep().is_empty());

        reg.disconnect(gone);
        assert!(!reg.is_connected(gone));
        let mut swept: Vec<u32> = reg.sweep().into_iter().map(|(pid, _)| pid).collect();
        swept.sort();
        assert_eq!(swept, vec![100, 101]);
        assert_eq!(terminated.load(Ordering::SeqCst), 2);
        assert!(reg.get(102).is_some());
    }

    #[test]
    fn test_sweep_forgets_exited_servers() {
        let mut reg = registry();
        let terminated = Arc::new(AtomicUsize::new(0));
        let conn = reg.connect();
        let port = reg.allocate_port().unwrap();
        reg.insert(
            conn,
            port,
            "alice".into(),
            FakeHandle {
                pid: 100,
                terminated: terminated.clone(),
                exited: true,
            },
        );

        let swept: Vec<u32> = reg.sweep().into_iter().map(|(pid, _)| pid).collect();
        assert_eq!(swept, vec![100]);
        assert_eq!(reg.ports_in_use(), 0);
    }

    #[test]
    fn test_kill_all() {
        let mut reg = registry();
        let terminated = Arc::new(AtomicUsize::new(0));
        let conn = reg.connect();
        launch(&mut reg, conn, 100, &terminated);
        launch(&mut reg, conn, 101, &terminated);

        assert_eq!(reg.kill_all().len(), 2);
        assert_eq!(terminated.load(Ordering::SeqCst), 2);
        assert_eq!(reg.ports_in_use(), 0);
    }
}
