use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::ipc::SessionId;

/// What a data link hands to the bridge that owns a session.
#[derive(Debug)]
pub enum Routed {
    Data(Bytes),
    /// The server removed the session.
    Kill,
    /// The data socket closed.
    Disconnected,
}

pub type Inbox = mpsc::UnboundedSender<Routed>;

/// Identifies one data link. Session ids are only unique per server, so
/// every route is scoped to the link the session was opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub link: LinkId,
    pub id: SessionId,
}

impl Route {
    pub fn new(link: LinkId, id: SessionId) -> Self {
        Self { link, id }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.link, self.id)
    }
}

/// Maps live sessions to the inbox of the one bridge that owns each.
#[derive(Default)]
pub struct SessionRegistry {
    routes: Mutex<HashMap<Route, Inbox>>,
    next_link: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the scope for a new data link.
    pub fn open_link(&self) -> LinkId {
        LinkId(self.next_link.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind `route` to `inbox`. Returns false and leaves the existing route in
    /// place if it is already bound.
    pub fn register(&self, route: Route, inbox: Inbox) -> bool {
        let Ok(mut routes) = self.routes.lock() else {
            return false;
        };
        if routes.contains_key(&route) {
            tracing::warn!(route = %route, "Session already registered");
            return false;
        }
        routes.insert(route, inbox);
        true
    }

    pub fn unregister(&self, route: &Route) -> bool {
        match self.routes.lock() {
            Ok(mut routes) => routes.remove(route).is_some(),
            Err(_) => false,
        }
    }

    /// Deliver to the owner of `route`. Unknown routes are dropped.
    pub fn route(&self, route: &Route, msg: Routed) -> bool {
        let inbox = match self.routes.lock() {
            Ok(routes) => routes.get(route).cloned(),
            Err(_) => None,
        };
        match inbox {
            Some(inbox) => inbox.send(msg).is_ok(),
            None => {
                tracing::trace!(route = %route, "Dropping event for unknown session");
                false
            }
        }
    }

    pub fn contains(&self, route: &Route) -> bool {
        self.routes
            .lock()
            .map(|routes| routes.contains_key(route))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.routes.lock().map(|routes| routes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_to_exactly_one_owner() {
        let registry = SessionRegistry::new();
        let link = registry.open_link();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = Route::new(link, SessionId::new("pty-1"));
        let b = Route::new(link, SessionId::new("pty-2"));

        assert!(registry.register(a.clone(), a_tx));
        assert!(registry.register(b.clone(), b_tx.clone()));
        assert!(!registry.register(a.clone(), b_tx));

        assert!(registry.route(&a, Routed::Data(Bytes::from_static(b"x"))));
        assert!(matches!(a_rx.try_recv(), Ok(Routed::Data(d)) if d == "x"));
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn test_same_session_id_on_two_links_kept_apart() {
        let registry = SessionRegistry::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = Route::new(registry.open_link(), SessionId::new("pty-0"));
        let b = Route::new(registry.open_link(), SessionId::new("pty-0"));
        assert_ne!(a, b);

        assert!(registry.register(a.clone(), a_tx));
        assert!(registry.register(b.clone(), b_tx));

        registry.route(&b, Routed::Data(Bytes::from_static(b"for-b")));
        assert!(a_rx.try_recv().is_err());
        assert!(matches!(b_rx.try_recv(), Ok(Routed::Data(d)) if d == "for-b"));

        // Tearing down one leaves the other routed
        assert!(registry.unregister(&a));
        assert!(registry.contains(&b));
        assert!(registry.route(&b, Routed::Kill));
    }

    #[test]
    fn test_unknown_and_unregistered_routes_dropped() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let route = Route::new(registry.open_link(), SessionId::new("pty-1"));

        assert!(!registry.route(&route, Routed::Kill));
        registry.register(route.clone(), tx);
        assert!(registry.contains(&route));
        assert!(registry.unregister(&route));
        assert!(!registry.unregister(&route));
        assert!(!registry.route(&route, Routed::Kill));
        assert!(rx.try_recv().is_err());
        assert!(registry.is_empty());
    }
}
