use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::ClientConfig;

use super::bridge::Bridge;
use super::error::BridgeError;
use super::link::ControlLink;
use super::registry::SessionRegistry;

struct SharedControl {
    link: Arc<ControlLink>,
    bridges: usize,
}

/// Per-process client state: one control link per host, shared by every
/// bridge to that host, and the registry routing server events to bridges.
pub struct Connector {
    config: ClientConfig,
    identity: String,
    links: Mutex<HashMap<String, SharedControl>>,
    registry: Arc<SessionRegistry>,
}

impl Connector {
    /// `identity` is the user every server is requested for.
    pub fn new(config: ClientConfig, identity: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            config,
            identity: identity.into(),
            links: Mutex::new(HashMap::new()),
            registry: Arc::new(SessionRegistry::new()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// A new idle bridge to `host`.
    pub fn bridge(self: &Arc<Self>, host: impl Into<String>) -> Bridge {
        Bridge::new(self.clone(), host.into())
    }

    /// Take a reference on the control link to `host`, opening it if no
    /// bridge holds one.
    pub(super) async fn acquire(&self, host: &str) -> Result<Arc<ControlLink>, BridgeError> {
        let mut links = self.links.lock().await;
        if let Some(shared) = links.get_mut(host) {
            if !shared.link.is_closed() {
                shared.bridges += 1;
                return Ok(shared.link.clone());
            }
        }

        let link = Arc::new(
            ControlLink::connect(host, self.config.spawner_port, self.config.connect_timeout())
                .await?,
        );
        // A closed link being replaced keeps its count; its holders release it here
        let bridges = links.get(host).map(|s| s.bridges).unwrap_or(0) + 1;
        links.insert(
            host.to_string(),
            SharedControl {
                link: link.clone(),
                bridges,
            },
        );
        tracing::info!(host, port = self.config.spawner_port, "Control link connected");
        Ok(link)
    }

    /// Drop a reference taken by [`Connector::acquire`]. The last release
    /// closes the control socket.
    pub(super) async fn release(&self, host: &str) {
        let mut links = self.links.lock().await;
        let Some(shared) = links.get_mut(host) else {
            return;
        };
        shared.bridges = shared.bridges.saturating_sub(1);
        if shared.bridges == 0 {
            links.remove(host);
            tracing::info!(host, "Control link released");
        }
    }

    /// Number of hosts with an open control link.
    pub async fn link_count(&self) -> usize {
        self.links.lock().await.len()
    }
}
