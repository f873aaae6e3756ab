//! Process-wide transport context.
//!
//! One [`Bus`] exists per process. It owns the topic registry and the
//! connection inventory, binds the listening socket, and hands out
//! [`Node`] handles. Lifecycle is explicit: [`Bus::init`] to bring the
//! transport up, [`Bus::fini`] to tear it down.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::core::BusError;
use crate::node::Node;
use crate::topic::TopicManager;
use crate::transport::{ConnectionManager, DEFAULT_MAX_HEADER_FAULTS};

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Address the listener binds to. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,

    /// Consecutive invalid/empty frame headers tolerated on a
    /// connection before it is closed.
    pub max_header_faults: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0"
                .parse()
                .expect("default bind address is valid"),
            max_header_faults: DEFAULT_MAX_HEADER_FAULTS,
        }
    }
}

/// Builder for creating a [`BusConfig`].
#[derive(Debug, Default)]
pub struct BusConfigBuilder {
    config: BusConfig,
}

impl BusConfigBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the header-fault tolerance.
    pub fn max_header_faults(mut self, faults: u32) -> Self {
        self.config.max_header_faults = faults;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> BusConfig {
        self.config
    }
}

/// The process-wide pub/sub transport.
pub struct Bus {
    topics: Arc<TopicManager>,
    connections: Arc<ConnectionManager>,
    listen_addr: SocketAddr,
}

impl Bus {
    /// Bring the transport up: bind the listener and wire the control
    /// routing between the connection inventory and the topic registry.
    pub async fn init(config: BusConfig) -> Result<Arc<Self>, BusError> {
        let connections = ConnectionManager::new(config.max_header_faults);
        let topics = TopicManager::new(Arc::clone(&connections));
        connections.set_router(&topics);
        let listen_addr = connections.start_listening(config.bind_addr).await?;
        debug!(%listen_addr, "bus initialized");
        Ok(Arc::new(Self {
            topics,
            connections,
            listen_addr,
        }))
    }

    /// The endpoint remote processes reach this bus at.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Create a node resolving topic names under `namespace`.
    pub fn create_node(&self, namespace: &str) -> Arc<Node> {
        Node::new(Arc::clone(&self.topics), namespace)
    }

    /// Register with a remote bus as a peer.
    ///
    /// Both sides learn each other's advertisements; subscriptions then
    /// negotiate data links on demand.
    pub async fn connect_peer(&self, host: &str, port: u16) -> Result<(), BusError> {
        self.connections.connect_peer(host, port).await?;
        Ok(())
    }

    /// The topic registry, for lookups and diagnostics.
    pub fn topics(&self) -> &Arc<TopicManager> {
        &self.topics
    }

    /// The connection inventory, for diagnostics.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Tear the transport down: finalize every transport, stop the
    /// listener, and close every connection.
    pub fn fini(&self) {
        self.topics.fini();
        self.connections.fini();
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("listen_addr", &self.listen_addr)
            .finish()
    }
}
