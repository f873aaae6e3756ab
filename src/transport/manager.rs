//! Connection inventory and control-message routing.
//!
//! The [`ConnectionManager`] owns the set of live connections, the
//! listening socket, and the peer links used for control traffic. One
//! control link per remote endpoint is preferred; data links for
//! publication transports are created fresh because their inbound bytes
//! are an undifferentiated message stream.
//!
//! Inbound frames on accepted connections are control envelopes and are
//! routed into the topic registry: `hello` registers a peer and replays
//! the advertisement table, `advertise` records a remote publication,
//! `sub`/`unsub` attach and detach remote subscribers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::{debug, warn};

use super::connection::Connection;
use super::listener::Listener;
use crate::core::ConnectionError;
use crate::topic::TopicManager;
use crate::wire::{Envelope, EnvelopeOp};

fn endpoint_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Inventory and router for a process's connections.
pub struct ConnectionManager {
    weak_self: Weak<Self>,
    max_header_faults: u32,
    connections: Mutex<Vec<Arc<Connection>>>,
    /// Control links keyed by the remote process's listen endpoint.
    peers: Mutex<HashMap<String, Arc<Connection>>>,
    listener: Mutex<Option<Listener>>,
    listen_addr: Mutex<Option<SocketAddr>>,
    router: OnceLock<Weak<TopicManager>>,
}

impl ConnectionManager {
    /// Create an empty manager.
    pub fn new(max_header_faults: u32) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            max_header_faults,
            connections: Mutex::new(Vec::new()),
            peers: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            listen_addr: Mutex::new(None),
            router: OnceLock::new(),
        })
    }

    /// Wire the topic registry that inbound envelopes are routed to.
    pub(crate) fn set_router(&self, topics: &Arc<TopicManager>) {
        let _ = self.router.set(Arc::downgrade(topics));
    }

    fn topics(&self) -> Option<Arc<TopicManager>> {
        self.router.get().and_then(Weak::upgrade)
    }

    /// Header-fault tolerance configured for this process.
    pub fn max_header_faults(&self) -> u32 {
        self.max_header_faults
    }

    /// Bind the listening socket and start routing accepted connections.
    pub async fn start_listening(&self, addr: SocketAddr) -> Result<SocketAddr, ConnectionError> {
        let mgr = self.weak_self.clone();
        let listener = Listener::bind(addr, self.max_header_faults, move |conn| {
            if let Some(mgr) = mgr.upgrade() {
                mgr.adopt(conn);
            }
        })
        .await?;
        let local = listener.local_addr();
        *self.listen_addr.lock().unwrap() = Some(local);
        *self.listener.lock().unwrap() = Some(listener);
        debug!(%local, "listening");
        Ok(local)
    }

    /// The endpoint remote processes reach this one at, if listening.
    pub fn listen_endpoint(&self) -> Option<(String, u16)> {
        self.listen_addr
            .lock()
            .unwrap()
            .map(|addr| (addr.ip().to_string(), addr.port()))
    }

    /// Take ownership of an accepted connection and route its envelopes.
    fn adopt(&self, conn: Arc<Connection>) {
        self.track(&conn);
        let mgr = self.weak_self.clone();
        let routed = Arc::clone(&conn);
        conn.start_read(move |data| {
            if let Some(mgr) = mgr.upgrade() {
                mgr.route(&routed, data);
            }
        });
    }

    /// Add to the inventory and remove again when the connection dies.
    fn track(&self, conn: &Arc<Connection>) {
        self.connections.lock().unwrap().push(Arc::clone(conn));
        let mgr = self.weak_self.clone();
        let id = conn.id();
        conn.on_shutdown(move || {
            if let Some(mgr) = mgr.upgrade() {
                mgr.remove_by_id(id);
            }
        });
    }

    /// Register an externally created connection (a transport data link).
    pub(crate) fn track_data_link(&self, conn: &Arc<Connection>) {
        self.track(conn);
    }

    /// Dispatch one inbound control envelope.
    fn route(&self, conn: &Arc<Connection>, data: Vec<u8>) {
        if data.is_empty() {
            // Degraded frame, already logged by the connection.
            return;
        }
        let env = match Envelope::decode(&data) {
            Ok(env) => env,
            Err(e) => {
                warn!(conn = conn.id(), error = %e, "unparseable control envelope");
                return;
            }
        };
        let Some(topics) = self.topics() else {
            warn!(conn = conn.id(), "control envelope before routing is wired");
            return;
        };

        match env.op {
            EnvelopeOp::Hello => {
                debug!(conn = conn.id(), host = %env.host, port = env.port, "peer registered");
                self.peers
                    .lock()
                    .unwrap()
                    .insert(endpoint_key(&env.host, env.port), Arc::clone(conn));
                for adv in topics.local_advertisements() {
                    conn.enqueue(&adv.encode());
                }
            }
            EnvelopeOp::Advertise => {
                // May open a data link, so it runs as its own task.
                tokio::spawn(async move {
                    topics.handle_remote_advertise(env).await;
                });
            }
            EnvelopeOp::Subscribe => topics.connect_remote_subscriber(&env, conn),
            EnvelopeOp::Unsubscribe => {
                topics.disconnect_remote_subscriber(&env, Some(conn.id()));
            }
        }
    }

    /// Create or reuse the control link to a remote process and register
    /// this process as a peer there.
    pub async fn connect_peer(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let key = endpoint_key(host, port);
        if let Some(existing) = self.peers.lock().unwrap().get(&key) {
            if existing.is_open() {
                return Ok(Arc::clone(existing));
            }
        }

        let conn = Connection::connect_with(host, port, self.max_header_faults).await?;
        self.track(&conn);
        self.peers.lock().unwrap().insert(key, Arc::clone(&conn));

        if let Some((local_host, local_port)) = self.listen_endpoint() {
            conn.enqueue(&Envelope::hello(local_host, local_port).encode());
        }

        let mgr = self.weak_self.clone();
        let routed = Arc::clone(&conn);
        conn.start_read(move |data| {
            if let Some(mgr) = mgr.upgrade() {
                mgr.route(&routed, data);
            }
        });
        Ok(conn)
    }

    /// Request a topic's message stream: send a subscribe envelope on
    /// the connection to the remote publisher, flushed before data is
    /// expected back.
    pub async fn subscribe(
        &self,
        conn: &Connection,
        topic: &str,
        msg_type: &str,
    ) -> Result<(), ConnectionError> {
        let env = Self::control_envelope(EnvelopeOp::Subscribe, conn, topic, msg_type);
        conn.send(&env.encode()).await
    }

    /// Withdraw a topic subscription: enqueue an unsubscribe envelope on
    /// the connection the stream arrives on.
    pub fn unsubscribe(&self, conn: &Connection, topic: &str, msg_type: &str) {
        let env = Self::control_envelope(EnvelopeOp::Unsubscribe, conn, topic, msg_type);
        conn.enqueue(&env.encode());
    }

    /// An envelope identifying this end of `conn` as the subscriber.
    fn control_envelope(op: EnvelopeOp, conn: &Connection, topic: &str, msg_type: &str) -> Envelope {
        Envelope::new(
            op,
            topic,
            msg_type,
            conn.local_addr().ip().to_string(),
            conn.local_addr().port(),
        )
    }

    /// Fan an advertise envelope out to every registered peer.
    pub fn advertise(&self, env: &Envelope) {
        let bytes = env.encode();
        let mut peers = self.peers.lock().unwrap();
        peers.retain(|_, conn| conn.is_open());
        for conn in peers.values() {
            conn.enqueue(&bytes);
        }
    }

    /// Remove a connection from the bookkeeping. Does not close it; the
    /// connection owns its own lifecycle via the shutdown signal.
    pub fn remove_connection(&self, conn: &Connection) {
        self.remove_by_id(conn.id());
    }

    fn remove_by_id(&self, id: u32) {
        self.connections.lock().unwrap().retain(|c| c.id() != id);
        self.peers.lock().unwrap().retain(|_, c| c.id() != id);
    }

    /// Number of tracked connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Stop listening and shut every tracked connection down.
    pub fn fini(&self) {
        if let Some(listener) = self.listener.lock().unwrap().take() {
            listener.shutdown();
        }
        let conns: Vec<_> = self.connections.lock().unwrap().drain(..).collect();
        for conn in conns {
            conn.shutdown();
        }
        self.peers.lock().unwrap().clear();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connection_count())
            .field("listen_addr", &*self.listen_addr.lock().unwrap())
            .finish()
    }
}
