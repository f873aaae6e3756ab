//! Per-topic publication record.
//!
//! One [`Publication`] exists per advertised topic in a process. It knows
//! the topic's established message type, the local nodes subscribed to
//! it, the remote subscriber connections attached by inbound subscribe
//! envelopes, and the latched message when latching is enabled.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::node::Node;
use crate::transport::Connection;

static ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A remote subscriber: the connection its subscribe envelope arrived
/// on, plus the endpoint it identified itself with.
struct RemoteSubscriber {
    host: String,
    port: u16,
    conn: Arc<Connection>,
}

/// Record of one advertised topic.
pub struct Publication {
    id: u32,
    topic: String,
    msg_type: String,
    latch: AtomicBool,
    latched: Mutex<Option<Vec<u8>>>,
    local_subs: Mutex<Vec<Weak<Node>>>,
    remote_subs: Mutex<Vec<RemoteSubscriber>>,
    /// Live publisher handles; a publication with zero handles is
    /// remote-backed (created for an inbound stream).
    handles: AtomicUsize,
}

impl Publication {
    pub(crate) fn new(topic: &str, msg_type: &str) -> Self {
        Self {
            id: ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            topic: topic.to_owned(),
            msg_type: msg_type.to_owned(),
            latch: AtomicBool::new(false),
            latched: Mutex::new(None),
            local_subs: Mutex::new(Vec::new()),
            remote_subs: Mutex::new(Vec::new()),
            handles: AtomicUsize::new(0),
        }
    }

    /// Sequential publication id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Canonical topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Message type this topic is bound to.
    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    /// Does any publisher latch on this topic?
    pub fn is_latched(&self) -> bool {
        self.latch.load(Ordering::SeqCst)
    }

    pub(crate) fn enable_latch(&self) {
        self.latch.store(true, Ordering::SeqCst);
    }

    pub(crate) fn add_handle(&self) {
        self.handles.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn remove_handle(&self) {
        self.handles.fetch_sub(1, Ordering::SeqCst);
    }

    /// Does a local publisher handle still exist?
    pub fn has_local_publisher(&self) -> bool {
        self.handles.load(Ordering::SeqCst) > 0
    }

    /// Fan one serialized message out to every subscriber.
    ///
    /// Local nodes get the bytes queued for their next
    /// `process_incoming`; remote subscribers get the frame appended to
    /// their connection's write queue. Dead entries are pruned as a side
    /// effect.
    pub(crate) fn publish_raw(&self, data: &[u8]) {
        if self.is_latched() {
            *self.latched.lock().unwrap() = Some(data.to_vec());
        }

        {
            let mut subs = self.local_subs.lock().unwrap();
            subs.retain(|weak| match weak.upgrade() {
                Some(node) => {
                    node.handle_data(&self.topic, data.to_vec());
                    true
                }
                None => false,
            });
        }

        {
            let mut subs = self.remote_subs.lock().unwrap();
            subs.retain(|sub| {
                if sub.conn.is_open() {
                    sub.conn.enqueue(data);
                    true
                } else {
                    debug!(
                        topic = %self.topic,
                        host = %sub.host,
                        port = sub.port,
                        "dropping closed remote subscriber"
                    );
                    false
                }
            });
        }
    }

    /// Attach a local node. The retained latched message, if any, is
    /// queued for the node exactly once, before any later live message.
    pub(crate) fn add_local_sub(&self, node: &Arc<Node>) {
        let mut subs = self.local_subs.lock().unwrap();
        if subs
            .iter()
            .any(|w| w.upgrade().is_some_and(|n| n.id() == node.id()))
        {
            return;
        }
        if let Some(latched) = self.latched.lock().unwrap().as_ref() {
            node.handle_data(&self.topic, latched.clone());
        }
        subs.push(Arc::downgrade(node));
    }

    pub(crate) fn remove_local_sub(&self, node_id: u32) {
        self.local_subs
            .lock()
            .unwrap()
            .retain(|w| w.upgrade().is_some_and(|n| n.id() != node_id));
    }

    /// Attach a remote subscriber connection. The latched message, if
    /// any, is enqueued before the connection sees live traffic.
    pub(crate) fn add_remote_sub(&self, host: &str, port: u16, conn: Arc<Connection>) {
        let mut subs = self.remote_subs.lock().unwrap();
        if let Some(latched) = self.latched.lock().unwrap().as_ref() {
            conn.enqueue(latched);
        }
        debug!(topic = %self.topic, %host, port, "remote subscriber attached");
        subs.push(RemoteSubscriber {
            host: host.to_owned(),
            port,
            conn,
        });
    }

    /// Detach a remote subscriber, matched by its connection or the
    /// endpoint named in the unsubscribe envelope.
    pub(crate) fn remove_remote_sub(&self, host: &str, port: u16, conn_id: Option<u32>) {
        self.remote_subs.lock().unwrap().retain(|sub| {
            let by_conn = conn_id.is_some_and(|id| sub.conn.id() == id);
            let by_endpoint = sub.host == host && sub.port == port;
            !(by_conn || by_endpoint)
        });
    }

    /// Number of attached remote subscribers.
    pub fn remote_sub_count(&self) -> usize {
        self.remote_subs.lock().unwrap().len()
    }

    /// The latched message, if one is retained.
    pub(crate) fn latched_msg(&self) -> Option<Vec<u8>> {
        self.latched.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for Publication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publication")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("msg_type", &self.msg_type)
            .field("latched", &self.is_latched())
            .finish()
    }
}
