//! Process-wide topic registry.
//!
//! Maps canonical topic names to local publication records, local
//! subscription records, known remote publications, and the publication
//! transports streaming from remote publishers. Every advertise,
//! subscribe, and lookup serializes on the registry's internal locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use super::publication::Publication;
use super::publisher::{Publisher, PublisherCore};
use super::subscriber::Subscriber;
use crate::core::{Message, RegistrationError};
use crate::node::Node;
use crate::transport::{Connection, ConnectionManager, PublicationTransport};
use crate::wire::{Envelope, EnvelopeOp};

/// Options describing one subscription request.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Canonical topic name.
    pub topic: String,
    /// Message type the subscriber expects.
    pub msg_type: String,
    /// Whether the subscriber asks for the retained latched message.
    pub latching: bool,
}

impl SubscribeOptions {
    /// Build options for a concrete message type.
    pub fn for_message<M: Message>(topic: impl Into<String>, latching: bool) -> Self {
        Self {
            topic: topic.into(),
            msg_type: M::TYPE_NAME.to_owned(),
            latching,
        }
    }
}

struct SubscriptionRecord {
    sub_id: u64,
    node_id: u32,
    node: Weak<Node>,
}

struct RemotePublication {
    msg_type: String,
    host: String,
    port: u16,
}

/// Registry of every topic this process publishes or subscribes to.
pub struct TopicManager {
    weak_self: Weak<Self>,
    connections: Arc<ConnectionManager>,
    publications: Mutex<HashMap<String, Arc<Publication>>>,
    subscriptions: Mutex<HashMap<String, Vec<SubscriptionRecord>>>,
    remote_pubs: Mutex<HashMap<String, Vec<RemotePublication>>>,
    /// Zero or one transport per (topic, remote publisher endpoint).
    transports: Mutex<HashMap<(String, String), Arc<PublicationTransport>>>,
}

impl TopicManager {
    /// Create a registry routing through the given connection manager.
    pub fn new(connections: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            connections,
            publications: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            remote_pubs: Mutex::new(HashMap::new()),
            transports: Mutex::new(HashMap::new()),
        })
    }

    /// Register a local publisher for `topic`.
    ///
    /// Duplicate advertisements of the same (topic, type) pair share one
    /// publication record; the returned handles are independent. A
    /// `queue_limit` of zero means unbounded.
    pub fn advertise<M: Message>(
        &self,
        topic: &str,
        queue_limit: usize,
        latch: bool,
    ) -> Result<Publisher<M>, RegistrationError> {
        if topic.is_empty() {
            return Err(RegistrationError::EmptyTopic);
        }
        self.check_type(topic, M::TYPE_NAME)?;

        let publication = self.update_publications(topic, M::TYPE_NAME);
        if latch {
            publication.enable_latch();
        }

        // Attach nodes that subscribed before the topic was advertised.
        if let Some(records) = self.subscriptions.lock().unwrap().get(topic) {
            for record in records {
                if let Some(node) = record.node.upgrade() {
                    publication.add_local_sub(&node);
                }
            }
        }

        if let Some((host, port)) = self.connections.listen_endpoint() {
            self.connections.advertise(&Envelope::new(
                EnvelopeOp::Advertise,
                topic,
                M::TYPE_NAME,
                host,
                port,
            ));
        }

        let core = Arc::new(PublisherCore::new(publication, queue_limit, latch));
        Ok(Publisher::new(core))
    }

    /// Get or create the publication record for a topic.
    ///
    /// Called whenever a publisher appears, locally or remotely; later
    /// identical registrations reuse the first record.
    pub fn update_publications(&self, topic: &str, msg_type: &str) -> Arc<Publication> {
        let mut pubs = self.publications.lock().unwrap();
        if let Some(existing) = pubs.get(topic) {
            if existing.msg_type() != msg_type {
                warn!(
                    %topic,
                    established = existing.msg_type(),
                    offered = msg_type,
                    "ignoring advertisement with mismatched message type"
                );
            }
            return Arc::clone(existing);
        }
        let publication = Arc::new(Publication::new(topic, msg_type));
        debug!(%topic, %msg_type, id = publication.id(), "publication created");
        pubs.insert(topic.to_owned(), Arc::clone(&publication));
        publication
    }

    /// Register a subscription for a node and link it to any known
    /// publishers, local or remote.
    pub async fn subscribe(
        &self,
        ops: SubscribeOptions,
        node: &Arc<Node>,
        callback_id: u64,
    ) -> Result<Subscriber, RegistrationError> {
        if ops.topic.is_empty() {
            return Err(RegistrationError::EmptyTopic);
        }
        self.check_type(&ops.topic, &ops.msg_type)?;

        self.subscriptions
            .lock()
            .unwrap()
            .entry(ops.topic.clone())
            .or_default()
            .push(SubscriptionRecord {
                sub_id: callback_id,
                node_id: node.id(),
                node: Arc::downgrade(node),
            });

        // Local publication: attach directly (replays a latched message
        // once, before live traffic).
        let publication = self.publications.lock().unwrap().get(&ops.topic).cloned();
        if let Some(publication) = publication {
            publication.add_local_sub(node);
        }

        // Remote publications: one transport per publisher endpoint.
        let remotes: Vec<(String, String, u16)> = self
            .remote_pubs
            .lock()
            .unwrap()
            .get(&ops.topic)
            .map(|list| {
                list.iter()
                    .map(|r| (r.msg_type.clone(), r.host.clone(), r.port))
                    .collect()
            })
            .unwrap_or_default();
        for (msg_type, host, port) in remotes {
            self.ensure_transport(&ops.topic, &msg_type, &host, port).await;
        }

        Ok(Subscriber::new(
            ops.topic,
            callback_id,
            Arc::downgrade(node),
            self.weak_self.clone(),
        ))
    }

    /// Withdraw one subscription. When the last subscription on a topic
    /// goes away its transports are finalized, which sends unsubscribe
    /// envelopes to the remote publishers.
    pub fn unsubscribe(&self, topic: &str, node_id: u32, sub_id: u64) {
        let (node_gone, topic_empty) = {
            let mut subs = self.subscriptions.lock().unwrap();
            let Some(records) = subs.get_mut(topic) else {
                return;
            };
            records.retain(|r| !(r.node_id == node_id && r.sub_id == sub_id));
            let node_gone = !records.iter().any(|r| r.node_id == node_id);
            let topic_empty = records.is_empty();
            if topic_empty {
                subs.remove(topic);
            }
            (node_gone, topic_empty)
        };

        if node_gone {
            if let Some(publication) = self.publications.lock().unwrap().get(topic) {
                publication.remove_local_sub(node_id);
            }
        }
        if topic_empty {
            let dropped: Vec<Arc<PublicationTransport>> = {
                let mut transports = self.transports.lock().unwrap();
                let keys: Vec<_> = transports
                    .keys()
                    .filter(|(t, _)| t == topic)
                    .cloned()
                    .collect();
                keys.into_iter()
                    .filter_map(|k| transports.remove(&k))
                    .collect()
            };
            for transport in dropped {
                debug!(%topic, id = transport.id(), "finalizing publication transport");
            }
        }
    }

    /// A remote process advertised a publication.
    pub(crate) async fn handle_remote_advertise(&self, env: Envelope) {
        if env.topic.is_empty() {
            warn!("advertise envelope without a topic");
            return;
        }
        {
            let mut remotes = self.remote_pubs.lock().unwrap();
            let list = remotes.entry(env.topic.clone()).or_default();
            if list
                .iter()
                .any(|r| r.host == env.host && r.port == env.port)
            {
                // Duplicate advertisement; the existing record stands.
                return;
            }
            if let Some(first) = list.first() {
                if first.msg_type != env.msg_type {
                    warn!(
                        topic = %env.topic,
                        established = %first.msg_type,
                        offered = %env.msg_type,
                        "ignoring remote advertisement with mismatched message type"
                    );
                    return;
                }
            }
            debug!(topic = %env.topic, host = %env.host, port = env.port, "remote publication");
            list.push(RemotePublication {
                msg_type: env.msg_type.clone(),
                host: env.host.clone(),
                port: env.port,
            });
        }

        let wanted = self
            .subscriptions
            .lock()
            .unwrap()
            .get(&env.topic)
            .is_some_and(|records| !records.is_empty());
        if wanted {
            self.ensure_transport(&env.topic, &env.msg_type, &env.host, env.port)
                .await;
        }
    }

    /// Establish the transport for one (topic, remote endpoint) pair if
    /// it does not already exist.
    async fn ensure_transport(&self, topic: &str, msg_type: &str, host: &str, port: u16) {
        let key = (topic.to_owned(), format!("{host}:{port}"));
        if self.transports.lock().unwrap().contains_key(&key) {
            return;
        }

        let transport = PublicationTransport::new(topic, msg_type, Arc::clone(&self.connections));
        self.update_publications(topic, msg_type);

        let me = self.weak_self.clone();
        let dispatch_topic = topic.to_owned();
        transport.add_callback(move |data| {
            if let Some(topics) = me.upgrade() {
                topics.dispatch(&dispatch_topic, &data);
            }
        });

        let conn = match Connection::connect_with(
            host,
            port,
            self.connections.max_header_faults(),
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%topic, %host, port, error = %e, "cannot reach remote publisher");
                return;
            }
        };
        self.connections.track_data_link(&conn);

        let me = self.weak_self.clone();
        let removal_key = key.clone();
        conn.on_shutdown(move || {
            if let Some(topics) = me.upgrade() {
                topics.remove_transport(&removal_key);
            }
        });

        if let Err(e) = transport.init(conn).await {
            warn!(%topic, %host, port, error = %e, "publication transport init failed");
            return;
        }

        // The loser of a concurrent-subscribe race must drop outside the
        // lock: its teardown re-enters the transport map.
        let loser = {
            let mut transports = self.transports.lock().unwrap();
            if transports.contains_key(&key) {
                Some(transport)
            } else {
                transports.insert(key, transport);
                None
            }
        };
        drop(loser);
    }

    fn remove_transport(&self, key: &(String, String)) {
        if self.transports.lock().unwrap().remove(key).is_some() {
            debug!(topic = %key.0, remote = %key.1, "publication transport removed");
        }
    }

    /// Fan raw bytes for a topic out to every subscribed node's queue.
    pub(crate) fn dispatch(&self, topic: &str, data: &[u8]) {
        let mut subs = self.subscriptions.lock().unwrap();
        if let Some(records) = subs.get_mut(topic) {
            let mut delivered = Vec::new();
            records.retain(|record| match record.node.upgrade() {
                Some(node) => {
                    // A node subscribes once per callback but its queue
                    // takes each message once.
                    if !delivered.contains(&record.node_id) {
                        node.handle_data(topic, data.to_vec());
                        delivered.push(record.node_id);
                    }
                    true
                }
                None => false,
            });
        }
    }

    /// An inbound subscribe envelope: attach the connection it arrived
    /// on as a remote subscriber of the topic.
    pub(crate) fn connect_remote_subscriber(&self, env: &Envelope, conn: &Arc<Connection>) {
        let publication = self.publications.lock().unwrap().get(&env.topic).cloned();
        let Some(publication) = publication else {
            warn!(topic = %env.topic, "subscribe for a topic with no publication");
            return;
        };
        if !env.msg_type.is_empty() && publication.msg_type() != env.msg_type {
            warn!(
                topic = %env.topic,
                established = publication.msg_type(),
                requested = %env.msg_type,
                "rejecting remote subscriber with mismatched message type"
            );
            return;
        }
        publication.add_remote_sub(&env.host, env.port, Arc::clone(conn));
    }

    /// An inbound unsubscribe envelope: detach the remote subscriber.
    pub(crate) fn disconnect_remote_subscriber(&self, env: &Envelope, conn_id: Option<u32>) {
        if let Some(publication) = self.publications.lock().unwrap().get(&env.topic) {
            publication.remove_remote_sub(&env.host, env.port, conn_id);
        }
    }

    /// Advertise envelopes for every locally published topic, replayed
    /// to newly registered peers.
    pub(crate) fn local_advertisements(&self) -> Vec<Envelope> {
        let Some((host, port)) = self.connections.listen_endpoint() else {
            return Vec::new();
        };
        self.publications
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.has_local_publisher())
            .map(|p| {
                Envelope::new(
                    EnvelopeOp::Advertise,
                    p.topic(),
                    p.msg_type(),
                    host.clone(),
                    port,
                )
            })
            .collect()
    }

    /// Look up the publication record for a canonical topic name.
    pub fn publication(&self, topic: &str) -> Option<Arc<Publication>> {
        self.publications.lock().unwrap().get(topic).cloned()
    }

    /// Number of live transports (one per remote publisher stream).
    pub fn transport_count(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    /// Tear the registry down: finalize transports and drop all records.
    pub fn fini(&self) {
        // Collected first so transport teardown, which re-enters the
        // map via connection shutdown listeners, runs unlocked.
        let dropped: Vec<Arc<PublicationTransport>> = {
            let mut transports = self.transports.lock().unwrap();
            transports.drain().map(|(_, t)| t).collect()
        };
        drop(dropped);
        self.subscriptions.lock().unwrap().clear();
        self.remote_pubs.lock().unwrap().clear();
        self.publications.lock().unwrap().clear();
    }

    fn check_type(&self, topic: &str, msg_type: &str) -> Result<(), RegistrationError> {
        if let Some(publication) = self.publications.lock().unwrap().get(topic) {
            if publication.msg_type() != msg_type {
                return Err(RegistrationError::TypeMismatch {
                    topic: topic.to_owned(),
                    advertised: publication.msg_type().to_owned(),
                    requested: msg_type.to_owned(),
                });
            }
        }
        if let Some(list) = self.remote_pubs.lock().unwrap().get(topic) {
            if let Some(first) = list.first() {
                if first.msg_type != msg_type {
                    return Err(RegistrationError::TypeMismatch {
                        topic: topic.to_owned(),
                        advertised: first.msg_type.clone(),
                        requested: msg_type.to_owned(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TopicManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicManager")
            .field("publications", &self.publications.lock().unwrap().len())
            .field("subscriptions", &self.subscriptions.lock().unwrap().len())
            .field("transports", &self.transport_count())
            .finish()
    }
}
