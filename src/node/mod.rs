//! User-facing pub/sub handle.
//!
//! A [`Node`] advertises and subscribes to topics on behalf of one
//! application component, resolving topic names against its namespace
//! and demultiplexing inbound messages to typed callback handlers. The
//! owning component drives delivery by calling
//! [`process_incoming`](Node::process_incoming) and
//! [`process_publishers`](Node::process_publishers) once per tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::core::{Message, RegistrationError};
use crate::topic::{
    CallbackHandler, Publisher, SubscribeOptions, Subscriber, TopicManager, TypedCallback,
};
use crate::topic::publisher::PublisherCore;

static ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Per-component handle for publishing and subscribing.
pub struct Node {
    id: u32,
    weak_self: std::sync::Weak<Self>,
    namespace: String,
    topics: Arc<TopicManager>,
    publishers: Mutex<Vec<Arc<PublisherCore>>>,
    callbacks: Mutex<HashMap<String, Vec<(u64, Arc<dyn CallbackHandler>)>>>,
    incoming: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    callback_seq: AtomicU64,
}

impl Node {
    /// Create a node bound to a topic namespace.
    pub(crate) fn new(topics: Arc<TopicManager>, namespace: &str) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id: ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            weak_self: weak.clone(),
            namespace: namespace.trim_matches('/').to_owned(),
            topics,
            publishers: Mutex::new(Vec::new()),
            callbacks: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
            callback_seq: AtomicU64::new(0),
        })
    }

    /// Unique node id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The topic namespace this node resolves names under.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resolve a topic name to its canonical form.
    ///
    /// Absolute names (`/world/pose`) pass through; `~/pose` and bare
    /// `pose` resolve under the node namespace. Every registration and
    /// lookup uses the canonical form.
    pub fn resolve_topic(&self, topic: &str) -> Result<String, RegistrationError> {
        if topic.is_empty() {
            return Err(RegistrationError::EmptyTopic);
        }
        if let Some(absolute) = topic.strip_prefix('/') {
            if absolute.is_empty() {
                return Err(RegistrationError::EmptyTopic);
            }
            return Ok(topic.to_owned());
        }
        let relative = topic.strip_prefix("~/").unwrap_or(topic);
        if relative.is_empty() {
            return Err(RegistrationError::EmptyTopic);
        }
        if self.namespace.is_empty() {
            Ok(format!("/{relative}"))
        } else {
            Ok(format!("/{}/{relative}", self.namespace))
        }
    }

    /// Shorten a canonical topic name relative to this node's namespace.
    pub fn relative_topic(&self, canonical: &str) -> String {
        if self.namespace.is_empty() {
            return canonical.to_owned();
        }
        match canonical.strip_prefix(&format!("/{}/", self.namespace)) {
            Some(rest) => format!("~/{rest}"),
            None => canonical.to_owned(),
        }
    }

    /// Advertise a topic and retain the publisher for the flush loop.
    ///
    /// A `queue_limit` of zero means unbounded; with `latch` the most
    /// recent message is replayed to late-joining subscribers.
    pub fn advertise<M: Message>(
        &self,
        topic: &str,
        queue_limit: usize,
        latch: bool,
    ) -> Result<Publisher<M>, RegistrationError> {
        let canonical = self.resolve_topic(topic)?;
        let publisher = self.topics.advertise::<M>(&canonical, queue_limit, latch)?;
        self.publishers.lock().unwrap().push(publisher.core());
        Ok(publisher)
    }

    /// Subscribe to a topic with a typed callback.
    ///
    /// The callback runs during [`process_incoming`](Node::process_incoming)
    /// on the calling thread. Dropping the returned [`Subscriber`]
    /// unregisters it.
    pub async fn subscribe<M, F>(
        &self,
        topic: &str,
        callback: F,
        latching: bool,
    ) -> Result<Subscriber, RegistrationError>
    where
        M: Message,
        F: Fn(M) + Send + Sync + 'static,
    {
        let canonical = self.resolve_topic(topic)?;
        let callback_id = self.callback_seq.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .unwrap()
            .entry(canonical.clone())
            .or_default()
            .push((callback_id, Arc::new(TypedCallback::new(callback))));

        // Nodes only exist behind an Arc, so the self-handle is live for
        // the duration of the call.
        let this = self
            .weak_self
            .upgrade()
            .expect("node handle is alive during subscribe");
        let ops = SubscribeOptions::for_message::<M>(canonical.clone(), latching);
        match self.topics.subscribe(ops, &this, callback_id).await {
            Ok(subscriber) => Ok(subscriber),
            Err(e) => {
                self.remove_callback(&canonical, callback_id);
                Err(e)
            }
        }
    }

    /// Queue inbound serialized bytes for a topic.
    pub(crate) fn handle_data(&self, topic: &str, data: Vec<u8>) {
        self.incoming
            .lock()
            .unwrap()
            .entry(topic.to_owned())
            .or_default()
            .push(data);
    }

    /// Drain queued inbound messages to the registered callbacks.
    ///
    /// Each callback deserializes to its own message type; a decode
    /// failure fails only that callback and is logged, the remaining
    /// callbacks still run. Invoke once per tick from the owning thread;
    /// not reentrant for the same node.
    pub fn process_incoming(&self) {
        let drained: HashMap<String, Vec<Vec<u8>>> =
            std::mem::take(&mut *self.incoming.lock().unwrap());
        for (topic, messages) in drained {
            // Snapshot so a callback may subscribe without deadlocking.
            let handlers: Vec<Arc<dyn CallbackHandler>> = self
                .callbacks
                .lock()
                .unwrap()
                .get(&topic)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default();
            for data in messages {
                for handler in &handlers {
                    if let Err(e) = handler.invoke(&data) {
                        warn!(
                            %topic,
                            msg_type = handler.msg_type(),
                            error = %e,
                            "subscriber callback failed to decode message"
                        );
                    }
                }
            }
        }
    }

    /// Flush every retained publisher's pending queue.
    ///
    /// Invoke once per tick from the owning thread.
    pub fn process_publishers(&self) {
        let publishers: Vec<Arc<PublisherCore>> = self.publishers.lock().unwrap().clone();
        for publisher in publishers {
            publisher.flush();
        }
    }

    /// Message type established for a topic, if any publisher is known.
    pub fn msg_type(&self, topic: &str) -> Option<String> {
        let canonical = self.resolve_topic(topic).ok()?;
        self.topics
            .publication(&canonical)
            .map(|p| p.msg_type().to_owned())
    }

    /// Unregister one callback. Part of [`Subscriber`] release.
    pub(crate) fn remove_callback(&self, topic: &str, callback_id: u64) {
        let mut callbacks = self.callbacks.lock().unwrap();
        if let Some(list) = callbacks.get_mut(topic) {
            list.retain(|(id, _)| *id != callback_id);
            if list.is_empty() {
                callbacks.remove(topic);
            }
        }
    }

    /// Release the node's publishers and callback table.
    ///
    /// Outstanding [`Subscriber`] handles should be released first.
    pub fn fini(&self) {
        self.publishers.lock().unwrap().clear();
        self.callbacks.lock().unwrap().clear();
        self.incoming.lock().unwrap().clear();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{CounterMsg, TextMsg};
    use crate::transport::ConnectionManager;
    use std::sync::atomic::AtomicUsize;

    fn test_node(namespace: &str) -> Arc<Node> {
        Node::new(TopicManager::new(ConnectionManager::new(3)), namespace)
    }

    #[test]
    fn test_topic_name_resolution() {
        let node = test_node("robot1");
        assert_eq!(node.resolve_topic("/world/pose").unwrap(), "/world/pose");
        assert_eq!(node.resolve_topic("~/cmd").unwrap(), "/robot1/cmd");
        assert_eq!(node.resolve_topic("cmd").unwrap(), "/robot1/cmd");
        assert!(node.resolve_topic("").is_err());
        assert!(node.resolve_topic("/").is_err());

        assert_eq!(node.relative_topic("/robot1/cmd"), "~/cmd");
        assert_eq!(node.relative_topic("/world/pose"), "/world/pose");
    }

    #[test]
    fn test_empty_namespace_resolution() {
        let node = test_node("");
        assert_eq!(node.resolve_topic("pose").unwrap(), "/pose");
        assert_eq!(node.resolve_topic("~/pose").unwrap(), "/pose");
    }

    #[tokio::test]
    async fn test_process_incoming_dispatches_to_callbacks() {
        let node = test_node("sim");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = node
            .subscribe("~/chat", move |msg: TextMsg| s.lock().unwrap().push(msg.0), false)
            .await
            .unwrap();

        node.handle_data("/sim/chat", b"one".to_vec());
        node.handle_data("/sim/chat", b"two".to_vec());
        node.process_incoming();

        assert_eq!(*seen.lock().unwrap(), vec!["one".to_owned(), "two".to_owned()]);
    }

    #[tokio::test]
    async fn test_decode_failure_is_isolated_per_callback() {
        let node = test_node("sim");
        let good = Arc::new(AtomicUsize::new(0));
        let bad = Arc::new(AtomicUsize::new(0));

        let g = Arc::clone(&good);
        let _text = node
            .subscribe("~/mixed", move |_msg: TextMsg| {
                g.fetch_add(1, Ordering::SeqCst);
            }, false)
            .await
            .unwrap();
        // Same topic, stricter type: five bytes will not decode.
        let b = Arc::clone(&bad);
        let _counter = node
            .subscribe("~/mixed", move |_msg: CounterMsg| {
                b.fetch_add(1, Ordering::SeqCst);
            }, false)
            .await
            .unwrap();

        node.handle_data("/sim/mixed", b"hello".to_vec());
        node.process_incoming();

        assert_eq!(good.load(Ordering::SeqCst), 1);
        assert_eq!(bad.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscriber_drop_unregisters_callback() {
        let node = test_node("sim");
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = node
            .subscribe("~/t", move |_msg: TextMsg| {
                c.fetch_add(1, Ordering::SeqCst);
            }, false)
            .await
            .unwrap();

        node.handle_data("/sim/t", b"a".to_vec());
        node.process_incoming();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(sub);
        node.handle_data("/sim/t", b"b".to_vec());
        node.process_incoming();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
