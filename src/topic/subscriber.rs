//! Subscriber handle returned by `Node::subscribe`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use super::manager::TopicManager;
use crate::node::Node;

/// Handle representing one registered callback on one topic.
///
/// Releasing the handle (explicitly or by drop) unregisters the callback
/// from the owning node and withdraws the subscription from the topic
/// registry; when the last subscription on a topic goes away, the
/// topic's remote transports are finalized.
pub struct Subscriber {
    topic: String,
    callback_id: u64,
    node: Weak<Node>,
    topics: Weak<TopicManager>,
    released: AtomicBool,
}

impl Subscriber {
    pub(crate) fn new(
        topic: String,
        callback_id: u64,
        node: Weak<Node>,
        topics: Weak<TopicManager>,
    ) -> Self {
        Self {
            topic,
            callback_id,
            node,
            topics,
            released: AtomicBool::new(false),
        }
    }

    /// Canonical topic name this handle subscribes to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Release the subscription.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(node) = self.node.upgrade() {
            node.remove_callback(&self.topic, self.callback_id);
            if let Some(topics) = self.topics.upgrade() {
                topics.unsubscribe(&self.topic, node.id(), self.callback_id);
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic)
            .field("callback_id", &self.callback_id)
            .finish()
    }
}
