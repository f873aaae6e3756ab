//! Publisher handles.
//!
//! [`Publisher<M>`] is the typed handle an application publishes with.
//! Underneath sits an untyped core shared with the owning node: a
//! bounded pending queue plus a flush path into the topic's
//! [`Publication`](super::Publication). Publishing flushes inline when
//! the flush lock is free; the pending queue only buffers messages that
//! raced a concurrent flush and is drained by the node's
//! `process_publishers` tick.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::publication::Publication;
use crate::core::Message;

/// Untyped publisher state, retained by the owning node for its
/// `process_publishers` loop.
pub(crate) struct PublisherCore {
    publication: Arc<Publication>,
    queue_limit: usize,
    latch: bool,
    pending: Mutex<VecDeque<Vec<u8>>>,
    /// Serializes flushes so per-publisher ordering holds even when
    /// `publish` and `process_publishers` run on different threads.
    flushing: Mutex<()>,
}

impl PublisherCore {
    pub(crate) fn new(publication: Arc<Publication>, queue_limit: usize, latch: bool) -> Self {
        publication.add_handle();
        Self {
            publication,
            queue_limit,
            latch,
            pending: Mutex::new(VecDeque::new()),
            flushing: Mutex::new(()),
        }
    }

    /// Queue one serialized message, dropping the oldest entry when the
    /// queue limit is hit, then flush unless another thread already is.
    pub(crate) fn publish_raw(&self, data: Vec<u8>) {
        {
            let mut pending = self.pending.lock().unwrap();
            if self.queue_limit > 0 && pending.len() >= self.queue_limit {
                pending.pop_front();
                warn!(
                    topic = %self.publication.topic(),
                    limit = self.queue_limit,
                    "publisher queue full, dropping oldest message"
                );
            }
            pending.push_back(data);
        }
        if let Ok(guard) = self.flushing.try_lock() {
            self.drain(&guard);
        }
    }

    /// Flush everything pending, in order. Invoked from the owning
    /// node's `process_publishers`.
    pub(crate) fn flush(&self) {
        let guard = self.flushing.lock().unwrap();
        self.drain(&guard);
    }

    fn drain(&self, _guard: &std::sync::MutexGuard<'_, ()>) {
        loop {
            let next = self.pending.lock().unwrap().pop_front();
            match next {
                Some(data) => self.publication.publish_raw(&data),
                None => break,
            }
        }
    }

    pub(crate) fn topic(&self) -> &str {
        self.publication.topic()
    }

    pub(crate) fn is_latched(&self) -> bool {
        self.latch
    }
}

impl Drop for PublisherCore {
    fn drop(&mut self) {
        self.publication.remove_handle();
    }
}

/// Typed handle for publishing on one topic.
///
/// Obtained from `Node::advertise`. Cloning yields another handle onto
/// the same queue; the underlying publication record is shared with any
/// other publisher of the same (topic, type) pair.
pub struct Publisher<M: Message> {
    core: Arc<PublisherCore>,
    _marker: PhantomData<fn(M)>,
}

impl<M: Message> Publisher<M> {
    pub(crate) fn new(core: Arc<PublisherCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    pub(crate) fn core(&self) -> Arc<PublisherCore> {
        Arc::clone(&self.core)
    }

    /// Serialize and publish one message.
    pub fn publish(&self, msg: &M) {
        self.core.publish_raw(msg.encode());
    }

    /// Canonical topic name this handle publishes on.
    pub fn topic(&self) -> &str {
        self.core.topic()
    }

    /// Does this handle latch its most recent message?
    pub fn is_latched(&self) -> bool {
        self.core.is_latched()
    }
}

impl<M: Message> Clone for Publisher<M> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<M: Message> std::fmt::Debug for Publisher<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic())
            .field("msg_type", &M::TYPE_NAME)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_core(queue_limit: usize) -> PublisherCore {
        let publication = Arc::new(Publication::new("/test/queue", "test.text.v1"));
        PublisherCore::new(publication, queue_limit, false)
    }

    #[test]
    fn test_queue_limit_drops_oldest() {
        let core = test_core(2);
        // Park the flush path so messages accumulate.
        let guard = core.flushing.lock().unwrap();
        core.publish_raw(b"one".to_vec());
        core.publish_raw(b"two".to_vec());
        core.publish_raw(b"three".to_vec());

        let pending: Vec<Vec<u8>> = core.pending.lock().unwrap().iter().cloned().collect();
        assert_eq!(pending, vec![b"two".to_vec(), b"three".to_vec()]);
        drop(guard);
    }

    #[test]
    fn test_zero_limit_is_unbounded() {
        let core = test_core(0);
        let guard = core.flushing.lock().unwrap();
        for i in 0..100u32 {
            core.publish_raw(i.to_le_bytes().to_vec());
        }
        assert_eq!(core.pending.lock().unwrap().len(), 100);
        drop(guard);
    }

    #[test]
    fn test_publish_flushes_inline() {
        let core = test_core(1);
        core.publish_raw(b"inline".to_vec());
        assert!(core.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handle_count_tracks_publisher_lifetime() {
        let publication = Arc::new(Publication::new("/test/handles", "test.text.v1"));
        assert!(!publication.has_local_publisher());
        let a = PublisherCore::new(Arc::clone(&publication), 1, false);
        let b = PublisherCore::new(Arc::clone(&publication), 1, false);
        assert!(publication.has_local_publisher());
        drop(a);
        assert!(publication.has_local_publisher());
        drop(b);
        assert!(!publication.has_local_publisher());
    }
}
