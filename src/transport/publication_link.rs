//! Inbound link from one remote publisher.
//!
//! A [`PublicationTransport`] bridges the framed stream arriving on one
//! connection into the topic registry's dispatch path for exactly one
//! (topic, remote publisher) pair. It sends the subscribe envelope when
//! initialized and withdraws the subscription when dropped.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::connection::{Connection, ShutdownHandle};
use super::manager::ConnectionManager;
use crate::core::ConnectionError;

static ID_COUNTER: AtomicU32 = AtomicU32::new(0);

type PublishCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Reader side of one remote publication.
pub struct PublicationTransport {
    id: u32,
    weak_self: std::sync::Weak<Self>,
    topic: String,
    msg_type: String,
    connection: Mutex<Option<Arc<Connection>>>,
    shutdown_handle: Mutex<Option<ShutdownHandle>>,
    callback: Mutex<Option<PublishCallback>>,
    manager: Arc<ConnectionManager>,
}

impl PublicationTransport {
    /// Create a transport for one (topic, message type) stream.
    ///
    /// The caller is expected to have registered the publication with
    /// the topic registry (`update_publications`) before data flows.
    pub(crate) fn new(topic: &str, msg_type: &str, manager: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id: ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            weak_self: weak.clone(),
            topic: topic.to_owned(),
            msg_type: msg_type.to_owned(),
            connection: Mutex::new(None),
            shutdown_handle: Mutex::new(None),
            callback: Mutex::new(None),
            manager,
        })
    }

    /// Sequential transport id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Topic this transport feeds.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Message type of the stream.
    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    /// The connection to the remote publisher, if initialized.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().unwrap().clone()
    }

    /// Register the callback that receives each raw message.
    pub(crate) fn add_callback<F>(&self, cb: F)
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        *self.callback.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Send the subscribe envelope and start reading the message stream.
    pub(crate) async fn init(&self, conn: Arc<Connection>) -> Result<(), ConnectionError> {
        *self.connection.lock().unwrap() = Some(Arc::clone(&conn));

        self.manager
            .subscribe(&conn, &self.topic, &self.msg_type)
            .await?;

        let topic = self.topic.clone();
        let handle = conn.on_shutdown(move || {
            debug!(%topic, "publication transport connection shut down");
        });
        *self.shutdown_handle.lock().unwrap() = Some(handle);

        let me = self.weak_self.clone();
        conn.start_read(move |data| {
            if let Some(transport) = me.upgrade() {
                transport.on_publish(data);
            }
        });
        Ok(())
    }

    /// One message arrived from the remote publisher. An empty payload
    /// is a no-op, not an error.
    fn on_publish(&self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let cb = self.callback.lock().unwrap().clone();
        match cb {
            Some(cb) => cb(data),
            None => warn!(topic = %self.topic, "message dropped, no callback registered"),
        }
    }

    /// Cancel the connection and release ownership without sending an
    /// unsubscribe (the peer is gone or being torn down wholesale).
    pub(crate) fn fini(&self) {
        if let Some(conn) = self.connection.lock().unwrap().take() {
            if let Some(handle) = self.shutdown_handle.lock().unwrap().take() {
                conn.disconnect_shutdown(handle);
            }
            conn.cancel();
            self.manager.remove_connection(&conn);
        }
    }
}

impl Drop for PublicationTransport {
    fn drop(&mut self) {
        let conn = self.connection.lock().unwrap().take();
        if let Some(conn) = conn {
            if let Some(handle) = self.shutdown_handle.lock().unwrap().take() {
                conn.disconnect_shutdown(handle);
            }
            if conn.is_open() {
                self.manager.unsubscribe(&conn, &self.topic, &self.msg_type);
            }
            conn.cancel();
            self.manager.remove_connection(&conn);
        }
        self.callback.lock().unwrap().take();
    }
}

impl std::fmt::Debug for PublicationTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicationTransport")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("msg_type", &self.msg_type)
            .finish()
    }
}
