//! Accepting side of the transport: bind a port and hand each accepted
//! socket to a callback as a fresh [`Connection`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::connection::Connection;
use crate::core::ConnectionError;

/// A bound TCP listener running an accept loop on the shared runtime.
///
/// Each accepted client produces a new [`Connection`] passed to the
/// accept callback exactly once. Dropping the listener stops the loop.
pub struct Listener {
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
}

impl Listener {
    /// Bind `addr` and start accepting.
    pub async fn bind<F>(
        addr: SocketAddr,
        max_header_faults: u32,
        accept_cb: F,
    ) -> Result<Self, ConnectionError>
    where
        F: Fn(Arc<Connection>) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ConnectionError::ConnectFailed {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let (stop_tx, mut stop_rx) = watch::channel(false);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            match Connection::from_stream(stream, max_header_faults) {
                                Ok(conn) => accept_cb(conn),
                                Err(e) => warn!(%peer, error = %e, "dropping accepted socket"),
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    },
                }
            }
            debug!(%local_addr, "listener stopped");
        });

        Ok(Self {
            local_addr,
            stop_tx,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the accept loop. Connections already accepted are unaffected.
    pub fn shutdown(&self) {
        self.stop_tx.send_replace(true);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpStream;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn test_accept_callback_once_per_client() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 3, move |_conn| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        let addr = listener.local_addr();
        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 3, |_conn| {})
            .await
            .unwrap();
        let addr = listener.local_addr();
        listener.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The OS socket is gone once the loop exits, so a fresh connect
        // either fails outright or is reset on first use.
        if let Ok(mut s) = TcpStream::connect(addr).await {
            use tokio::io::AsyncReadExt;
            let mut buf = [0u8; 1];
            let res = timeout(Duration::from_secs(1), s.read(&mut buf)).await;
            if let Ok(Ok(n)) = res {
                assert_eq!(n, 0);
            }
        }
    }
}
