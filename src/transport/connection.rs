//! Single TCP connection with length-prefixed framing.
//!
//! A [`Connection`] owns one socket and runs two independent loops on the
//! shared runtime: a writer task that drains the write queue one frame at
//! a time (at most one write in flight, so frames reach the peer in
//! enqueue order) and an optional read loop started by
//! [`Connection::start_read`] that parses the 8-byte header, reads exactly
//! that many payload bytes, and hands them to the caller.
//!
//! Socket-level errors are terminal for the connection: it transitions to
//! `Closed` and the shutdown notification fires exactly once. There is no
//! automatic reconnection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::core::ConnectionError;
use crate::wire::{HEADER_LEN, frame, parse_header};

/// Consecutive invalid/empty headers tolerated before the connection is
/// treated as unrecoverable and closed.
pub const DEFAULT_MAX_HEADER_FAULTS: u32 = 3;

static ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket established, loops not yet running.
    Connecting,
    /// Connection ready for reads and writes.
    Open,
    /// Shutdown in progress.
    Closing,
    /// Connection closed; all operations fail.
    Closed,
}

/// Handle returned by [`Connection::on_shutdown`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownHandle(u64);

struct WriteOp {
    frame: Vec<u8>,
    done: Option<oneshot::Sender<Result<(), ConnectionError>>>,
}

type ShutdownListener = Box<dyn Fn() + Send + Sync>;

/// One framed TCP connection.
pub struct Connection {
    id: u32,
    weak_self: Weak<Self>,
    state: Mutex<ConnectionState>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    write_tx: mpsc::UnboundedSender<WriteOp>,
    /// Read half, held until a read loop claims it and returned on
    /// `stop_read` so the loop can be re-armed.
    reader: Mutex<Option<OwnedReadHalf>>,
    closed_tx: watch::Sender<bool>,
    read_stop: Mutex<Option<watch::Sender<bool>>>,
    shutdown_listeners: Mutex<Vec<(u64, ShutdownListener)>>,
    shutdown_fired: AtomicBool,
    listener_seq: AtomicU64,
    max_header_faults: u32,
}

impl Connection {
    /// Connect to a remote host.
    ///
    /// On failure no connection object exists and no retry is attempted;
    /// retrying is the caller's responsibility.
    pub async fn connect(host: &str, port: u16) -> Result<Arc<Self>, ConnectionError> {
        Self::connect_with(host, port, DEFAULT_MAX_HEADER_FAULTS).await
    }

    /// Connect with an explicit header-fault tolerance.
    pub async fn connect_with(
        host: &str,
        port: u16,
        max_header_faults: u32,
    ) -> Result<Arc<Self>, ConnectionError> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ConnectionError::ConnectFailed {
                addr: addr.clone(),
                source,
            })?;
        let conn = Self::from_stream(stream, max_header_faults)?;
        debug!(id = conn.id, %addr, "connected");
        Ok(conn)
    }

    /// Wrap an established stream (outbound connect or inbound accept).
    pub(crate) fn from_stream(
        stream: TcpStream,
        max_header_faults: u32,
    ) -> Result<Arc<Self>, ConnectionError> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, mut write_half) = stream.into_split();

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WriteOp>();
        let (closed_tx, _) = watch::channel(false);

        let conn = Arc::new_cyclic(|weak| Self {
            id: ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            weak_self: weak.clone(),
            state: Mutex::new(ConnectionState::Connecting),
            local_addr,
            peer_addr,
            write_tx,
            reader: Mutex::new(Some(read_half)),
            closed_tx,
            read_stop: Mutex::new(None),
            shutdown_listeners: Mutex::new(Vec::new()),
            shutdown_fired: AtomicBool::new(false),
            listener_seq: AtomicU64::new(0),
            max_header_faults,
        });

        // Writer task: the single in-flight write per connection. Frames
        // leave in queue order; an I/O error here is terminal.
        let writer_conn = Arc::clone(&conn);
        let mut closed_rx = conn.closed_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed_rx.changed() => break,
                    op = write_rx.recv() => {
                        let Some(op) = op else { break };
                        match write_half.write_all(&op.frame).await {
                            Ok(()) => {
                                if let Some(done) = op.done {
                                    let _ = done.send(Ok(()));
                                }
                            }
                            Err(e) => {
                                error!(id = writer_conn.id, error = %e, "write failed");
                                if let Some(done) = op.done {
                                    let _ = done.send(Err(ConnectionError::Io(e)));
                                }
                                writer_conn.close_from_io();
                                break;
                            }
                        }
                    }
                }
            }
            // Cancel anything still queued.
            write_rx.close();
            while let Ok(op) = write_rx.try_recv() {
                if let Some(done) = op.done {
                    let _ = done.send(Err(ConnectionError::WriteAborted(writer_conn.id)));
                }
            }
            let _ = write_half.shutdown().await;
        });

        *conn.state.lock().unwrap() = ConnectionState::Open;
        Ok(conn)
    }

    /// Unique connection id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Is the connection open?
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Append a framed message to the write queue.
    ///
    /// Non-blocking; the writer task delivers queued frames in order. On
    /// a connection that is no longer open the message is dropped.
    pub fn enqueue(&self, payload: &[u8]) {
        if !self.is_open() {
            debug!(id = self.id, "enqueue on a connection that is not open");
            return;
        }
        let op = WriteOp {
            frame: frame(payload),
            done: None,
        };
        if self.write_tx.send(op).is_err() {
            debug!(id = self.id, "write queue closed");
        }
    }

    /// Write a framed message and wait until it has been flushed to the
    /// socket.
    pub async fn send(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::NotOpen(self.id));
        }
        let (tx, rx) = oneshot::channel();
        let op = WriteOp {
            frame: frame(payload),
            done: Some(tx),
        };
        self.write_tx
            .send(op)
            .map_err(|_| ConnectionError::WriteAborted(self.id))?;
        rx.await.map_err(|_| ConnectionError::WriteAborted(self.id))?
    }

    /// Start the read loop.
    ///
    /// Reads the 8-byte header, then exactly the announced number of
    /// payload bytes, and invokes `cb` with the payload. An invalid or
    /// zero-length header degrades to an empty-payload invocation with a
    /// logged warning; after `max_header_faults` consecutive faults the
    /// connection closes. The loop ends on socket error, [`stop_read`],
    /// or [`shutdown`].
    ///
    /// [`stop_read`]: Connection::stop_read
    /// [`shutdown`]: Connection::shutdown
    pub fn start_read<F>(&self, cb: F)
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        if !self.is_open() {
            warn!(id = self.id, "start_read on a connection that is not open");
            return;
        }
        let Some(mut reader) = self.reader.lock().unwrap().take() else {
            warn!(id = self.id, "read loop is already running");
            return;
        };
        let Some(conn) = self.weak_self.upgrade() else {
            return;
        };

        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.read_stop.lock().unwrap() = Some(stop_tx);

        let mut closed_rx = self.closed_tx.subscribe();
        tokio::spawn(async move {
            let mut header = [0u8; HEADER_LEN];
            let mut faults = 0u32;
            loop {
                if !conn.is_open() {
                    return;
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = closed_rx.changed() => return,
                    res = reader.read_exact(&mut header) => {
                        if let Err(e) = res {
                            conn.on_read_end(e);
                            return;
                        }
                    }
                }

                let payload = match parse_header(&header) {
                    Ok(0) => Vec::new(),
                    Ok(len) => {
                        let mut data = vec![0u8; len];
                        tokio::select! {
                            _ = stop_rx.changed() => break,
                            _ = closed_rx.changed() => return,
                            res = reader.read_exact(&mut data) => {
                                if let Err(e) = res {
                                    conn.on_read_end(e);
                                    return;
                                }
                            }
                        }
                        data
                    }
                    Err(e) => {
                        warn!(id = conn.id, error = %e, "unreadable frame header");
                        Vec::new()
                    }
                };

                if payload.is_empty() {
                    faults += 1;
                    warn!(
                        id = conn.id,
                        faults, "empty frame payload, notifying reader with no data"
                    );
                    cb(Vec::new());
                    if faults >= conn.max_header_faults {
                        error!(
                            id = conn.id,
                            "too many consecutive header faults, closing connection"
                        );
                        conn.shutdown();
                        return;
                    }
                    continue;
                }

                faults = 0;
                cb(payload);
            }
            // Stopped without closing: hand the read half back so the
            // loop can be re-armed later.
            if conn.is_open() {
                *conn.reader.lock().unwrap() = Some(reader);
            }
        });
    }

    /// Signal the read loop to stop without closing the socket.
    ///
    /// [`start_read`](Connection::start_read) may be called again
    /// afterwards. Intended for a quiescent stream; a frame in flight
    /// when the signal lands is abandoned.
    pub fn stop_read(&self) {
        if let Some(stop) = self.read_stop.lock().unwrap().take() {
            stop.send_replace(true);
        }
    }

    /// Register a function invoked when the connection shuts down.
    ///
    /// If the connection has already shut down the function runs
    /// immediately.
    pub fn on_shutdown<F>(&self, f: F) -> ShutdownHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.shutdown_fired.load(Ordering::SeqCst) {
            f();
            return ShutdownHandle(u64::MAX);
        }
        let id = self.listener_seq.fetch_add(1, Ordering::Relaxed);
        self.shutdown_listeners
            .lock()
            .unwrap()
            .push((id, Box::new(f)));
        ShutdownHandle(id)
    }

    /// Unregister a shutdown listener.
    pub fn disconnect_shutdown(&self, handle: ShutdownHandle) {
        self.shutdown_listeners
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != handle.0);
    }

    /// Cancel pending operations and close the socket.
    ///
    /// Idempotent; the shutdown notification fires exactly once no
    /// matter how many times this is called.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        debug!(id = self.id, "shutting down connection");
        self.closed_tx.send_replace(true);
        // Drop a parked read half so the socket actually closes.
        self.reader.lock().unwrap().take();
        self.fire_shutdown();
        *self.state.lock().unwrap() = ConnectionState::Closed;
    }

    /// Alias for [`shutdown`](Connection::shutdown), mirroring the
    /// cancel-all-async-operations entry point.
    pub fn cancel(&self) {
        self.shutdown();
    }

    /// Terminal I/O fault observed by one of the loops.
    fn close_from_io(&self) {
        self.shutdown();
    }

    fn on_read_end(&self, e: std::io::Error) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            debug!(id = self.id, "connection closed by peer");
        } else {
            error!(id = self.id, error = %e, "read failed");
        }
        self.close_from_io();
    }

    fn fire_shutdown(&self) {
        if self.shutdown_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners = std::mem::take(&mut *self.shutdown_listeners.lock().unwrap());
        for (_, listener) in listeners {
            listener();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
