//! Transport layer: framed TCP connections and their management.
//!
//! This module implements the socket plumbing under the topic registry:
//!
//! - **Connections**: [`Connection`] with an ordered write queue and a
//!   header/body read loop
//! - **Accepting**: [`Listener`] turning inbound sockets into
//!   connections
//! - **Inventory & routing**: [`ConnectionManager`] tracking live
//!   connections and routing control envelopes
//! - **Inbound streams**: [`PublicationTransport`], one per remote
//!   publisher feeding the dispatch path
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Node API                     │
//! ├─────────────────────────────────────────┤
//! │          Topic registry                 │
//! ├─────────────────────────────────────────┤
//! │         Transport layer                 │  ← This module
//! │  connections, framing, control routing  │
//! ├─────────────────────────────────────────┤
//! │              TCP                        │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod listener;
mod manager;
mod publication_link;

pub use connection::{
    Connection, ConnectionState, DEFAULT_MAX_HEADER_FAULTS, ShutdownHandle,
};
pub use listener::Listener;
pub use manager::ConnectionManager;
pub use publication_link::PublicationTransport;
