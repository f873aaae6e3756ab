//! # simbus
//!
//! An asynchronous publish/subscribe transport over TCP for distributed
//! simulation processes. It provides:
//!
//! - **Framed connections**: length-prefixed binary protocol over
//!   persistent sockets, ordered writes, asynchronous reads
//! - **Topic registry**: process-wide advertise/subscribe bookkeeping
//!   with duplicate merging and latched replay
//! - **Node API**: typed publish and callback dispatch per component
//! - **Peer discovery**: control envelopes negotiating data links
//!   between processes
//!
//! Message bodies are opaque byte sequences; applications supply
//! serialization by implementing [`Message`].
//!
//! ## Example
//!
//! ```no_run
//! use simbus::prelude::*;
//! use std::sync::Arc;
//!
//! #[derive(Clone)]
//! struct Tick(u64);
//!
//! impl Message for Tick {
//!     const TYPE_NAME: &'static str = "demo.tick.v1";
//!
//!     fn encode(&self) -> Vec<u8> {
//!         self.0.to_le_bytes().to_vec()
//!     }
//!
//!     fn decode(data: &[u8]) -> Result<Self, DecodeError> {
//!         let bytes: [u8; 8] = data.try_into().map_err(|_| DecodeError::UnexpectedEof)?;
//!         Ok(Tick(u64::from_le_bytes(bytes)))
//!     }
//! }
//!
//! # async fn run() -> Result<(), BusError> {
//! let bus = Bus::init(BusConfig::default()).await?;
//! let node = bus.create_node("demo");
//!
//! let publisher = node.advertise::<Tick>("~/tick", 100, false)?;
//! let _sub = node
//!     .subscribe("~/tick", |tick: Tick| println!("tick {}", tick.0), false)
//!     .await?;
//!
//! publisher.publish(&Tick(1));
//! node.process_publishers();
//! node.process_incoming();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod bus;
pub mod core;
pub mod node;
pub mod topic;
pub mod transport;
pub mod wire;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bus::{Bus, BusConfig, BusConfigBuilder};
    pub use crate::core::{
        BusError, ConnectionError, DecodeError, EnvelopeError, FrameError, Message,
        RegistrationError,
    };
    pub use crate::node::Node;
    pub use crate::topic::{Publisher, SubscribeOptions, Subscriber, TopicManager};
    pub use crate::transport::{Connection, ConnectionManager, ConnectionState, Listener};
}

// Re-export commonly used items at crate root
pub use bus::{Bus, BusConfig, BusConfigBuilder};
pub use self::core::{BusError, DecodeError, Message};
pub use node::Node;
pub use topic::{Publisher, Subscriber, TopicManager};
pub use transport::{Connection, ConnectionManager};
