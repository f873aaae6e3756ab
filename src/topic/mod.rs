//! Topic registry: publications, subscriptions, and typed handles.
//!
//! This layer is the process-wide authority on which topics exist, what
//! message type each carries, and who is listening. It provides:
//!
//! - **Registry**: [`TopicManager`] with advertise/subscribe bookkeeping
//! - **Records**: [`Publication`], one per advertised topic
//! - **Handles**: [`Publisher`] and [`Subscriber`], released on drop
//! - **Dispatch**: [`CallbackHandler`] capability objects wrapping typed
//!   closures ([`TypedCallback`])

mod callback;
mod manager;
mod publication;
pub(crate) mod publisher;
mod subscriber;

pub use callback::{CallbackHandler, TypedCallback};
pub use manager::{SubscribeOptions, TopicManager};
pub use publication::Publication;
pub use publisher::Publisher;
pub use subscriber::Subscriber;
