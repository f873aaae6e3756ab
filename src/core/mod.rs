//! Core traits and error types shared by every layer of the transport.

mod error;
mod traits;

pub use error::{
    BusError, ConnectionError, DecodeError, EnvelopeError, FrameError, RegistrationError,
};
pub use traits::Message;

#[cfg(test)]
pub(crate) use traits::testing;
