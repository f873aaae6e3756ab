//! Wire formats: length-prefixed framing and control envelopes.
//!
//! The framing layer is deliberately dumb — an 8-byte hex length header
//! followed by opaque payload bytes. Control envelopes (`sub`, `unsub`,
//! `advertise`, `hello`) ride inside ordinary frames.

mod envelope;
mod frame;

pub use envelope::{Envelope, EnvelopeOp};
pub use frame::{HEADER_LEN, MAX_PAYLOAD_LEN, encode_header, frame, parse_header};
