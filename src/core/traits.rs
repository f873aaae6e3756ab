//! Core traits for the simbus transport.

use super::error::DecodeError;

/// A message that can travel over a topic.
///
/// The transport core never inspects message bodies beyond their length;
/// this trait is the seam where an application (or a generated message
/// factory) plugs in its own serialization. A topic is bound to exactly
/// one `TYPE_NAME` and registrations with a different type are rejected.
///
/// # Example
///
/// ```
/// use simbus::prelude::*;
///
/// #[derive(Clone, PartialEq, Debug)]
/// struct Pose {
///     x: f64,
///     y: f64,
/// }
///
/// impl Message for Pose {
///     const TYPE_NAME: &'static str = "sim.pose.v1";
///
///     fn encode(&self) -> Vec<u8> {
///         let mut buf = Vec::with_capacity(16);
///         buf.extend_from_slice(&self.x.to_le_bytes());
///         buf.extend_from_slice(&self.y.to_le_bytes());
///         buf
///     }
///
///     fn decode(data: &[u8]) -> Result<Self, DecodeError> {
///         if data.len() < 16 {
///             return Err(DecodeError::UnexpectedEof);
///         }
///         Ok(Pose {
///             x: f64::from_le_bytes(data[..8].try_into().unwrap()),
///             y: f64::from_le_bytes(data[8..16].try_into().unwrap()),
///         })
///     }
/// }
/// ```
pub trait Message: Send + Sync + 'static {
    /// Unique message type identifier (e.g., "sim.pose.v1").
    const TYPE_NAME: &'static str;

    /// Serialize for wire transmission.
    fn encode(&self) -> Vec<u8>;

    /// Deserialize from wire format.
    fn decode(data: &[u8]) -> Result<Self, DecodeError>
    where
        Self: Sized;
}
