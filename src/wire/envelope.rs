//! Control envelopes exchanged between processes.
//!
//! Subscribe, unsubscribe, advertise, and the peer hello handshake are
//! themselves messages, sent over a connection with the same framing as
//! data messages.
//!
//! Wire format:
//!
//! ```text
//! +0   Op (1 byte)
//! +1   Topic length (2 bytes LE16), then topic bytes (UTF-8)
//! +..  Msg type length (2 bytes LE16), then msg type bytes (UTF-8)
//! +..  Host length (2 bytes LE16), then host bytes (UTF-8)
//! +..  Port (2 bytes LE16)
//! ```

use crate::core::EnvelopeError;

/// Control operation carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeOp {
    /// Register the sending process as a peer; the receiver replays its
    /// advertisement table on the same connection.
    Hello = 0x01,
    /// Announce a publication of (topic, msg type) served at host:port.
    Advertise = 0x02,
    /// Request the message stream for a topic; host:port identify the
    /// subscriber.
    Subscribe = 0x03,
    /// Withdraw a previous subscribe.
    Unsubscribe = 0x04,
}

impl EnvelopeOp {
    fn from_byte(b: u8) -> Result<Self, EnvelopeError> {
        match b {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Advertise),
            0x03 => Ok(Self::Subscribe),
            0x04 => Ok(Self::Unsubscribe),
            other => Err(EnvelopeError::UnknownOp(other)),
        }
    }
}

/// A control envelope: operation plus topic, message type, and the
/// endpoint the operation refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// The control operation.
    pub op: EnvelopeOp,
    /// Canonical topic name (empty for `Hello`).
    pub topic: String,
    /// Message type name (empty for `Hello`).
    pub msg_type: String,
    /// Host the operation refers to: the publisher's listen host for
    /// `Advertise`, the sender's identity otherwise.
    pub host: String,
    /// Port companion to `host`.
    pub port: u16,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(
        op: EnvelopeOp,
        topic: impl Into<String>,
        msg_type: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            op,
            topic: topic.into(),
            msg_type: msg_type.into(),
            host: host.into(),
            port,
        }
    }

    /// A `Hello` envelope announcing the sender's listen endpoint.
    pub fn hello(host: impl Into<String>, port: u16) -> Self {
        Self::new(EnvelopeOp::Hello, "", "", host, port)
    }

    /// Total wire size.
    pub fn wire_size(&self) -> usize {
        1 + 2 + self.topic.len() + 2 + self.msg_type.len() + 2 + self.host.len() + 2
    }

    /// Encode to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());
        buf.push(self.op as u8);
        for field in [&self.topic, &self.msg_type, &self.host] {
            buf.extend_from_slice(&(field.len() as u16).to_le_bytes());
            buf.extend_from_slice(field.as_bytes());
        }
        buf.extend_from_slice(&self.port.to_le_bytes());
        buf
    }

    /// Decode from wire format.
    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        if data.is_empty() {
            return Err(EnvelopeError::TooShort {
                expected: 1,
                actual: 0,
            });
        }
        let op = EnvelopeOp::from_byte(data[0])?;
        let mut pos = 1;

        let read_string = |pos: &mut usize| -> Result<String, EnvelopeError> {
            if data.len() < *pos + 2 {
                return Err(EnvelopeError::TooShort {
                    expected: *pos + 2,
                    actual: data.len(),
                });
            }
            let len = u16::from_le_bytes(data[*pos..*pos + 2].try_into().unwrap()) as usize;
            *pos += 2;
            if data.len() < *pos + len {
                return Err(EnvelopeError::TooShort {
                    expected: *pos + len,
                    actual: data.len(),
                });
            }
            let s = std::str::from_utf8(&data[*pos..*pos + len])
                .map_err(|_| EnvelopeError::InvalidUtf8)?;
            *pos += len;
            Ok(s.to_owned())
        };

        let topic = read_string(&mut pos)?;
        let msg_type = read_string(&mut pos)?;
        let host = read_string(&mut pos)?;

        if data.len() < pos + 2 {
            return Err(EnvelopeError::TooShort {
                expected: pos + 2,
                actual: data.len(),
            });
        }
        let port = u16::from_le_bytes(data[pos..pos + 2].try_into().unwrap());

        Ok(Self {
            op,
            topic,
            msg_type,
            host,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::new(
            EnvelopeOp::Subscribe,
            "/sim/pose",
            "sim.pose.v1",
            "127.0.0.1",
            11345,
        );
        let bytes = env.encode();
        assert_eq!(bytes.len(), env.wire_size());
        assert_eq!(Envelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn test_hello_has_empty_topic() {
        let env = Envelope::hello("10.0.0.2", 9000);
        let decoded = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded.op, EnvelopeOp::Hello);
        assert!(decoded.topic.is_empty());
        assert_eq!(decoded.port, 9000);
    }

    #[test]
    fn test_unknown_op() {
        assert_eq!(Envelope::decode(&[0x7f]), Err(EnvelopeError::UnknownOp(0x7f)));
    }

    #[test]
    fn test_truncated_envelope() {
        let env = Envelope::new(EnvelopeOp::Advertise, "/t", "test.text.v1", "localhost", 1);
        let bytes = env.encode();
        for cut in 0..bytes.len() {
            let err = Envelope::decode(&bytes[..cut]);
            assert!(err.is_err(), "decode of {cut}-byte prefix should fail");
        }
    }
}
