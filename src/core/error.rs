//! Error types for the simbus transport core.

use thiserror::Error;

/// Errors that can occur when decoding a message payload.
#[derive(Debug, Error, Clone)]
pub enum DecodeError {
    /// Invalid encoding.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Unexpected end of data.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Unsupported version.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),
}

/// Errors in the wire framing layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Header is shorter than the fixed 8 bytes.
    #[error("truncated header: expected 8 bytes, got {0}")]
    TruncatedHeader(usize),

    /// Header bytes are not valid hexadecimal.
    #[error("invalid header: {0:?} is not a hexadecimal length")]
    InvalidHeader(String),
}

/// Errors when encoding or decoding a control envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Data ended before the envelope was complete.
    #[error("envelope too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown operation tag.
    #[error("unknown envelope op: {0:#04x}")]
    UnknownOp(u8),

    /// A string field was not valid UTF-8.
    #[error("envelope field is not valid UTF-8")]
    InvalidUtf8,
}

/// Errors in the connection layer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connect or accept failed at the socket level.
    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        /// The remote endpoint.
        addr: String,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// Operation attempted on a connection that is not open.
    #[error("connection {0} is not open")]
    NotOpen(u32),

    /// The connection shut down before a queued write was flushed.
    #[error("connection {0} shut down before the write completed")]
    WriteAborted(u32),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors when registering a publisher or subscriber.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The topic is already bound to a different message type.
    #[error("type mismatch on {topic:?}: topic carries {advertised}, caller wants {requested}")]
    TypeMismatch {
        /// Canonical topic name.
        topic: String,
        /// Type the topic is already bound to.
        advertised: String,
        /// Type the caller requested.
        requested: String,
    },

    /// Topic name is empty after namespace resolution.
    #[error("empty topic name")]
    EmptyTopic,
}

/// Top-level simbus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Framing error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Control envelope error.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Registration error.
    #[error("registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// Message decode error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
