//! Wire framing: 8-byte length header + payload.
//!
//! Every message on a connection is one frame:
//!
//! ```text
//! +0   Header (8 bytes, ASCII lowercase hex payload length)
//! +8   Payload (variable)
//! ```
//!
//! Both ends parse the header identically; a payload length of zero is a
//! signaling/no-data frame.

use crate::core::FrameError;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest payload length the 8-hex-digit header can describe.
pub const MAX_PAYLOAD_LEN: usize = 0xffff_ffff;

/// Encode a payload length as the 8-byte hex header.
pub fn encode_header(len: usize) -> [u8; HEADER_LEN] {
    debug_assert!(len <= MAX_PAYLOAD_LEN);
    let mut header = [0u8; HEADER_LEN];
    let text = format!("{len:08x}");
    header.copy_from_slice(text.as_bytes());
    header
}

/// Parse an 8-byte header into a payload length.
pub fn parse_header(header: &[u8]) -> Result<usize, FrameError> {
    if header.len() < HEADER_LEN {
        return Err(FrameError::TruncatedHeader(header.len()));
    }
    let text = std::str::from_utf8(&header[..HEADER_LEN])
        .map_err(|_| FrameError::InvalidHeader(format!("{:?}", &header[..HEADER_LEN])))?;
    usize::from_str_radix(text.trim(), 16)
        .map_err(|_| FrameError::InvalidHeader(text.to_owned()))
}

/// Frame a payload: header followed by the payload bytes.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&encode_header(payload.len()));
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        for len in [0usize, 1, 8, 255, 4096, MAX_PAYLOAD_LEN] {
            let header = encode_header(len);
            assert_eq!(parse_header(&header).unwrap(), len);
        }
    }

    #[test]
    fn test_header_is_exact_payload_length() {
        let payload = b"some payload bytes";
        let framed = frame(payload);
        assert_eq!(framed.len(), HEADER_LEN + payload.len());
        assert_eq!(parse_header(&framed[..HEADER_LEN]).unwrap(), payload.len());
        assert_eq!(&framed[HEADER_LEN..], payload);
    }

    #[test]
    fn test_zero_length_frame() {
        let framed = frame(b"");
        assert_eq!(framed.len(), HEADER_LEN);
        assert_eq!(parse_header(&framed).unwrap(), 0);
    }

    #[test]
    fn test_truncated_header() {
        assert_eq!(parse_header(b"0000"), Err(FrameError::TruncatedHeader(4)));
    }

    #[test]
    fn test_non_hex_header() {
        assert!(matches!(
            parse_header(b"zzzzzzzz"),
            Err(FrameError::InvalidHeader(_))
        ));
        assert!(matches!(
            parse_header(&[0xff; 8]),
            Err(FrameError::InvalidHeader(_))
        ));
    }
}
