//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use skywire::protocol::{Frame, Header, flags, kind};
//! use bytes::Bytes;
//!
//! let header = Header::new(kind::RESPONSE, flags::IS_REPLY, 42, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.kind(), kind::RESPONSE);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn kind(&self) -> u16 {
        self.header.kind
    }

    #[inline]
    pub fn correlation_id(&self) -> u32 {
        self.header.correlation_id
    }

    #[inline]
    pub fn is_reply(&self) -> bool {
        self.header.is_reply()
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    /// Error text carried by an error reply.
    pub fn error_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Build a complete frame as a single byte vector.
///
/// # Example
///
/// ```
/// use skywire::protocol::{build_frame, Header, kind};
///
/// let header = Header::new(kind::REQUEST, 0, 42, 5);
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), 11 + 5);
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{flags, kind, FrameBuffer};

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::new(
            Header::new(kind::POP, flags::ERROR_REPLY, 9, 4),
            Bytes::from_static(b"gone"),
        );
        assert_eq!(frame.kind(), kind::POP);
        assert_eq!(frame.correlation_id(), 9);
        assert!(frame.is_reply());
        assert!(frame.is_error());
        assert_eq!(frame.error_text(), "gone");
    }

    #[test]
    fn test_build_frame_roundtrip() {
        let header = Header::new(kind::REQUEST, 0, 456, 10);
        let payload = b"0123456789";
        let bytes = build_frame(&header, payload);

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind(), kind::REQUEST);
        assert_eq!(frames[0].correlation_id(), 456);
        assert_eq!(frames[0].payload(), payload);
    }
}
