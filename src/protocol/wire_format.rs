//! Wire format encoding and decoding.
//!
//! Socket links carry frames with an 11-byte header:
//! ```text
//! ┌──────────┬───────┬─────────────┬──────────┐
//! │ Kind     │ Flags │ Correlation │ Length   │
//! │ 2 bytes  │ 1 byte│ 4 bytes     │ 4 bytes  │
//! │ uint16 BE│       │ uint32 BE   │ uint32 BE│
//! └──────────┴───────┴─────────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The correlation id pairs a reply
//! frame with the frame it answers; unsolicited frames use 0.

use crate::error::TransportError;

/// Header size in bytes (fixed, exactly 11).
pub const HEADER_SIZE: usize = 11;

/// Default maximum payload size (64 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Reserved frame kind (never use).
pub const RESERVED_KIND: u16 = 0;

/// Frame kinds.
pub mod kind {
    /// Serialized [`Request`](crate::protocol::Request).
    pub const REQUEST: u16 = 1;
    /// Serialized [`Response`](crate::protocol::Response).
    pub const RESPONSE: u16 = 2;
    /// Published event delivered to a subscriber.
    pub const EVENT: u16 = 3;
    /// Liveness probe.
    pub const PING: u16 = 4;
    /// Subscribe this connection to a topic.
    pub const SUBSCRIBE: u16 = 5;
    /// Unsubscribe this connection from a topic.
    pub const UNSUBSCRIBE: u16 = 6;
    /// Fan an event out to a topic's subscribers.
    pub const PUBLISH: u16 = 7;
    /// Append to a queue list.
    pub const PUSH: u16 = 0x10;
    /// Blocking pop from a queue list.
    pub const POP: u16 = 0x11;
    /// Drop a queue list.
    pub const DELETE: u16 = 0x12;
}

/// Flag constants for the protocol.
pub mod flags {
    /// Frame answers an earlier frame with the same correlation id.
    pub const IS_REPLY: u8 = 0b0000_0001;
    /// Reply carries an error message instead of a result.
    pub const IS_ERROR: u8 = 0b0000_0010;

    /// Reserved bits mask (bits 2-7).
    pub const RESERVED_MASK: u8 = 0b1111_1100;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }

    /// Error reply flags: is_reply + is_error = 0x03
    pub const ERROR_REPLY: u8 = IS_REPLY | IS_ERROR;
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame kind (see `kind` module, 0 reserved).
    pub kind: u16,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Correlation identifier (0 = unsolicited).
    pub correlation_id: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(kind: u16, flags: u8, correlation_id: u32, payload_length: u32) -> Self {
        Self {
            kind,
            flags,
            correlation_id,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use skywire::protocol::{Header, flags, kind};
    ///
    /// let header = Header::new(kind::RESPONSE, flags::IS_REPLY, 42, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 11);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (11 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&self.kind.to_be_bytes());
        buf[2] = self.flags;
        buf[3..7].copy_from_slice(&self.correlation_id.to_be_bytes());
        buf[7..11].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            kind: u16::from_be_bytes([buf[0], buf[1]]),
            flags: buf[2],
            correlation_id: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
            payload_length: u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Kind is not 0 (reserved)
    /// - Payload length doesn't exceed max
    /// - Reserved flag bits are 0
    pub fn validate(&self, max_payload_size: u32) -> Result<(), TransportError> {
        if self.kind == RESERVED_KIND {
            return Err(TransportError::Protocol(
                "Frame kind 0 is reserved".to_string(),
            ));
        }

        if self.payload_length > max_payload_size {
            return Err(TransportError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(TransportError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Check if this is a reply.
    #[inline]
    pub fn is_reply(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_REPLY)
    }

    /// Check if this is an error reply.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(kind::RESPONSE, flags::IS_REPLY, 42, 100);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::new(0x0102, 0x03, 0x04050607, 0x08090A0B);
        let bytes = header.encode();

        assert_eq!(&bytes[0..2], &[0x01, 0x02]);
        assert_eq!(bytes[2], 0x03);
        assert_eq!(&bytes[3..7], &[0x04, 0x05, 0x06, 0x07]);
        assert_eq!(&bytes[7..11], &[0x08, 0x09, 0x0A, 0x0B]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 10];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_validate_kind_zero_rejected() {
        let header = Header::new(RESERVED_KIND, 0, 1, 0);
        let result = header.validate(DEFAULT_MAX_PAYLOAD_SIZE);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Frame kind 0 is reserved"));
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = Header::new(kind::REQUEST, 0, 1, 1_000_000);
        let result = header.validate(100);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_reserved_bits_must_be_zero() {
        let header = Header::new(kind::REQUEST, 0b1000_0000, 1, 0);
        let result = header.validate(DEFAULT_MAX_PAYLOAD_SIZE);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Reserved flag bits"));
    }

    #[test]
    fn test_flag_accessors() {
        let header = Header::new(kind::POP, flags::ERROR_REPLY, 7, 0);
        assert!(header.is_reply());
        assert!(header.is_error());

        let header = Header::new(kind::EVENT, 0, 0, 0);
        assert!(!header.is_reply());
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_ok());
    }
}
