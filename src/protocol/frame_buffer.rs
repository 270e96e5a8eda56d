//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 11 bytes
//! - `WaitingForPayload`: Header parsed, need N more payload bytes

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::TransportError;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: Header, remaining: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 64MB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns error if a header is invalid or its payload exceeds
    /// `max_payload_size`. The connection should be dropped afterwards.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>, TransportError> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let Some(header) = Header::decode(&self.buffer) else {
                        return Ok(None);
                    };
                    header.validate(self.max_payload_size)?;

                    let _ = self.buffer.split_to(HEADER_SIZE);

                    if header.payload_length == 0 {
                        return Ok(Some(Frame::new(header, Bytes::new())));
                    }

                    self.state = State::WaitingForPayload {
                        header,
                        remaining: header.payload_length,
                    };
                }

                State::WaitingForPayload { header, remaining } => {
                    let remaining = *remaining as usize;
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    let payload = self.buffer.split_to(remaining).freeze();
                    let header = *header;
                    self.state = State::WaitingForHeader;

                    return Ok(Some(Frame::new(header, payload)));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
