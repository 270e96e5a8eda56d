//! Protocol module - messages, wire format and framing.
//!
//! - [`Request`], [`Response`], [`Event`] and the [`Protocol`] builder
//! - 11-byte frame header encoding/decoding for socket links
//! - Frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod message;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use message::{
    Event, Failure, Kwargs, Protocol, Request, Response, Status, PROTOCOL_VERSION,
};
pub use wire_format::{
    flags, kind, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, RESERVED_KIND,
};
