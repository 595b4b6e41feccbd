//! Protocol module - frame types, wire format, and reassembly.
//!
//! This module implements the newline-delimited JSON protocol spoken over
//! the two bridge characteristics:
//! - Frame sum types for each direction
//! - Versioned encode/decode of single frames
//! - Frame buffer for reassembling frames from transport chunks

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{BoardFrame, PhoneFrame, RequestMethod, WireFrame};
pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_FRAME_SIZE};
pub use wire_format::{decode, encode, DecodeError, DELIMITER, PROTOCOL_VERSION};
