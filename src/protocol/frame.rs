//! Frame types for both directions of the bridge.
//!
//! Each direction is a closed sum type. The JSON `type` tag selects the
//! variant; the protocol version `v` lives in the envelope, not in the
//! variants (see [`wire_format`](super::wire_format)).
//!
//! # Example
//!
//! ```
//! use ble_http_bridge::protocol::{BoardFrame, RequestMethod};
//!
//! let frame = BoardFrame::Request {
//!     id: 7,
//!     method: RequestMethod::Get,
//!     url: "https://lichess.org/api/account".into(),
//!     body: None,
//! };
//! assert_eq!(frame.id(), 7);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// HTTP verb requested by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMethod {
    /// Unary GET.
    Get,
    /// Unary POST with a JSON body.
    Post,
    /// Long-lived line stream (GET).
    Stream,
}

/// Frames sent by the board (board→phone characteristic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoardFrame {
    /// Start a new request.
    Request {
        id: u32,
        method: RequestMethod,
        url: String,
        #[serde(default)]
        body: Option<String>,
    },
    /// Cancel an outstanding request.
    Cancel { id: u32 },
    /// Liveness check, answered with [`PhoneFrame::Pong`].
    Ping { id: u32 },
}

impl BoardFrame {
    /// Request id carried by this frame.
    #[inline]
    pub fn id(&self) -> u32 {
        match self {
            BoardFrame::Request { id, .. } | BoardFrame::Cancel { id } | BoardFrame::Ping { id } => {
                *id
            }
        }
    }
}

/// Frames sent by the phone (phone→board characteristic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhoneFrame {
    /// Body of a successful unary request.
    Response { id: u32, body: String },
    /// One upstream line of a stream, newline-terminated.
    StreamData { id: u32, chunk: String },
    /// Upstream closed the stream normally.
    StreamClosed { id: u32 },
    /// Answer to [`BoardFrame::Ping`].
    Pong { id: u32 },
    /// Request failed. `id` is `None` for errors not tied to a request.
    Error {
        #[serde(default)]
        id: Option<u32>,
        message: String,
    },
}

impl PhoneFrame {
    /// Request id this frame belongs to, if any.
    pub fn id(&self) -> Option<u32> {
        match self {
            PhoneFrame::Response { id, .. }
            | PhoneFrame::StreamData { id, .. }
            | PhoneFrame::StreamClosed { id }
            | PhoneFrame::Pong { id } => Some(*id),
            PhoneFrame::Error { id, .. } => *id,
        }
    }

    /// Whether this frame ends the lifecycle of its request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhoneFrame::Response { .. } | PhoneFrame::StreamClosed { .. } | PhoneFrame::Error { .. }
        )
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PhoneFrame::Response { .. } => "response",
            PhoneFrame::StreamData { .. } => "stream_data",
            PhoneFrame::StreamClosed { .. } => "stream_closed",
            PhoneFrame::Pong { .. } => "pong",
            PhoneFrame::Error { .. } => "error",
        }
    }
}

/// A frame family that can travel over the wire.
///
/// `TYPES` lists every `type` tag of the family so the decoder can tell an
/// unknown tag apart from a known tag with missing fields.
pub trait WireFrame: Serialize + DeserializeOwned {
    /// All `type` tags of this family.
    const TYPES: &'static [&'static str];
}

impl WireFrame for BoardFrame {
    const TYPES: &'static [&'static str] = &["request", "cancel", "ping"];
}

impl WireFrame for PhoneFrame {
    const TYPES: &'static [&'static str] =
        &["response", "stream_data", "stream_closed", "pong", "error"];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_frame_id() {
        assert_eq!(BoardFrame::Cancel { id: 3 }.id(), 3);
        assert_eq!(BoardFrame::Ping { id: 42 }.id(), 42);
    }

    #[test]
    fn test_phone_frame_terminal() {
        assert!(PhoneFrame::Response { id: 1, body: String::new() }.is_terminal());
        assert!(PhoneFrame::StreamClosed { id: 1 }.is_terminal());
        assert!(PhoneFrame::Error { id: None, message: "x".into() }.is_terminal());
        assert!(!PhoneFrame::StreamData { id: 1, chunk: "a\n".into() }.is_terminal());
        assert!(!PhoneFrame::Pong { id: 1 }.is_terminal());
    }

    #[test]
    fn test_error_without_id() {
        let frame = PhoneFrame::Error {
            id: None,
            message: "boom".into(),
        };
        assert_eq!(frame.id(), None);
        assert_eq!(frame.kind(), "error");
    }

    #[test]
    fn test_method_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RequestMethod::Stream).unwrap(),
            "\"stream\""
        );
    }
}
