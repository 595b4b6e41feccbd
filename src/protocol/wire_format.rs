//! Wire format encoding and decoding.
//!
//! Every frame is one UTF-8 JSON object followed by a single `\n`:
//! ```text
//! {"v":1,"type":"request","id":7,"method":"get","url":"https://…","body":null}\n
//! └─┬─┘ └──────┬──────┘ └────────────────┬──────────────────────────────────┘
//!  version   type tag               type-specific fields
//! ```
//!
//! There is no length prefix. Receivers also accept `\r` as a delimiter
//! (see [`FrameBuffer`](super::FrameBuffer)).

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::frame::WireFrame;
use crate::error::Result;

/// Protocol version carried in the `v` field.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame delimiter appended by [`encode`].
pub const DELIMITER: u8 = b'\n';

/// Why a received line did not produce a frame.
///
/// All variants are non-fatal: the line is logged and dropped, and the
/// connection carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not valid JSON, or not a JSON object.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// `v` missing or not the supported version.
    #[error("unsupported protocol version: {found}")]
    UnsupportedVersion {
        /// JSON text of the received `v`, or `missing`.
        found: String,
    },

    /// `type` missing or not part of this frame family.
    #[error("unknown frame type: {}", found.as_deref().unwrap_or("<missing>"))]
    UnknownType {
        /// The received tag, if any.
        found: Option<String>,
    },

    /// Known `type`, but a required field is missing or has the wrong type.
    #[error("invalid `{frame_type}` frame: {reason}")]
    MissingField {
        /// The frame's `type` tag.
        frame_type: String,
        /// Deserializer message naming the field.
        reason: String,
    },

    /// Undelimited input grew past the configured maximum frame size.
    #[error("frame exceeds {max} bytes without a delimiter ({len} buffered)")]
    Oversized {
        /// Bytes discarded.
        len: usize,
        /// Configured limit.
        max: usize,
    },
}

#[derive(Serialize)]
struct Envelope<'a, T> {
    v: u8,
    #[serde(flatten)]
    msg: &'a T,
}

/// Encode a frame as one JSON line terminated by `\n`.
///
/// Deterministic: the same frame always yields the same bytes (`v` first,
/// then `type`, then the variant's fields in declaration order).
pub fn encode<T: WireFrame>(frame: &T) -> Result<Bytes> {
    let mut out = serde_json::to_vec(&Envelope {
        v: PROTOCOL_VERSION,
        msg: frame,
    })?;
    out.push(DELIMITER);
    Ok(Bytes::from(out))
}

/// Decode one line (without its delimiter) into a frame.
pub fn decode<T: WireFrame>(line: &str) -> std::result::Result<T, DecodeError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let Value::Object(mut map) = value else {
        return Err(DecodeError::Malformed("expected a JSON object".into()));
    };

    match map.remove("v") {
        Some(v) if v.as_u64() == Some(u64::from(PROTOCOL_VERSION)) => {}
        Some(v) => {
            return Err(DecodeError::UnsupportedVersion {
                found: v.to_string(),
            })
        }
        None => {
            return Err(DecodeError::UnsupportedVersion {
                found: "missing".into(),
            })
        }
    }

    let frame_type = match map.get("type").and_then(Value::as_str) {
        Some(tag) if T::TYPES.contains(&tag) => tag.to_string(),
        Some(tag) => {
            return Err(DecodeError::UnknownType {
                found: Some(tag.to_string()),
            })
        }
        None => return Err(DecodeError::UnknownType { found: None }),
    };

    serde_json::from_value(Value::Object(map)).map_err(|e| DecodeError::MissingField {
        frame_type,
        reason: e.to_string(),
    })
}
