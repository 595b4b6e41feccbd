//! Frame buffer for reassembling frames from transport chunks.
//!
//! Uses `bytes::BytesMut` for buffer management. Chunks arrive split at
//! arbitrary byte boundaries; the buffer keeps at most one partial line
//! between pushes and yields every complete line as a decoded frame.
//!
//! Bytes are buffered raw and each complete line is decoded as UTF-8, so a
//! multi-byte character split across two chunks is reassembled intact.
//!
//! # Example
//!
//! ```
//! use ble_http_bridge::protocol::{BoardFrame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push::<BoardFrame>(br#"{"v":1,"type":"ca"#).is_empty());
//! let frames = buffer.push::<BoardFrame>(b"ncel\",\"id\":4}\n");
//!
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0], Ok(BoardFrame::Cancel { id: 4 }));
//! ```

use bytes::BytesMut;

use super::frame::WireFrame;
use super::wire_format::{decode, DecodeError};

/// Default maximum undelimited frame size (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Buffer accumulating incoming chunks and extracting complete frames.
pub struct FrameBuffer {
    /// Bytes received but not yet delimited.
    buffer: BytesMut,
    /// Maximum partial frame size before the buffer is discarded.
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(512),
            max_frame_size,
        }
    }

    /// Push a chunk and decode every frame it completes, in order.
    ///
    /// Blank lines are skipped. Lines that fail to decode come back as
    /// `Err` entries and do not disturb the frames around them.
    pub fn push<T: WireFrame>(&mut self, data: &[u8]) -> Vec<Result<T, DecodeError>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();

        while let Some(line) = self.next_line() {
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            frames.push(decode(line));
        }

        if self.buffer.len() > self.max_frame_size {
            let len = self.buffer.len();
            self.buffer.clear();
            frames.push(Err(DecodeError::Oversized {
                len,
                max: self.max_frame_size,
            }));
        }

        frames
    }

    /// Split off the bytes before the first `\n` or `\r`, dropping the delimiter.
    fn next_line(&mut self) -> Option<BytesMut> {
        let pos = self
            .buffer
            .iter()
            .position(|&b| b == b'\n' || b == b'\r')?;
        let line = self.buffer.split_to(pos);
        let _ = self.buffer.split_to(1);
        Some(line)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
