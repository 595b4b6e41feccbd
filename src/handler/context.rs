//! Request context for handlers.
//!
//! Provides methods for answering one board request:
//! - `respond` - send the unary response body
//! - `chunk` - send one stream line
//! - `end` - close a stream
//! - `error` - send an error message
//!
//! Every method checks the request's cancellation token first; a cancelled
//! request emits nothing further and gets `Err(Cancelled)` back.
//!
//! # Example
//!
//! ```ignore
//! async fn echo(body: String, ctx: RequestContext) -> Result<()> {
//!     ctx.respond(body).await
//! }
//!
//! async fn count(ctx: RequestContext) -> Result<()> {
//!     for i in 0..3 {
//!         ctx.chunk(format!("{i}\n")).await?;
//!     }
//!     ctx.end().await
//! }
//! ```

use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::protocol::PhoneFrame;
use crate::writer::WriterHandle;

/// Context passed to the handler serving one request.
///
/// `RequestContext` is `Clone`; clones share the cancellation token.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Request ID for this request.
    request_id: u32,
    /// Fires on `Cancel{id}` or connection teardown.
    cancel: CancellationToken,
    /// Writer handle for sending frames.
    writer: Option<WriterHandle>,
}

impl RequestContext {
    /// Create a new request context (for testing without writer).
    pub fn new(request_id: u32) -> Self {
        Self {
            request_id,
            cancel: CancellationToken::new(),
            writer: None,
        }
    }

    /// Create a new request context with a writer.
    pub fn with_writer(request_id: u32, cancel: CancellationToken, writer: WriterHandle) -> Self {
        Self {
            request_id,
            cancel,
            writer: Some(writer),
        }
    }

    /// Get the request ID.
    #[inline]
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// The request's cancellation token.
    #[inline]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the request was cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the request is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Send the unary response.
    pub async fn respond(&self, body: String) -> Result<()> {
        self.send(PhoneFrame::Response {
            id: self.request_id,
            body,
        })
        .await
    }

    /// Send a stream line.
    pub async fn chunk(&self, chunk: String) -> Result<()> {
        self.send(PhoneFrame::StreamData {
            id: self.request_id,
            chunk,
        })
        .await
    }

    /// Close the stream.
    pub async fn end(&self) -> Result<()> {
        self.send(PhoneFrame::StreamClosed {
            id: self.request_id,
        })
        .await
    }

    /// Send an error for this request.
    pub async fn error(&self, message: impl Into<String>) -> Result<()> {
        self.send(PhoneFrame::Error {
            id: Some(self.request_id),
            message: message.into(),
        })
        .await
    }

    async fn send(&self, frame: PhoneFrame) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let writer = match &self.writer {
            Some(w) => w,
            None => {
                // No writer configured (testing mode)
                return Ok(());
            }
        };

        writer.send_unless_cancelled(&frame, &self.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::FrameBuffer;
    use crate::transport::{ack_slot, Characteristic, ChannelCharacteristic};
    use crate::writer::{spawn_writer_task, WriterConfig};

    #[test]
    fn test_context_creation() {
        let ctx = RequestContext::new(42);
        assert_eq!(ctx.request_id(), 42);
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_all_methods_without_writer() {
        let ctx = RequestContext::new(42);

        assert!(ctx.respond("body".into()).await.is_ok());
        assert!(ctx.chunk("line\n".into()).await.is_ok());
        assert!(ctx.end().await.is_ok());
        assert!(ctx.error("boom").await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_context_refuses_to_send() {
        let ctx = RequestContext::new(3);
        ctx.cancellation().cancel();

        assert!(matches!(
            ctx.chunk("late\n".into()).await,
            Err(BridgeError::Cancelled)
        ));
        assert!(matches!(ctx.end().await, Err(BridgeError::Cancelled)));
    }

    #[test]
    fn test_clones_share_cancellation() {
        let ctx = RequestContext::new(1);
        let other = ctx.clone();

        ctx.cancellation().cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn test_context_with_writer() {
        let (characteristic, mut chunks) = ChannelCharacteristic::new(true);
        let characteristic = Arc::new(characteristic);
        let (acks_handle, acks) = ack_slot();
        characteristic.bind(acks_handle);
        let (writer, _task) = spawn_writer_task(
            characteristic,
            acks,
            WriterConfig::default(),
            CancellationToken::new(),
        );

        let ctx = RequestContext::with_writer(9, CancellationToken::new(), writer);
        ctx.chunk("a\n".into()).await.unwrap();
        ctx.end().await.unwrap();

        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        while let Ok(chunk) = chunks.try_recv() {
            frames.extend(buffer.push::<PhoneFrame>(&chunk));
        }
        assert_eq!(
            frames,
            vec![
                Ok(PhoneFrame::StreamData {
                    id: 9,
                    chunk: "a\n".into()
                }),
                Ok(PhoneFrame::StreamClosed { id: 9 }),
            ]
        );
    }
}
