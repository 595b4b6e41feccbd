//! Dedicated writer task for chunked frame sending.
//!
//! Every outgoing frame of a connection goes through one writer task that
//! receives frames via an mpsc channel. The task writes one frame at a time,
//! chunk by chunk, so chunks of two frames can never interleave on the
//! characteristic.
//!
//! # Architecture
//!
//! ```text
//! Request 1 ─┐
//! Request 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Characteristic
//! Pong      ─┘                                    ▲    │ chunk
//!                                                 └────┘ ack (WithResponse)
//! ```
//!
//! Frames are written in queue order. In [`WriteMode::WithResponse`] the task
//! waits for each chunk's acknowledgment before writing the next one; a
//! missing acknowledgment ends the task and closes the connection scope.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{BridgeError, Result};
use crate::protocol::{encode, PhoneFrame};
use crate::transport::{AckReceiver, Characteristic, WriteMode, MIN_MTU_PAYLOAD};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Default acknowledgment timeout per chunk.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum chunk size.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = MIN_MTU_PAYLOAD;

/// An encoded frame waiting for the writer.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Request id, for logging.
    id: Option<u32>,
    /// Frame kind, for logging.
    kind: &'static str,
    /// Encoded bytes including the delimiter.
    bytes: Bytes,
    /// Skip the frame if this token is cancelled before it is written.
    cancel: Option<CancellationToken>,
    /// Completion notification.
    done: Option<oneshot::Sender<Result<()>>>,
}

impl OutboundFrame {
    /// Encode a frame for the writer.
    pub fn new(frame: &PhoneFrame) -> Result<Self> {
        Ok(Self {
            id: frame.id(),
            kind: frame.kind(),
            bytes: encode(frame)?,
            cancel: None,
            done: None,
        })
    }

    /// Drop the frame unwritten if `cancel` fires first.
    pub fn unless_cancelled(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Total encoded size.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn complete(&mut self, result: Result<()>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Largest chunk handed to the characteristic.
    pub max_chunk_size: usize,
    /// Acknowledged or unacknowledged writes.
    pub write_mode: WriteMode,
    /// How long to wait for each chunk's acknowledgment.
    pub ack_timeout: Duration,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            write_mode: WriteMode::WithResponse,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across request handlers.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    /// Channel sender for frames.
    tx: mpsc::Sender<OutboundFrame>,
    /// Frames queued but not yet taken by the writer.
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    /// Send a frame and wait until it has been fully written.
    pub async fn send(&self, frame: &PhoneFrame) -> Result<()> {
        self.submit(OutboundFrame::new(frame)?).await
    }

    /// Send a frame on behalf of a request; the writer drops it if `cancel`
    /// fires before transmission starts.
    pub async fn send_unless_cancelled(
        &self,
        frame: &PhoneFrame,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        self.submit(OutboundFrame::new(frame)?.unless_cancelled(cancel.clone()))
            .await
    }

    /// Queue a frame without waiting, either for queue space or for the write.
    ///
    /// Returns `Err(QueueFull)` immediately if the queue is at capacity.
    pub fn enqueue(&self, frame: &PhoneFrame) -> Result<()> {
        let frame = OutboundFrame::new(frame)?;

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => BridgeError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => BridgeError::ConnectionClosed,
            }
        })
    }

    async fn submit(&self, mut frame: OutboundFrame) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        frame.done = Some(done_tx);

        // Increment pending count BEFORE sending
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            BridgeError::ConnectionClosed
        })?;

        done_rx.await.map_err(|_| BridgeError::ConnectionClosed)?
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// # Arguments
///
/// * `characteristic` - The phone→board characteristic
/// * `acks` - Acknowledgment slot bound to that characteristic
/// * `config` - Writer configuration
/// * `scope` - Connection scope; the task stops when it is cancelled and
///   cancels it on a write failure
pub fn spawn_writer_task(
    characteristic: Arc<dyn Characteristic>,
    acks: AckReceiver,
    config: WriterConfig,
    scope: CancellationToken,
) -> (WriterHandle, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
    };

    let task = tokio::spawn(writer_loop(rx, characteristic, acks, config, pending, scope));

    (handle, task)
}

/// Main writer loop - takes frames one at a time and writes them out.
async fn writer_loop(
    mut rx: mpsc::Receiver<OutboundFrame>,
    characteristic: Arc<dyn Characteristic>,
    mut acks: AckReceiver,
    config: WriterConfig,
    pending: Arc<AtomicUsize>,
    scope: CancellationToken,
) -> Result<()> {
    loop {
        let mut frame = tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(()),
            frame = rx.recv() => match frame {
                Some(f) => f,
                // Channel closed, clean shutdown
                None => return Ok(()),
            },
        };
        pending.fetch_sub(1, Ordering::Release);

        if frame.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            debug!(
                "Dropping {} frame for cancelled request {:?}",
                frame.kind, frame.id
            );
            frame.complete(Err(BridgeError::Cancelled));
            continue;
        }

        let result = tokio::select! {
            biased;
            _ = scope.cancelled() => Err(BridgeError::ConnectionClosed),
            r = write_frame(characteristic.as_ref(), &mut acks, &config, &frame.bytes) => r,
        };

        match result {
            Ok(()) => {
                debug!(
                    "Wrote {} frame for request {:?} ({} bytes)",
                    frame.kind,
                    frame.id,
                    frame.size()
                );
                frame.complete(Ok(()));
            }
            Err(BridgeError::ConnectionClosed) if scope.is_cancelled() => {
                frame.complete(Err(BridgeError::ConnectionClosed));
                return Ok(());
            }
            Err(e) => {
                error!(
                    "Writing {} frame for request {:?} failed: {}",
                    frame.kind, frame.id, e
                );
                let summary = e.to_string();
                frame.complete(Err(e));
                scope.cancel();
                return Err(BridgeError::WriteFailed(summary));
            }
        }
    }
}

/// Write one encoded frame chunk by chunk.
async fn write_frame(
    characteristic: &dyn Characteristic,
    acks: &mut AckReceiver,
    config: &WriterConfig,
    bytes: &Bytes,
) -> Result<()> {
    for chunk in split_chunks(bytes, config.max_chunk_size) {
        let stale = acks.drain_stale();
        if stale > 0 {
            warn!("Discarded {} stale write acknowledgment(s)", stale);
        }

        characteristic.write(chunk, config.write_mode).await?;

        if config.write_mode == WriteMode::WithResponse {
            acks.wait(config.ack_timeout).await?;
        }
    }
    Ok(())
}

/// Split encoded bytes into consecutive chunks of at most `max` bytes.
///
/// Chunks share the underlying buffer (no copies).
pub fn split_chunks(bytes: &Bytes, max: usize) -> impl Iterator<Item = Bytes> + '_ {
    let max = max.max(1);
    (0..bytes.len())
        .step_by(max)
        .map(move |start| bytes.slice(start..(start + max).min(bytes.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, PhoneFrame};
    use crate::transport::{ack_slot, ChannelCharacteristic, WriteAck};

    fn spawn_channel_writer(
        auto_ack: bool,
        config: WriterConfig,
    ) -> (
        Arc<ChannelCharacteristic>,
        mpsc::UnboundedReceiver<Bytes>,
        WriterHandle,
        JoinHandle<Result<()>>,
        CancellationToken,
    ) {
        let (characteristic, chunks) = ChannelCharacteristic::new(auto_ack);
        let characteristic = Arc::new(characteristic);
        let (ack_handle, acks) = ack_slot();
        characteristic.bind(ack_handle);
        let scope = CancellationToken::new();
        let (handle, task) =
            spawn_writer_task(characteristic.clone(), acks, config, scope.clone());
        (characteristic, chunks, handle, task, scope)
    }

    fn response(id: u32, body: &str) -> PhoneFrame {
        PhoneFrame::Response {
            id,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_split_chunks_sizes() {
        let bytes = Bytes::from(vec![7u8; 45]);
        let sizes: Vec<usize> = split_chunks(&bytes, 20).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![20, 20, 5]);
    }

    #[test]
    fn test_split_chunks_exact_multiple() {
        let bytes = Bytes::from(vec![1u8; 40]);
        assert_eq!(split_chunks(&bytes, 20).count(), 2);
        assert_eq!(split_chunks(&Bytes::new(), 20).count(), 0);
    }

    #[test]
    fn test_split_chunks_reassemble() {
        let bytes = Bytes::from_static(b"the quick brown fox jumps over the lazy dog\n");
        let joined: Vec<u8> = split_chunks(&bytes, 7).flat_map(|c| c.to_vec()).collect();
        assert_eq!(joined, bytes.to_vec());
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_chunk_size, DEFAULT_MAX_CHUNK_SIZE);
        assert_eq!(config.write_mode, WriteMode::WithResponse);
        assert_eq!(config.ack_timeout, DEFAULT_ACK_TIMEOUT);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn test_send_chunks_and_reassembles() {
        let (_c, mut chunks, handle, _task, _scope) =
            spawn_channel_writer(true, WriterConfig::default());
        let frame = response(1, "a body long enough to need several chunks");

        handle.send(&frame).await.unwrap();

        let mut buffer = FrameBuffer::new();
        let mut decoded = Vec::new();
        while let Ok(chunk) = chunks.try_recv() {
            assert!(chunk.len() <= DEFAULT_MAX_CHUNK_SIZE);
            decoded.extend(buffer.push::<PhoneFrame>(&chunk));
        }
        assert_eq!(decoded, vec![Ok(frame)]);
    }

    #[tokio::test]
    async fn test_waits_for_ack_before_next_chunk() {
        let config = WriterConfig {
            max_chunk_size: 4,
            ..WriterConfig::default()
        };
        let (characteristic, mut chunks, handle, _task, _scope) =
            spawn_channel_writer(false, config);

        let sender = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send(&PhoneFrame::Pong { id: 1 }).await }
        });

        let first = chunks.recv().await.unwrap();
        assert_eq!(first.len(), 4);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(chunks.try_recv().is_err(), "second chunk written before ack");

        // Acknowledge until the frame is done.
        let mut received = first.to_vec();
        loop {
            characteristic.acknowledge(WriteAck::Completed);
            if sender.is_finished() {
                break;
            }
            if let Ok(Some(chunk)) =
                tokio::time::timeout(Duration::from_millis(100), chunks.recv()).await
            {
                received.extend_from_slice(&chunk);
            }
        }

        assert!(sender.await.unwrap().is_ok());
        assert!(received.ends_with(b"\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout_fails_frame_and_closes_scope() {
        let (_c, _chunks, handle, task, scope) =
            spawn_channel_writer(false, WriterConfig::default());

        let result = handle.send(&response(2, "x")).await;

        assert!(matches!(result, Err(BridgeError::AckTimeout { .. })));
        assert!(scope.is_cancelled());
        assert!(matches!(task.await.unwrap(), Err(BridgeError::WriteFailed(_))));

        // Later sends see a closed writer.
        let result = handle.send(&response(3, "y")).await;
        assert!(matches!(result, Err(BridgeError::ConnectionClosed)));
    }

    /// Characteristic whose every write is refused by the stack.
    struct Refusing;

    #[async_trait::async_trait]
    impl Characteristic for Refusing {
        async fn write(&self, _chunk: Bytes, _mode: WriteMode) -> Result<()> {
            Err(BridgeError::WriteFailed("GATT_INSUFFICIENT_RESOURCES".into()))
        }
    }

    #[tokio::test]
    async fn test_write_error_fails_frame_and_closes_scope() {
        let (_ack_handle, acks) = ack_slot();
        let scope = CancellationToken::new();
        let (handle, task) =
            spawn_writer_task(Arc::new(Refusing), acks, WriterConfig::default(), scope.clone());

        let result = handle.send(&response(7, "refused")).await;

        assert!(
            matches!(result, Err(BridgeError::WriteFailed(ref s)) if s.contains("INSUFFICIENT")),
            "got {result:?}"
        );
        assert!(scope.is_cancelled());
        assert!(matches!(task.await.unwrap(), Err(BridgeError::WriteFailed(_))));
    }

    #[tokio::test]
    async fn test_failed_ack_fails_frame_and_closes_scope() {
        let (characteristic, mut chunks, handle, task, scope) =
            spawn_channel_writer(false, WriterConfig::default());

        let sender = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send(&response(8, "nacked")).await }
        });

        chunks.recv().await.unwrap();
        assert!(characteristic.acknowledge(WriteAck::Failed("GATT_ERROR 133".into())));

        let result = sender.await.unwrap();
        assert!(
            matches!(result, Err(BridgeError::WriteFailed(ref s)) if s.contains("133")),
            "got {result:?}"
        );
        assert!(scope.is_cancelled());
        assert!(matches!(task.await.unwrap(), Err(BridgeError::WriteFailed(_))));
        assert!(chunks.try_recv().is_err(), "wrote past a failed chunk");
    }

    #[tokio::test]
    async fn test_without_response_needs_no_ack() {
        let config = WriterConfig {
            write_mode: WriteMode::WithoutResponse,
            ..WriterConfig::default()
        };
        let (_c, mut chunks, handle, _task, _scope) = spawn_channel_writer(false, config);

        handle.send(&response(4, "no acks needed")).await.unwrap();
        assert!(chunks.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_frame_is_dropped() {
        let (_c, mut chunks, handle, _task, _scope) =
            spawn_channel_writer(true, WriterConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = handle.send_unless_cancelled(&response(5, "late"), &cancel).await;

        assert!(matches!(result, Err(BridgeError::Cancelled)));
        handle.send(&PhoneFrame::Pong { id: 6 }).await.unwrap();
        let mut buffer = FrameBuffer::new();
        let mut decoded = Vec::new();
        while let Ok(chunk) = chunks.try_recv() {
            decoded.extend(buffer.push::<PhoneFrame>(&chunk));
        }
        assert_eq!(decoded, vec![Ok(PhoneFrame::Pong { id: 6 })]);
    }

    #[tokio::test]
    async fn test_enqueue_does_not_wait() {
        let (_c, mut chunks, handle, _task, _scope) =
            spawn_channel_writer(true, WriterConfig::default());

        handle.enqueue(&PhoneFrame::Pong { id: 42 }).unwrap();

        let first = chunks.recv().await.unwrap();
        assert!(first.starts_with(b"{\"v\":1"));
    }

    #[tokio::test]
    async fn test_enqueue_full_queue() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(1);
        let handle = WriterHandle {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
        };

        handle.enqueue(&PhoneFrame::Pong { id: 1 }).unwrap();
        let result = handle.enqueue(&PhoneFrame::Pong { id: 2 });

        assert!(matches!(result, Err(BridgeError::QueueFull)));
        assert_eq!(handle.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_scope_cancel() {
        let (_c, _chunks, handle, task, scope) =
            spawn_channel_writer(true, WriterConfig::default());

        scope.cancel();

        assert!(task.await.unwrap().is_ok());
        assert!(handle.is_closed());
    }
}
