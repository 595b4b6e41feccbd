//! Bridge controller - per-connection wiring and teardown.
//!
//! On connect the controller builds a fresh set of connection state: a
//! cancellation scope, a writer task bound to the phone→board
//! characteristic, a multiplexer and a reader task that owns the frame
//! buffer. Nothing is shared between connections, so a handler left over
//! from an old connection can only reach the old (closed) writer.
//!
//! ```text
//! notify ─► ConnectionHandle ─► reader task ─► FrameBuffer ─► Multiplexer
//!                                                               │ spawn
//! write ◄── Writer task ◄──────── RequestContext ◄── handler task
//! ```
//!
//! # Example
//!
//! ```ignore
//! let bridge = BridgeController::builder().trusted_host("lichess.org").build()?;
//!
//! let handle = bridge.connect(characteristic).await;
//! // from the BLE callbacks:
//! handle.chunk_received(&notification);
//! handle.write_acknowledged(WriteAck::Completed);
//!
//! // on link loss, or once `handle.closed()` resolves:
//! bridge.disconnect().await;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BridgeBuilder, BridgeConfig};
use crate::error::Result;
use crate::executor::RequestExecutor;
use crate::multiplexer::Multiplexer;
use crate::protocol::{BoardFrame, FrameBuffer};
use crate::transport::{ack_slot, AckHandle, Characteristic, WriteAck};
use crate::writer::spawn_writer_task;

/// State of one live connection.
struct Connection {
    id: u64,
    scope: CancellationToken,
    multiplexer: Arc<Multiplexer>,
    reader: JoinHandle<()>,
    writer: JoinHandle<Result<()>>,
}

/// Owns the bridge's connection lifecycle.
pub struct BridgeController {
    config: BridgeConfig,
    executor: RequestExecutor,
    active: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

impl BridgeController {
    /// Create a new bridge builder.
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::new()
    }

    /// Create a controller from validated settings.
    pub fn new(config: BridgeConfig, executor: RequestExecutor) -> Self {
        Self {
            config,
            executor,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// The controller's settings.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Wire up a newly established connection.
    ///
    /// `characteristic` is the phone→board characteristic. Any previous
    /// connection is torn down first.
    pub async fn connect(&self, characteristic: Arc<dyn Characteristic>) -> ConnectionHandle {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!("Replacing connection {}", previous.id);
            self.teardown(previous).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let scope = CancellationToken::new();

        let (acks, ack_rx) = ack_slot();
        characteristic.bind(acks.clone());
        let (writer, writer_task) = spawn_writer_task(
            characteristic,
            ack_rx,
            self.config.writer_config(),
            scope.clone(),
        );

        let multiplexer = Arc::new(Multiplexer::new(
            self.executor.clone(),
            writer,
            scope.clone(),
            self.config.multiplexer_config(),
        ));

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let buffer = FrameBuffer::with_max_frame_size(self.config.max_frame_size);
        let reader = tokio::spawn(read_loop(
            id,
            chunk_rx,
            buffer,
            multiplexer.clone(),
            scope.clone(),
        ));

        info!("Connection {} established", id);

        *active = Some(Connection {
            id,
            scope: scope.clone(),
            multiplexer,
            reader,
            writer: writer_task,
        });

        ConnectionHandle {
            id,
            chunks: chunk_tx,
            acks,
            scope,
        }
    }

    /// Tear down the current connection.
    ///
    /// Cancels every in-flight request, drops the partial frame buffer and
    /// stops the writer. Returns `false` if there was no connection.
    pub async fn disconnect(&self) -> bool {
        let previous = self.active.lock().await.take();
        match previous {
            Some(connection) => {
                self.teardown(connection).await;
                true
            }
            None => false,
        }
    }

    /// Whether a connection is wired up (it may have failed since).
    pub async fn is_connected(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Number of requests in flight on the current connection.
    pub async fn in_flight(&self) -> usize {
        self.active
            .lock()
            .await
            .as_ref()
            .map_or(0, |c| c.multiplexer.in_flight())
    }

    async fn teardown(&self, connection: Connection) {
        let Connection {
            id,
            scope,
            multiplexer,
            reader,
            writer,
        } = connection;

        scope.cancel();
        let handlers = multiplexer.cancel_all();
        let cancelled = handlers.len();

        let grace = self.config.shutdown_grace();
        let aborts: Vec<_> = handlers.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, join_all(handlers)).await.is_err() {
            warn!(
                "Connection {}: handlers still running after {:?}, aborting",
                id, grace
            );
            aborts.iter().for_each(|a| a.abort());
        }

        let reader_abort = reader.abort_handle();
        if tokio::time::timeout(grace, reader).await.is_err() {
            reader_abort.abort();
        }

        let writer_abort = writer.abort_handle();
        match tokio::time::timeout(grace, writer).await {
            Ok(Ok(Err(e))) => debug!("Connection {}: writer had failed: {}", id, e),
            Ok(_) => {}
            Err(_) => writer_abort.abort(),
        }

        info!(
            "Connection {} closed ({} request(s) cancelled)",
            id, cancelled
        );
    }
}

impl Drop for BridgeController {
    fn drop(&mut self) {
        if let Some(connection) = self.active.get_mut().take() {
            connection.scope.cancel();
            connection.multiplexer.cancel_all();
        }
    }
}

/// Feeds board→phone notifications through the frame buffer.
async fn read_loop(
    id: u64,
    mut chunks: mpsc::UnboundedReceiver<Bytes>,
    mut buffer: FrameBuffer,
    multiplexer: Arc<Multiplexer>,
    scope: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            chunk = chunks.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        for frame in buffer.push::<BoardFrame>(&chunk) {
            match frame {
                Ok(frame) => multiplexer.dispatch(frame),
                Err(e) => warn!("Connection {}: dropping board frame: {}", id, e),
            }
        }
    }

    if !buffer.is_empty() {
        debug!(
            "Connection {}: discarding {} bytes of partial frame",
            id,
            buffer.len()
        );
    }
    buffer.clear();
}

/// The embedding app's side of one connection.
///
/// Cheap to clone. The methods never block, so they can be called directly
/// from BLE callbacks. Once the connection is gone they become no-ops.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: u64,
    chunks: mpsc::UnboundedSender<Bytes>,
    acks: AckHandle,
    scope: CancellationToken,
}

impl ConnectionHandle {
    /// Connection number, unique per controller.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Hand over a notification received on the board→phone characteristic.
    ///
    /// Returns `false` if the connection is closed.
    pub fn chunk_received(&self, chunk: &[u8]) -> bool {
        if self.scope.is_cancelled() {
            return false;
        }
        self.chunks.send(Bytes::copy_from_slice(chunk)).is_ok()
    }

    /// Report the outcome of an acknowledged write.
    pub fn write_acknowledged(&self, ack: WriteAck) -> bool {
        self.acks.acknowledge(ack)
    }

    /// Whether the connection was torn down or its writer failed.
    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Wait until the connection is torn down or its writer fails.
    pub async fn closed(&self) {
        self.scope.cancelled().await
    }
}
