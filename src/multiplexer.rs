//! Request multiplexer - routes board frames to concurrent handlers.
//!
//! Each `Request` gets its own task, a child of the connection's
//! cancellation scope, registered in the [`RequestRegistry`] until it
//! finishes. `Cancel` signals the matching task and forgets it; `Ping` is
//! answered straight away and never touches the table.
//!
//! # Example
//!
//! ```ignore
//! let mux = Multiplexer::new(executor, writer, scope.clone(), MultiplexerConfig::default());
//!
//! for frame in buffer.push::<BoardFrame>(chunk) {
//!     match frame {
//!         Ok(frame) => mux.dispatch(frame),
//!         Err(e) => warn!("Dropping frame: {}", e),
//!     }
//! }
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::executor::RequestExecutor;
use crate::handler::{RequestContext, RequestRegistry};
use crate::protocol::{BoardFrame, PhoneFrame, RequestMethod};
use crate::writer::WriterHandle;

/// Default cap on concurrently running requests.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 16;

/// What to do with a `Request` whose id is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateIdPolicy {
    /// Dispatch the new request; the old handler keeps running uncancelled
    /// but can no longer be cancelled by id.
    #[default]
    Shadow,
    /// Answer the new request with an `Error` and keep the old one.
    Reject,
}

/// Multiplexer settings.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub max_concurrent_requests: usize,
    pub duplicate_id_policy: DuplicateIdPolicy,
    /// Answer `Ping` with `Pong`.
    pub ping_enabled: bool,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            duplicate_id_policy: DuplicateIdPolicy::Shadow,
            ping_enabled: true,
        }
    }
}

/// Removes a handler's registry entry when its task ends, however it ends.
struct Completion {
    registry: Arc<RequestRegistry>,
    id: u32,
    generation: u64,
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.registry.complete(self.id, self.generation);
    }
}

/// Dispatches the decoded board frames of one connection.
pub struct Multiplexer {
    registry: Arc<RequestRegistry>,
    executor: RequestExecutor,
    writer: WriterHandle,
    scope: CancellationToken,
    permits: Arc<Semaphore>,
    config: MultiplexerConfig,
}

impl Multiplexer {
    /// Create a multiplexer whose handlers live in `scope`.
    pub fn new(
        executor: RequestExecutor,
        writer: WriterHandle,
        scope: CancellationToken,
        config: MultiplexerConfig,
    ) -> Self {
        Self {
            registry: Arc::new(RequestRegistry::new()),
            executor,
            writer,
            scope,
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            config,
        }
    }

    /// Route one board frame. Never blocks; handlers run on spawned tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, frame: BoardFrame) {
        if self.scope.is_cancelled() {
            debug!("Ignoring {:?}: connection closing", frame);
            return;
        }

        match frame {
            BoardFrame::Request {
                id,
                method,
                url,
                body,
            } => self.on_request(id, method, url, body),
            BoardFrame::Cancel { id } => self.on_cancel(id),
            BoardFrame::Ping { id } => self.on_ping(id),
        }
    }

    fn on_request(&self, id: u32, method: RequestMethod, url: String, body: Option<String>) {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Rejecting request {}: {} requests already in flight",
                    id, self.config.max_concurrent_requests
                );
                self.reject(id, "too many in-flight requests");
                return;
            }
        };

        let cancel = self.scope.child_token();
        let generation = match self.config.duplicate_id_policy {
            DuplicateIdPolicy::Shadow => {
                if self.registry.contains(id) {
                    warn!("Request id {} reused while in flight, shadowing", id);
                }
                self.registry.insert(id, cancel.clone())
            }
            DuplicateIdPolicy::Reject => match self.registry.try_insert(id, cancel.clone()) {
                Some(generation) => generation,
                None => {
                    warn!("Rejecting request {}: id already in flight", id);
                    self.reject(id, "duplicate request id");
                    return;
                }
            },
        };

        debug!("Dispatching request {} ({:?} {})", id, method, url);

        let ctx = RequestContext::with_writer(id, cancel, self.writer.clone());
        let executor = self.executor.clone();
        let completion = Completion {
            registry: self.registry.clone(),
            id,
            generation,
        };

        let task = tokio::spawn(async move {
            let _completion = completion;
            let _permit = permit;

            match executor.run(method, url, body, &ctx).await {
                Ok(()) => debug!("Request {} completed", id),
                Err(BridgeError::Cancelled) => debug!("Request {} cancelled", id),
                Err(e) => warn!("Request {} could not be answered: {}", id, e),
            }
        });

        self.registry.attach(id, generation, task);
    }

    fn on_cancel(&self, id: u32) {
        if self.registry.cancel(id) {
            debug!("Cancelled request {}", id);
        } else {
            debug!("Cancel for unknown request {}", id);
        }
    }

    fn on_ping(&self, id: u32) {
        if !self.config.ping_enabled {
            debug!("Ignoring ping {}", id);
            return;
        }
        self.reply(PhoneFrame::Pong { id });
    }

    /// Answer a request that was not dispatched.
    fn reject(&self, id: u32, message: &str) {
        self.reply(PhoneFrame::Error {
            id: Some(id),
            message: message.to_string(),
        });
    }

    /// Queue a frame written on the multiplexer's own behalf.
    ///
    /// When the writer queue is full the frame is handed to a task in the
    /// connection scope that waits for space, so `dispatch` never blocks.
    fn reply(&self, frame: PhoneFrame) {
        match self.writer.enqueue(&frame) {
            Ok(()) => {}
            Err(BridgeError::QueueFull) => {
                debug!(
                    "Writer queue full, deferring {} frame for {:?}",
                    frame.kind(),
                    frame.id()
                );
                let writer = self.writer.clone();
                let scope = self.scope.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = scope.cancelled() => {}
                        result = writer.send(&frame) => {
                            if let Err(e) = result {
                                warn!("Could not write {} frame for {:?}: {}", frame.kind(), frame.id(), e);
                            }
                        }
                    }
                });
            }
            Err(e) => warn!(
                "Could not queue {} frame for {:?}: {}",
                frame.kind(),
                frame.id(),
                e
            ),
        }
    }

    /// Number of running handlers.
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Whether a request with this id is in flight.
    pub fn is_in_flight(&self, id: u32) -> bool {
        self.registry.contains(id)
    }

    /// Cancel every handler and return their tasks.
    pub fn cancel_all(&self) -> Vec<JoinHandle<()>> {
        self.registry.cancel_all()
    }
}
