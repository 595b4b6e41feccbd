//! Error types for the bridge.

use std::time::Duration;

use thiserror::Error;

use crate::executor::HttpError;

/// Main error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// I/O error from the embedding transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Protocol error (frame could not be produced, unexpected state, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection (or its writer) is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A chunk written in acknowledged mode was not confirmed in time.
    #[error("Write not acknowledged within {timeout:?}")]
    AckTimeout {
        /// The configured acknowledgment timeout.
        timeout: Duration,
    },

    /// The outgoing frame queue is full.
    #[error("Writer queue full")]
    QueueFull,

    /// The transport rejected a chunk write.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The request was cancelled; no frame was emitted.
    #[error("Request cancelled")]
    Cancelled,

    /// Upstream HTTP failure.
    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
