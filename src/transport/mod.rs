//! Transport module - the BLE characteristic seam.
//!
//! The bridge never talks to a BLE stack directly. The embedding app
//! provides a [`Characteristic`] for the phone→board direction and feeds
//! board→phone notifications into the
//! [`ConnectionHandle`](crate::bridge::ConnectionHandle).
//!
//! Writes in [`WriteMode::WithResponse`] are confirmed asynchronously: the
//! platform's write callback reports through an [`AckHandle`], a single-slot
//! signal the writer awaits after every chunk. Only the writer task consumes
//! it, so at most one acknowledgment wait is ever outstanding.

mod channel;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{BridgeError, Result};

pub use channel::ChannelCharacteristic;

/// GATT service exposing the bridge characteristics.
pub const SERVICE_UUID: &str = "b4d75b6c-7284-4268-8621-6e3cef3c6ac4";

/// Board→phone characteristic (requests arrive as notifications).
pub const REQUEST_CHARACTERISTIC_UUID: &str = "aa8381af-049a-46c2-9c92-1db7bd28883c";

/// Phone→board characteristic (responses are written here).
pub const RESPONSE_CHARACTERISTIC_UUID: &str = "29e463e6-a210-4234-8d1d-4daf345b41de";

/// Payload of the smallest BLE ATT MTU (23 bytes minus the 3-byte ATT header).
pub const MIN_MTU_PAYLOAD: usize = 20;

/// Characteristic write mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Acknowledged write; the next chunk waits for the acknowledgment.
    #[default]
    WithResponse,
    /// Unacknowledged write.
    WithoutResponse,
}

/// Outcome reported by the platform's write callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAck {
    /// The write completed.
    Completed,
    /// The stack reported a failure status.
    Failed(String),
}

/// The phone→board characteristic of one connection.
#[async_trait]
pub trait Characteristic: Send + Sync {
    /// Submit one chunk (at most the configured chunk size).
    ///
    /// Must return once the write is submitted; completion of an
    /// acknowledged write is reported through the bound [`AckHandle`].
    async fn write(&self, chunk: Bytes, mode: WriteMode) -> Result<()>;

    /// Called once per connection with the handle its write callback must
    /// report to.
    fn bind(&self, _acks: AckHandle) {}
}

/// Sending side of the acknowledgment slot. Cheap to clone, safe to use
/// from the platform's callback thread.
#[derive(Clone, Debug)]
pub struct AckHandle {
    tx: mpsc::Sender<WriteAck>,
}

impl AckHandle {
    /// Report the outcome of the last acknowledged write.
    ///
    /// Never blocks. Returns `false` if the acknowledgment was dropped
    /// (connection gone, or a previous acknowledgment not yet consumed).
    pub fn acknowledge(&self, ack: WriteAck) -> bool {
        match self.tx.try_send(ack) {
            Ok(()) => true,
            Err(TrySendError::Full(ack)) => {
                tracing::warn!("Dropping unexpected write acknowledgment {:?}", ack);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Receiving side of the acknowledgment slot, owned by the writer task.
#[derive(Debug)]
pub struct AckReceiver {
    rx: mpsc::Receiver<WriteAck>,
}

impl AckReceiver {
    /// Discard acknowledgments that arrived while nothing was waiting.
    pub fn drain_stale(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// Wait for the acknowledgment of the chunk just written.
    pub async fn wait(&mut self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(WriteAck::Completed)) => Ok(()),
            Ok(Some(WriteAck::Failed(status))) => Err(BridgeError::WriteFailed(status)),
            Ok(None) => Err(BridgeError::ConnectionClosed),
            Err(_) => Err(BridgeError::AckTimeout { timeout }),
        }
    }
}

/// Create a single-slot acknowledgment channel.
pub fn ack_slot() -> (AckHandle, AckReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (AckHandle { tx }, AckReceiver { rx })
}
