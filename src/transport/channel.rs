//! In-process characteristic backed by a tokio channel.
//!
//! Stands in for a real BLE stack when simulating the board on the host:
//! every written chunk is delivered to an `mpsc` receiver, and acknowledged
//! writes can be confirmed automatically.
//!
//! # Example
//!
//! ```ignore
//! use ble_http_bridge::transport::ChannelCharacteristic;
//!
//! let (characteristic, mut chunks) = ChannelCharacteristic::new(true);
//! let handle = bridge.connect(std::sync::Arc::new(characteristic)).await?;
//! while let Some(chunk) = chunks.recv().await {
//!     // feed the board-side reassembler
//! }
//! ```

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{AckHandle, Characteristic, WriteAck, WriteMode};
use crate::error::{BridgeError, Result};

/// Characteristic delivering written chunks to a channel.
pub struct ChannelCharacteristic {
    tx: mpsc::UnboundedSender<Bytes>,
    auto_ack: bool,
    acks: Mutex<Option<AckHandle>>,
}

impl ChannelCharacteristic {
    /// Create the characteristic and the receiver its chunks go to.
    ///
    /// With `auto_ack`, acknowledged writes are confirmed as soon as the
    /// chunk is queued. Without it, confirm them through
    /// [`acknowledge`](Self::acknowledge).
    pub fn new(auto_ack: bool) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                auto_ack,
                acks: Mutex::new(None),
            },
            rx,
        )
    }

    /// Confirm the last acknowledged write by hand.
    pub fn acknowledge(&self, ack: WriteAck) -> bool {
        let acks = self.acks.lock().unwrap_or_else(PoisonError::into_inner);
        acks.as_ref().is_some_and(|h| h.acknowledge(ack))
    }
}

#[async_trait]
impl Characteristic for ChannelCharacteristic {
    async fn write(&self, chunk: Bytes, mode: WriteMode) -> Result<()> {
        self.tx
            .send(chunk)
            .map_err(|_| BridgeError::ConnectionClosed)?;

        if self.auto_ack && mode == WriteMode::WithResponse {
            self.acknowledge(WriteAck::Completed);
        }
        Ok(())
    }

    fn bind(&self, acks: AckHandle) {
        *self.acks.lock().unwrap_or_else(PoisonError::into_inner) = Some(acks);
    }
}
