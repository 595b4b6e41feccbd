//! # ble-http-bridge
//!
//! Phone-side HTTP-over-BLE bridge for a board that can only talk Bluetooth
//! Low Energy.
//!
//! The board sends newline-delimited JSON request frames over one
//! characteristic; the bridge performs the HTTP calls and streams the
//! answers back over the other, chunked to the transport's payload limit.
//!
//! ## Architecture
//!
//! - **Protocol**: versioned JSON frames, reassembled from arbitrary chunks
//! - **Writer**: one task per connection, one frame at a time, acknowledged chunks
//! - **Multiplexer**: concurrent handlers keyed by request id, cancellable by id
//! - **Executor**: unary and line-streaming upstream calls, bearer token for the trusted host
//!
//! ## Example
//!
//! ```ignore
//! use ble_http_bridge::BridgeController;
//!
//! #[tokio::main]
//! async fn main() -> ble_http_bridge::Result<()> {
//!     let bridge = BridgeController::builder()
//!         .trusted_host("lichess.org")
//!         .build()?;
//!
//!     let handle = bridge.connect(characteristic).await;
//!     handle.chunk_received(&notification);
//!     handle.closed().await;
//!     bridge.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod multiplexer;
pub mod protocol;
pub mod transport;
pub mod writer;

pub use bridge::{BridgeController, ConnectionHandle};
pub use config::{BridgeBuilder, BridgeConfig};
pub use error::{BridgeError, Result};
pub use handler::RequestContext;
pub use multiplexer::DuplicateIdPolicy;
