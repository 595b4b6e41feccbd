//! Plays the board against a real bridge in one process.
//!
//! The bridge writes into an in-process characteristic; this program feeds it
//! a chunked `Request` frame, then prints every frame it gets back.
//!
//! ```text
//! RUST_LOG=ble_http_bridge=debug cargo run --example loopback -- https://lichess.org/api/status
//! ```

use std::sync::Arc;
use std::time::Duration;

use ble_http_bridge::executor::ReqwestClient;
use ble_http_bridge::protocol::{encode, BoardFrame, FrameBuffer, PhoneFrame, RequestMethod};
use ble_http_bridge::transport::{ChannelCharacteristic, MIN_MTU_PAYLOAD};
use ble_http_bridge::BridgeController;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://lichess.org/api/status".to_string());

    let bridge = BridgeController::builder()
        .http_client(Arc::new(
            ReqwestClient::new().with_timeout(Duration::from_secs(15)),
        ))
        .build()?;

    let (characteristic, mut chunks) = ChannelCharacteristic::new(true);
    let handle = bridge.connect(Arc::new(characteristic)).await;

    let request = encode(&BoardFrame::Request {
        id: 1,
        method: RequestMethod::Get,
        url,
        body: None,
    })?;
    for chunk in request.chunks(MIN_MTU_PAYLOAD) {
        handle.chunk_received(chunk);
    }
    handle.chunk_received(&encode(&BoardFrame::Ping { id: 2 })?);

    let mut buffer = FrameBuffer::new();
    let mut pending = 2;
    while pending > 0 {
        let Ok(Some(chunk)) = tokio::time::timeout(Duration::from_secs(20), chunks.recv()).await
        else {
            eprintln!("no answer from the bridge");
            break;
        };

        for frame in buffer.push::<PhoneFrame>(&chunk) {
            match frame {
                Ok(frame) => {
                    println!("{frame:?}");
                    if frame.is_terminal() || matches!(frame, PhoneFrame::Pong { .. }) {
                        pending -= 1;
                    }
                }
                Err(e) => eprintln!("undecodable frame: {e}"),
            }
        }
    }

    bridge.disconnect().await;
    Ok(())
}
