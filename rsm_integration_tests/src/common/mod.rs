// Common test utilities for integration tests
#![allow(dead_code)]

pub mod test_client;
pub mod test_server;

pub use test_client::TestClient;
pub use test_server::TestServer;

use bytes::Bytes;
use rand::RngCore;
use rsm_core::TransportType;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_PEER: AtomicU64 = AtomicU64::new(1);

/// Listen address for `kind` that lets the OS (or the overlay registry) pick
/// a free slot
pub fn ephemeral_address(kind: TransportType) -> String {
    match kind {
        TransportType::Tcp | TransportType::Quic => "127.0.0.1:0".to_string(),
        TransportType::WebSocket => "ws://127.0.0.1:0/rsocket".to_string(),
        TransportType::Overlay => format!(
            "iroh://it-{}-{}",
            std::process::id(),
            NEXT_PEER.fetch_add(1, Ordering::Relaxed)
        ),
    }
}

/// Random bytes of the given size
pub fn random_bytes(size: usize) -> Bytes {
    let mut content = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut content);
    Bytes::from(content)
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    condition()
}
