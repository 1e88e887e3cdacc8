// Benchmarks package for the request/response engine
// This is a library crate that provides benchmarking utilities

pub mod utils {
    use rsm_core::{TransportConfig, TransportType};
    use rsm_transport::{RSocketClient, RSocketServer};
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_PEER: AtomicU64 = AtomicU64::new(1);

    /// Listen address on a free port (or a fresh overlay identifier)
    pub fn listen_address(kind: TransportType) -> String {
        match kind {
            TransportType::Tcp | TransportType::Quic => "127.0.0.1:0".to_string(),
            TransportType::WebSocket => "ws://127.0.0.1:0/rsocket".to_string(),
            TransportType::Overlay => format!(
                "iroh://bench-{}-{}",
                std::process::id(),
                NEXT_PEER.fetch_add(1, Ordering::Relaxed)
            ),
        }
    }

    /// Running echo server plus a connected client
    pub async fn setup_echo_pair(kind: TransportType) -> anyhow::Result<(RSocketServer, RSocketClient)> {
        setup_echo_pair_with(kind, |config| config).await
    }

    /// Like [`setup_echo_pair`], letting the caller tune both configs
    pub async fn setup_echo_pair_with<F>(
        kind: TransportType,
        tune: F,
    ) -> anyhow::Result<(RSocketServer, RSocketClient)>
    where
        F: Fn(TransportConfig) -> TransportConfig,
    {
        let server = RSocketServer::new(tune(TransportConfig::new(kind, listen_address(kind), None)?))?;
        server.start().await?;
        let address = server
            .local_address()
            .ok_or_else(|| anyhow::anyhow!("server did not bind"))?;

        let client = RSocketClient::new(tune(TransportConfig::new(kind, address, None)?))?;
        client.connect().await?;

        Ok((server, client))
    }

    /// Close both ends of a pair
    pub async fn teardown(server: RSocketServer, client: RSocketClient) -> anyhow::Result<()> {
        client.close().await?;
        server.stop().await?;
        Ok(())
    }
}
