use rsm_core::{Payload, PerformanceMetrics, TransportConfig};
use rsm_transport::RSocketClient;
use std::sync::Arc;
use std::time::Duration;

use super::TestServer;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected client with timeouts around every suspension point
pub struct TestClient {
    client: Arc<RSocketClient>,
}

impl TestClient {
    /// Connect to a test server
    pub async fn connect(server: &TestServer) -> anyhow::Result<Self> {
        Self::connect_with_config(server.client_config()?).await
    }

    pub async fn connect_with_config(config: TransportConfig) -> anyhow::Result<Self> {
        let client = RSocketClient::new(config)?;
        tokio::time::timeout(CONNECT_TIMEOUT, client.connect())
            .await
            .map_err(|_| anyhow::anyhow!("Connect timed out"))??;

        tracing::info!("Test client connected via {}", client.config());

        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub async fn request(&self, payload: Payload) -> anyhow::Result<Payload> {
        let reply = tokio::time::timeout(REQUEST_TIMEOUT, self.client.request_response(payload))
            .await
            .map_err(|_| anyhow::anyhow!("Request timed out"))??;
        Ok(reply)
    }

    pub async fn request_text(&self, text: &str) -> anyhow::Result<String> {
        let reply = self.request(Payload::from_text(text, None)).await?;
        Ok(reply.data_utf8()?.unwrap_or_default().to_string())
    }

    pub fn metrics(&self) -> Arc<PerformanceMetrics> {
        self.client.metrics()
    }

    pub fn inner(&self) -> Arc<RSocketClient> {
        self.client.clone()
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.client.close().await?;
        Ok(())
    }
}
