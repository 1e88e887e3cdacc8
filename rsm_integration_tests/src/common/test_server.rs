use rsm_core::{PerformanceMetrics, TransportConfig, TransportType};
use rsm_transport::{RSocketServer, RequestHandler};
use std::sync::Arc;

use super::ephemeral_address;

/// Running server on an ephemeral address, stopped on `stop` or drop
pub struct TestServer {
    server: RSocketServer,
    kind: TransportType,
    address: String,
}

impl TestServer {
    /// Echo server for `kind`
    pub async fn start(kind: TransportType) -> anyhow::Result<Self> {
        Self::from_server(RSocketServer::new(TransportConfig::new(
            kind,
            ephemeral_address(kind),
            None,
        )?)?)
        .await
    }

    pub async fn with_handler(
        kind: TransportType,
        handler: Arc<dyn RequestHandler>,
    ) -> anyhow::Result<Self> {
        let config = TransportConfig::new(kind, ephemeral_address(kind), None)?;
        Self::from_server(RSocketServer::with_handler(config, handler)?).await
    }

    /// Start an already configured server
    pub async fn from_server(server: RSocketServer) -> anyhow::Result<Self> {
        server.start().await?;
        let address = server
            .local_address()
            .ok_or_else(|| anyhow::anyhow!("server has no bound address"))?;
        let kind = server.transport_type();

        tracing::info!("Test server ({}) listening on {}", kind, address);

        Ok(Self {
            server,
            kind,
            address,
        })
    }

    /// Dialable address of the server
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn kind(&self) -> TransportType {
        self.kind
    }

    pub fn client_config(&self) -> anyhow::Result<TransportConfig> {
        Ok(TransportConfig::new(self.kind, self.address.clone(), None)?)
    }

    pub fn metrics(&self) -> Arc<PerformanceMetrics> {
        self.server.metrics()
    }

    pub fn session_count(&self) -> usize {
        self.server.session_count()
    }

    pub fn inner(&self) -> &RSocketServer {
        &self.server
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        self.server.stop().await?;
        Ok(())
    }
}
