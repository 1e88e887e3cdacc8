//! One handler served over several transports at once.

use rsm_core::{PerformanceMetrics, Result, RsmError, TransportConfig};
use std::fmt;
use std::sync::Arc;

use crate::handler::{EchoHandler, RequestHandler};
use crate::server::RSocketServer;

/// A set of named [`RSocketServer`]s sharing one handler and one metrics
/// instance, started and stopped together.
///
/// ```no_run
/// # async fn demo() -> rsm_core::Result<()> {
/// use rsm_core::TransportConfig;
/// use rsm_transport::MultiTransportServer;
///
/// let server = MultiTransportServer::new()
///     .add_transport("tcp", TransportConfig::tcp("127.0.0.1:7878")?)?
///     .add_transport("ws", TransportConfig::websocket("ws://127.0.0.1:7879/rsocket")?)?;
/// server.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct MultiTransportServer {
    servers: Vec<(String, RSocketServer)>,
    handler: Arc<dyn RequestHandler>,
    metrics: Arc<PerformanceMetrics>,
}

impl MultiTransportServer {
    /// Echo on every transport
    pub fn new() -> Self {
        Self::with_handler(Arc::new(EchoHandler))
    }

    pub fn with_handler(handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            servers: Vec::new(),
            handler,
            metrics: PerformanceMetrics::shared(),
        }
    }

    /// Record into `metrics`, including transports added earlier
    pub fn with_metrics(self, metrics: Arc<PerformanceMetrics>) -> Self {
        let servers = self
            .servers
            .into_iter()
            .map(|(name, server)| (name, server.with_metrics(metrics.clone())))
            .collect();
        Self {
            servers,
            handler: self.handler,
            metrics,
        }
    }

    /// Add a transport under a unique name
    pub fn add_transport(mut self, name: impl Into<String>, config: TransportConfig) -> Result<Self> {
        let name = name.into();
        if self.server(&name).is_some() {
            return Err(RsmError::bind_failed(format!("transport name {} already in use", name)));
        }
        let server = RSocketServer::with_handler(config, self.handler.clone())?.with_metrics(self.metrics.clone());
        self.servers.push((name, server));
        Ok(self)
    }

    /// Start every transport in order.
    ///
    /// If one fails to bind, those already started are stopped again and
    /// the bind error is returned.
    pub async fn start(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(RsmError::bind_failed("no transports configured"));
        }

        for (index, (name, server)) in self.servers.iter().enumerate() {
            if let Err(e) = server.start().await {
                tracing::error!(transport = %name, error = %e, "Transport failed to start");
                for (_, started) in &self.servers[..index] {
                    started.stop().await?;
                }
                return Err(e);
            }
            tracing::info!(
                transport = %name,
                addr = %server.local_address().unwrap_or_default(),
                "Transport started"
            );
        }

        tracing::info!(transports = self.servers.len(), "Multi-transport server running");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        for (_, server) in &self.servers {
            server.stop().await?;
        }
        tracing::info!(transports = self.servers.len(), "Multi-transport server stopped");
        Ok(())
    }

    /// `true` while every transport is running
    pub fn is_running(&self) -> bool {
        !self.servers.is_empty() && self.servers.iter().all(|(_, server)| server.is_running())
    }

    pub fn transports(&self) -> Vec<&str> {
        self.servers.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn server(&self, name: &str) -> Option<&RSocketServer> {
        self.servers
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, server)| server)
    }

    /// Dialable address of a running transport
    pub fn local_address(&self, name: &str) -> Option<String> {
        self.server(name).and_then(|server| server.local_address())
    }

    pub fn session_count(&self) -> usize {
        self.servers.iter().map(|(_, server)| server.session_count()).sum()
    }

    pub fn metrics(&self) -> Arc<PerformanceMetrics> {
        self.metrics.clone()
    }
}

impl Default for MultiTransportServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MultiTransportServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiTransportServer")
            .field("transports", &self.transports())
            .field("running", &self.is_running())
            .finish()
    }
}
