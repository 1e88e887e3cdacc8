//! Ready-made client/server construction. Nothing here performs I/O.

use rsm_core::{PerformanceMode, Result, TransportConfig, TransportType};
use std::collections::HashMap;

use crate::client::RSocketClient;
use crate::server::RSocketServer;

pub struct RSocketFactory;

impl RSocketFactory {
    pub fn create_client(config: TransportConfig) -> Result<RSocketClient> {
        RSocketClient::new(config)
    }

    pub fn create_server(config: TransportConfig) -> Result<RSocketServer> {
        RSocketServer::new(config)
    }

    /// Resolve the kind by name, then build a client
    pub fn client_for(
        kind: &str,
        address: &str,
        options: Option<HashMap<String, String>>,
    ) -> Result<RSocketClient> {
        RSocketClient::new(TransportConfig::parse(kind, address, options)?)
    }

    pub fn server_for(
        kind: &str,
        address: &str,
        options: Option<HashMap<String, String>>,
    ) -> Result<RSocketServer> {
        RSocketServer::new(TransportConfig::parse(kind, address, options)?)
    }

    pub fn tcp_client(address: &str) -> Result<RSocketClient> {
        RSocketClient::new(TransportConfig::tcp(address)?)
    }

    pub fn tcp_server(address: &str) -> Result<RSocketServer> {
        RSocketServer::new(TransportConfig::tcp(address)?)
    }

    pub fn websocket_client(url: &str) -> Result<RSocketClient> {
        RSocketClient::new(TransportConfig::websocket(url)?)
    }

    pub fn websocket_server(url: &str) -> Result<RSocketServer> {
        RSocketServer::new(TransportConfig::websocket(url)?)
    }

    pub fn quic_client(address: &str) -> Result<RSocketClient> {
        RSocketClient::new(TransportConfig::quic(address)?)
    }

    pub fn quic_server(address: &str) -> Result<RSocketServer> {
        RSocketServer::new(TransportConfig::quic(address)?)
    }

    pub fn overlay_client(address: &str) -> Result<RSocketClient> {
        RSocketClient::new(TransportConfig::overlay(address)?)
    }

    pub fn overlay_server(address: &str) -> Result<RSocketServer> {
        RSocketServer::new(TransportConfig::overlay(address)?)
    }

    /// Client with the requested tuning flags preset; enabling both also
    /// selects the high performance mode
    pub fn create_optimized_client(
        kind: TransportType,
        address: &str,
        enable_vectorized: bool,
        enable_concurrency: bool,
    ) -> Result<RSocketClient> {
        let mut config = TransportConfig::new(kind, address, None)?;
        if enable_vectorized {
            config = config.with_vectorized_processing();
        }
        if enable_concurrency {
            config = config.with_concurrency_optimizations();
        }
        if enable_vectorized && enable_concurrency {
            config = config.with_performance_mode(PerformanceMode::High);
        }
        RSocketClient::new(config)
    }

    /// Server in high performance mode servicing up to `max_sessions`
    /// connections at once
    pub fn create_high_performance_server(
        kind: TransportType,
        address: &str,
        max_sessions: usize,
    ) -> Result<RSocketServer> {
        let config = TransportConfig::new(kind, address, None)?
            .with_performance_mode(PerformanceMode::High);
        Ok(RSocketServer::new(config)?.with_max_sessions(max_sessions))
    }
}
