//! Transports, client/server state machines and the host-facing entry points
//! of the request/response messaging engine.
//!
//! ```no_run
//! # async fn demo() -> rsm_core::Result<()> {
//! use rsm_transport::{RSocketFactory, RSocketServer};
//! use rsm_core::{Payload, TransportConfig};
//!
//! let server = RSocketServer::new(TransportConfig::tcp("127.0.0.1:7878")?)?;
//! server.start().await?;
//!
//! let client = RSocketFactory::tcp_client("127.0.0.1:7878")?;
//! client.connect().await?;
//! let reply = client.request_response(Payload::from_text("ping", None)).await?;
//! assert_eq!(reply.data_utf8()?, Some("ping"));
//! # Ok(())
//! # }
//! ```

pub mod bench;
pub mod client;
pub mod connector;
pub mod factory;
pub mod framed;
pub mod handler;
pub mod multi_server;
pub mod overlay;
pub mod quic;
pub mod quic_cert;
pub mod server;
pub mod session;
pub mod tcp;
pub mod websocket;

use rsm_core::{PerformanceMetrics, Result, TransportConfig, TransportType};
use serde::Serialize;
use std::sync::Arc;

pub use bench::{benchmark_transport_performance, BenchmarkReport};
pub use client::RSocketClient;
pub use connector::{ByteStream, Listener, TransportConnector};
pub use factory::RSocketFactory;
pub use handler::{EchoHandler, FnHandler, RequestHandler};
pub use multi_server::MultiTransportServer;
pub use rsm_core::{create_payload, enable_optimizations, OptimizationFlags, Payload, PayloadValue};
pub use server::{RSocketServer, ServerState};
pub use session::{ConnectionState, SessionContext, SessionInfo};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Transport kind names, in canonical order
pub fn supported_transports() -> Vec<&'static str> {
    TransportType::ALL.iter().map(|kind| kind.as_str()).collect()
}

/// Process-wide metrics aggregate; clients and servers record into it only
/// when built with it explicitly
pub fn performance_metrics() -> Arc<PerformanceMetrics> {
    PerformanceMetrics::global()
}

pub fn create_client(config: TransportConfig) -> Result<RSocketClient> {
    RSocketFactory::create_client(config)
}

pub fn create_server(config: TransportConfig) -> Result<RSocketServer> {
    RSocketFactory::create_server(config)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub transports: Vec<&'static str>,
    pub features: Vec<&'static str>,
}

pub fn library_info() -> LibraryInfo {
    LibraryInfo {
        name: env!("CARGO_PKG_NAME"),
        version: version(),
        transports: supported_transports(),
        features: vec![
            "request-response",
            "fire-and-forget",
            "batch-codec",
            "multi-transport-server",
            "performance-metrics",
        ],
    }
}
