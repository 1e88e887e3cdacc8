use async_trait::async_trait;
use bytes::Bytes;
use rsm_core::config::TuningOptions;
use rsm_core::{Result, RsmError, TransportType};
use std::io;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinError;

use crate::{overlay, quic, tcp, websocket};

/// A live, message-oriented byte connection.
///
/// Implementations deliver exactly the frames handed to `send` on the other
/// side, one `receive` per frame. After `close` returns, pending and future
/// calls fail with [`RsmError::ConnectionClosed`].
#[async_trait]
pub trait ByteStream: Send + Sync {
    async fn send(&self, frame: Bytes) -> Result<()>;

    async fn receive(&self) -> Result<Bytes>;

    async fn close(&self) -> Result<()>;

    /// Human-readable remote endpoint
    fn peer(&self) -> String;
}

/// A bound endpoint producing [`ByteStream`]s
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next peer; fails with [`RsmError::ListenerClosed`] once
    /// the listener is closed
    async fn accept(&self) -> Result<Box<dyn ByteStream>>;

    /// Address a client can dial to reach this listener
    fn local_addr(&self) -> String;

    async fn close(&self);
}

/// One variant per transport kind; selection is a pure function of the kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportConnector {
    Tcp,
    WebSocket,
    Quic,
    Overlay,
}

impl TransportConnector {
    pub fn for_kind(kind: TransportType) -> Self {
        match kind {
            TransportType::Tcp => TransportConnector::Tcp,
            TransportType::WebSocket => TransportConnector::WebSocket,
            TransportType::Quic => TransportConnector::Quic,
            TransportType::Overlay => TransportConnector::Overlay,
        }
    }

    pub fn kind(&self) -> TransportType {
        match self {
            TransportConnector::Tcp => TransportType::Tcp,
            TransportConnector::WebSocket => TransportType::WebSocket,
            TransportConnector::Quic => TransportType::Quic,
            TransportConnector::Overlay => TransportType::Overlay,
        }
    }

    /// Dial `address`; every failure is reported as `ConnectionFailed`
    pub async fn open_client(
        &self,
        address: &str,
        tuning: &TuningOptions,
    ) -> Result<Box<dyn ByteStream>> {
        self.kind().validate_address(address)?;
        let opened = match self {
            TransportConnector::Tcp => tcp::connect(address, tuning).await,
            TransportConnector::WebSocket => websocket::connect(address, tuning).await,
            TransportConnector::Quic => quic::connect(address, tuning).await,
            TransportConnector::Overlay => overlay::connect(address, tuning).await,
        };
        opened.map_err(|e| match e {
            RsmError::ConnectionFailed(_) | RsmError::InvalidAddress { .. } => e,
            other => RsmError::connection_failed(format!("{} {}: {}", self.kind(), address, other)),
        })
    }

    /// Bind `address`; every failure is reported as `BindFailed`
    pub async fn open_server(
        &self,
        address: &str,
        tuning: &TuningOptions,
    ) -> Result<Box<dyn Listener>> {
        self.kind().validate_address(address)?;
        let bound = match self {
            TransportConnector::Tcp => tcp::bind(address, tuning).await,
            TransportConnector::WebSocket => websocket::bind(address, tuning).await,
            TransportConnector::Quic => quic::bind(address, tuning).await,
            TransportConnector::Overlay => overlay::bind(address, tuning).await,
        };
        bound.map_err(|e| match e {
            RsmError::BindFailed(_) | RsmError::InvalidAddress { .. } => e,
            other => RsmError::bind_failed(format!("{} {}: {}", self.kind(), address, other)),
        })
    }

    pub async fn accept(&self, listener: &dyn Listener) -> Result<Box<dyn ByteStream>> {
        listener.accept().await
    }
}

/// One-shot close flag that async waiters can select on
#[derive(Debug)]
pub(crate) struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Returns `true` for the call that actually closed it
    pub(crate) fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Longest a WebSocket upgrade or QUIC handshake may take on the server side
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one handshake task spawned by a listener
pub(crate) type Handshake = std::result::Result<Result<Box<dyn ByteStream>>, JoinError>;

/// Unwrap a finished handshake task; failures are logged and yield `None`
/// so the listener goes on accepting.
pub(crate) fn finish_handshake(kind: TransportType, done: Handshake) -> Option<Box<dyn ByteStream>> {
    match done {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(e)) => {
            tracing::warn!(kind = %kind, error = %e, "Handshake failed");
            None
        }
        Err(e) => {
            if e.is_panic() {
                tracing::error!(kind = %kind, error = %e, "Handshake task panicked");
            }
            None
        }
    }
}

/// Peer-gone conditions become `ConnectionClosed`; everything else stays I/O
pub(crate) fn map_io(e: io::Error) -> RsmError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => RsmError::ConnectionClosed,
        _ => RsmError::Io(e),
    }
}

/// Resolve `host:port` to the first socket address
pub(crate) async fn resolve(address: &str) -> Result<std::net::SocketAddr> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| RsmError::connection_failed(format!("no address found for {}", address)))
}
