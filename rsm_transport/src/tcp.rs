use async_trait::async_trait;
use rsm_core::config::TuningOptions;
use rsm_core::{Result, RsmError};
use std::net::SocketAddr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::connector::{ByteStream, CloseSignal, Listener};
use crate::framed::FramedStream;

pub type TcpConnection = FramedStream<OwnedReadHalf, OwnedWriteHalf>;

fn wrap(stream: TcpStream, peer_addr: SocketAddr, tuning: &TuningOptions) -> Result<TcpConnection> {
    // Enable TCP_NODELAY to reduce latency
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    Ok(FramedStream::new(reader, writer, peer_addr.to_string(), tuning))
}

/// Connect to a `host:port` peer
pub async fn connect(address: &str, tuning: &TuningOptions) -> Result<Box<dyn ByteStream>> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| RsmError::connection_failed(format!("tcp {}: {}", address, e)))?;
    let local_addr = stream.local_addr()?;
    let peer_addr = stream.peer_addr()?;

    tracing::info!(
        local = %local_addr,
        peer = %peer_addr,
        "TCP connection established"
    );

    Ok(Box::new(wrap(stream, peer_addr, tuning)?))
}

pub async fn bind(address: &str, tuning: &TuningOptions) -> Result<Box<dyn Listener>> {
    Ok(Box::new(TcpServer::bind(address, tuning).await?))
}

/// TCP listener handing out framed connections
pub struct TcpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    tuning: TuningOptions,
    closed: CloseSignal,
}

impl TcpServer {
    pub async fn bind(address: &str, tuning: &TuningOptions) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| RsmError::bind_failed(format!("tcp {}: {}", address, e)))?;
        let local_addr = listener.local_addr()?;

        tracing::info!(addr = %local_addr, "TCP server listening");

        Ok(Self {
            listener,
            local_addr,
            tuning: *tuning,
            closed: CloseSignal::new(),
        })
    }
}

#[async_trait]
impl Listener for TcpServer {
    async fn accept(&self) -> Result<Box<dyn ByteStream>> {
        if self.closed.is_closed() {
            return Err(RsmError::ListenerClosed);
        }

        let (stream, peer_addr) = tokio::select! {
            res = self.listener.accept() => res?,
            _ = self.closed.closed() => return Err(RsmError::ListenerClosed),
        };

        tracing::info!(
            peer = %peer_addr,
            local = %self.local_addr,
            "TCP connection accepted"
        );

        Ok(Box::new(wrap(stream, peer_addr, &self.tuning)?))
    }

    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }

    async fn close(&self) {
        if self.closed.close() {
            tracing::debug!(addr = %self.local_addr, "TCP server closed");
        }
    }
}
