//! WebSocket transport: one frame per binary message.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rsm_core::config::{websocket_authority, TuningOptions};
use rsm_core::{Result, RsmError, TransportType};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::connector::{finish_handshake, map_io, ByteStream, CloseSignal, Listener, HANDSHAKE_TIMEOUT};
use crate::quic_cert::ensure_crypto_provider;

fn map_ws(e: tungstenite::Error) -> RsmError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            RsmError::ConnectionClosed
        }
        tungstenite::Error::Io(e) => map_io(e),
        tungstenite::Error::Capacity(e) => RsmError::ResourceExhausted(e.to_string()),
        tungstenite::Error::Protocol(e) => RsmError::malformed(e.to_string()),
        other => RsmError::connection_failed(other),
    }
}

pub struct WebSocketConnection<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    peer: String,
    max_frame_size: usize,
    closed: CloseSignal,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(ws: WebSocketStream<S>, peer: String, tuning: &TuningOptions) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            peer,
            max_frame_size: tuning.max_frame_size,
            closed: CloseSignal::new(),
        }
    }

    async fn next_frame(&self) -> Result<Bytes> {
        let mut stream = self.stream.lock().await;
        loop {
            let message = match stream.next().await {
                Some(message) => message.map_err(map_ws)?,
                None => return Err(RsmError::ConnectionClosed),
            };
            let frame = match message {
                Message::Binary(data) => Bytes::from(data),
                Message::Text(text) => Bytes::from(text.into_bytes()),
                Message::Close(_) => return Err(RsmError::ConnectionClosed),
                // Control frames are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            if frame.len() > self.max_frame_size {
                return Err(RsmError::ResourceExhausted(format!(
                    "inbound message of {} bytes exceeds limit {}",
                    frame.len(),
                    self.max_frame_size
                )));
            }
            return Ok(frame);
        }
    }
}

#[async_trait]
impl<S> ByteStream for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.is_closed() {
            return Err(RsmError::ConnectionClosed);
        }
        if frame.len() > self.max_frame_size {
            return Err(RsmError::ResourceExhausted(format!(
                "frame of {} bytes exceeds limit {}",
                frame.len(),
                self.max_frame_size
            )));
        }

        let len = frame.len();
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Binary(frame.to_vec())).await.map_err(map_ws)
        };
        tokio::select! {
            res = write => res?,
            _ = self.closed.closed() => return Err(RsmError::ConnectionClosed),
        }

        tracing::trace!(bytes = len, peer = %self.peer, "WebSocket message sent");
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes> {
        if self.closed.is_closed() {
            return Err(RsmError::ConnectionClosed);
        }

        let frame = tokio::select! {
            res = self.next_frame() => res?,
            _ = self.closed.closed() => return Err(RsmError::ConnectionClosed),
        };

        tracing::trace!(bytes = frame.len(), peer = %self.peer, "WebSocket message received");
        Ok(frame)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.close() {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::debug!(peer = %self.peer, error = %e, "WebSocket close handshake failed");
        }
        tracing::debug!(peer = %self.peer, "WebSocket connection closed");
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Connect to a `ws://` or `wss://` URL
pub async fn connect(address: &str, tuning: &TuningOptions) -> Result<Box<dyn ByteStream>> {
    if address.starts_with("wss://") {
        ensure_crypto_provider();
    }
    let (ws, _response) = tokio_tungstenite::connect_async(address)
        .await
        .map_err(|e| RsmError::connection_failed(format!("websocket {}: {}", address, e)))?;

    tracing::info!(peer = %address, "WebSocket connection established");

    Ok(Box::new(WebSocketConnection::new(ws, address.to_string(), tuning)))
}

pub async fn bind(address: &str, tuning: &TuningOptions) -> Result<Box<dyn Listener>> {
    Ok(Box::new(WebSocketServer::bind(address, tuning).await?))
}

/// Upgrade an accepted socket within [`HANDSHAKE_TIMEOUT`]
async fn upgrade(stream: TcpStream, peer_addr: SocketAddr, tuning: TuningOptions) -> Result<Box<dyn ByteStream>> {
    let ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream))
        .await
        .map_err(|_| RsmError::Timeout)?
        .map_err(|e| RsmError::connection_failed(format!("websocket handshake from {}: {}", peer_addr, e)))?;

    tracing::info!(peer = %peer_addr, "WebSocket connection accepted");

    Ok(Box::new(WebSocketConnection::new(ws, peer_addr.to_string(), &tuning)))
}

/// Plain-TCP WebSocket listener; the URL path is advertised but not enforced.
///
/// Upgrades run as background tasks, so a peer that never completes its
/// handshake does not hold up the ones behind it.
pub struct WebSocketServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    path: String,
    tuning: TuningOptions,
    handshakes: Mutex<JoinSet<Result<Box<dyn ByteStream>>>>,
    closed: CloseSignal,
}

impl WebSocketServer {
    pub async fn bind(address: &str, tuning: &TuningOptions) -> Result<Self> {
        let authority = websocket_authority(address)
            .ok_or_else(|| RsmError::invalid_address(address, TransportType::WebSocket))?;
        let path = address
            .split_once("://")
            .and_then(|(_, rest)| rest.find('/').map(|i| rest[i..].to_string()))
            .unwrap_or_default();

        let listener = TcpListener::bind(authority)
            .await
            .map_err(|e| RsmError::bind_failed(format!("websocket {}: {}", address, e)))?;
        let local_addr = listener.local_addr()?;

        tracing::info!(addr = %local_addr, path = %path, "WebSocket server listening");

        Ok(Self {
            listener,
            local_addr,
            path,
            tuning: *tuning,
            handshakes: Mutex::new(JoinSet::new()),
            closed: CloseSignal::new(),
        })
    }
}

#[async_trait]
impl Listener for WebSocketServer {
    async fn accept(&self) -> Result<Box<dyn ByteStream>> {
        if self.closed.is_closed() {
            return Err(RsmError::ListenerClosed);
        }

        let mut handshakes = self.handshakes.lock().await;
        loop {
            tokio::select! {
                res = self.listener.accept() => {
                    let (stream, peer_addr) = res?;
                    stream.set_nodelay(true)?;
                    tracing::debug!(peer = %peer_addr, local = %self.local_addr, "WebSocket upgrade pending");
                    handshakes.spawn(upgrade(stream, peer_addr, self.tuning));
                }
                Some(done) = handshakes.join_next() => {
                    if let Some(conn) = finish_handshake(TransportType::WebSocket, done) {
                        return Ok(conn);
                    }
                }
                _ = self.closed.closed() => return Err(RsmError::ListenerClosed),
            }
        }
    }

    fn local_addr(&self) -> String {
        format!("ws://{}{}", self.local_addr, self.path)
    }

    async fn close(&self) {
        if self.closed.close() {
            self.handshakes.lock().await.abort_all();
            tracing::debug!(addr = %self.local_addr, "WebSocket server closed");
        }
    }
}
