//! QUIC transport: one bidirectional stream per connection carrying
//! length-prefixed frames.

use async_trait::async_trait;
use bytes::Bytes;
use quinn::{ClientConfig, Connection, ConnectionError, Endpoint, RecvStream, SendStream, ServerConfig};
use rsm_core::config::TuningOptions;
use rsm_core::{Result, RsmError, TransportType};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinSet;

use crate::connector::{finish_handshake, resolve, ByteStream, CloseSignal, Listener, HANDSHAKE_TIMEOUT};
use crate::framed::FramedStream;
use crate::quic_cert;

type QuicFramed = FramedStream<RecvStream, SendStream>;

fn map_connection_error(e: ConnectionError) -> RsmError {
    match e {
        ConnectionError::TimedOut => RsmError::Timeout,
        other => {
            tracing::debug!(error = %other, "QUIC connection ended");
            RsmError::ConnectionClosed
        }
    }
}

/// QUIC connection wrapper.
///
/// The dialing side opens the stream eagerly. The accepting side picks it up
/// on first use, since a peer's stream only becomes visible once it carries
/// data.
pub struct QuicConnection {
    connection: Connection,
    // Client endpoints live as long as their single connection
    _endpoint: Option<Endpoint>,
    stream: OnceCell<QuicFramed>,
    peer: String,
    tuning: TuningOptions,
    closed: CloseSignal,
}

impl QuicConnection {
    async fn stream(&self) -> Result<&QuicFramed> {
        self.stream
            .get_or_try_init(|| async {
                let (send, recv) = self
                    .connection
                    .accept_bi()
                    .await
                    .map_err(map_connection_error)?;
                Ok::<_, RsmError>(FramedStream::new(recv, send, self.peer.clone(), &self.tuning))
            })
            .await
    }

    async fn ready_stream(&self) -> Result<&QuicFramed> {
        if self.closed.is_closed() {
            return Err(RsmError::ConnectionClosed);
        }
        tokio::select! {
            res = self.stream() => res,
            _ = self.closed.closed() => Err(RsmError::ConnectionClosed),
        }
    }
}

#[async_trait]
impl ByteStream for QuicConnection {
    async fn send(&self, frame: Bytes) -> Result<()> {
        self.ready_stream().await?.send(frame).await
    }

    async fn receive(&self) -> Result<Bytes> {
        self.ready_stream().await?.receive().await
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.close() {
            return Ok(());
        }
        if let Some(stream) = self.stream.get() {
            stream.close().await?;
        }
        self.connection.close(0u32.into(), b"closing");
        tracing::debug!(peer = %self.peer, "QUIC connection closed");
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Connect to QUIC server
pub async fn connect(address: &str, tuning: &TuningOptions) -> Result<Box<dyn ByteStream>> {
    let addr = resolve(address).await?;
    let bind_addr: SocketAddr = if addr.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };

    let mut endpoint = Endpoint::client(bind_addr)?;
    let quic_config = quinn::crypto::rustls::QuicClientConfig::try_from(quic_cert::client_config())
        .map_err(RsmError::connection_failed)?;
    endpoint.set_default_client_config(ClientConfig::new(Arc::new(quic_config)));

    let connection = endpoint
        .connect(addr, quic_cert::SERVER_NAME)
        .map_err(RsmError::connection_failed)?
        .await
        .map_err(RsmError::connection_failed)?;
    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(RsmError::connection_failed)?;
    let local_addr = endpoint.local_addr()?;

    tracing::info!(
        local = %local_addr,
        peer = %addr,
        "QUIC connection established"
    );

    let peer = addr.to_string();
    let stream = FramedStream::new(recv, send, peer.clone(), tuning);
    Ok(Box::new(QuicConnection {
        connection,
        _endpoint: Some(endpoint),
        stream: OnceCell::new_with(Some(stream)),
        peer,
        tuning: *tuning,
        closed: CloseSignal::new(),
    }))
}

pub async fn bind(address: &str, tuning: &TuningOptions) -> Result<Box<dyn Listener>> {
    Ok(Box::new(QuicServer::bind(address, tuning).await?))
}

/// Finish the handshake of an incoming connection within [`HANDSHAKE_TIMEOUT`]
async fn establish(incoming: quinn::Incoming, tuning: TuningOptions) -> Result<Box<dyn ByteStream>> {
    let remote = incoming.remote_address();
    let connecting = incoming
        .accept()
        .map_err(|e| RsmError::connection_failed(format!("quic handshake from {}: {}", remote, e)))?;
    let connection = tokio::time::timeout(HANDSHAKE_TIMEOUT, connecting)
        .await
        .map_err(|_| RsmError::Timeout)?
        .map_err(|e| RsmError::connection_failed(format!("quic handshake from {}: {}", remote, e)))?;
    let peer_addr = connection.remote_address();

    tracing::info!(peer = %peer_addr, "QUIC connection accepted");

    Ok(Box::new(QuicConnection {
        connection,
        _endpoint: None,
        stream: OnceCell::new(),
        peer: peer_addr.to_string(),
        tuning,
        closed: CloseSignal::new(),
    }))
}

/// QUIC server; handshakes complete in background tasks
pub struct QuicServer {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    tuning: TuningOptions,
    handshakes: Mutex<JoinSet<Result<Box<dyn ByteStream>>>>,
    closed: CloseSignal,
}

impl QuicServer {
    pub async fn bind(address: &str, tuning: &TuningOptions) -> Result<Self> {
        let addr = resolve(address).await?;
        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(quic_cert::server_config()?)
            .map_err(RsmError::bind_failed)?;
        let config = ServerConfig::with_crypto(Arc::new(crypto));

        let endpoint = Endpoint::server(config, addr)
            .map_err(|e| RsmError::bind_failed(format!("quic {}: {}", address, e)))?;
        let local_addr = endpoint.local_addr()?;

        tracing::info!(addr = %local_addr, "QUIC server listening");

        Ok(Self {
            endpoint,
            local_addr,
            tuning: *tuning,
            handshakes: Mutex::new(JoinSet::new()),
            closed: CloseSignal::new(),
        })
    }
}

#[async_trait]
impl Listener for QuicServer {
    async fn accept(&self) -> Result<Box<dyn ByteStream>> {
        if self.closed.is_closed() {
            return Err(RsmError::ListenerClosed);
        }

        let mut handshakes = self.handshakes.lock().await;
        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => {
                    let incoming = incoming.ok_or(RsmError::ListenerClosed)?;
                    tracing::debug!(peer = %incoming.remote_address(), "QUIC handshake pending");
                    handshakes.spawn(establish(incoming, self.tuning));
                }
                Some(done) = handshakes.join_next() => {
                    if let Some(conn) = finish_handshake(TransportType::Quic, done) {
                        return Ok(conn);
                    }
                }
                _ = self.closed.closed() => return Err(RsmError::ListenerClosed),
            }
        }
    }

    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }

    async fn close(&self) {
        if self.closed.close() {
            // Refuse new handshakes; established connections stay with their sessions
            self.endpoint.set_server_config(None);
            self.handshakes.lock().await.abort_all();
            tracing::debug!(addr = %self.local_addr, "QUIC server closed");
        }
    }
}
