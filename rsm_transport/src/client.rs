use parking_lot::Mutex;
use rsm_core::codec::FrameCodec;
use rsm_core::config::TuningOptions;
use rsm_core::{Payload, PerformanceMetrics, Result, RsmError, TransportConfig, TransportType};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::connector::{ByteStream, CloseSignal, TransportConnector};
use crate::session::{AtomicConnectionState, ConnectionState};

/// Client side of a request/response connection.
///
/// ```text
/// Disconnected --connect()--> Connecting --ok--> Connected --close()--> Closed
///                             Connecting --err--> Disconnected
/// ```
///
/// All methods take `&self`; share the client behind an `Arc` to use it from
/// several tasks.
pub struct RSocketClient {
    config: Arc<TransportConfig>,
    connector: TransportConnector,
    tuning: TuningOptions,
    codec: FrameCodec,
    metrics: Arc<PerformanceMetrics>,
    state: AtomicConnectionState,
    stream: Mutex<Option<Arc<dyn ByteStream>>>,
    /// Send timestamps of requests still waiting for an inbound message
    pending: Mutex<VecDeque<Instant>>,
    request_lock: tokio::sync::Mutex<()>,
    shutdown: CloseSignal,
}

impl RSocketClient {
    /// Create a disconnected client with its own metrics
    pub fn new(config: TransportConfig) -> Result<Self> {
        Self::with_metrics(config, PerformanceMetrics::shared())
    }

    /// Create a disconnected client recording into `metrics`
    pub fn with_metrics(config: TransportConfig, metrics: Arc<PerformanceMetrics>) -> Result<Self> {
        config.validate()?;
        let tuning = config.tuning();
        Ok(Self {
            connector: TransportConnector::for_kind(config.transport_type()),
            codec: FrameCodec::new(tuning.vectorized),
            tuning,
            config: Arc::new(config),
            metrics,
            state: AtomicConnectionState::new(ConnectionState::Disconnected),
            stream: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            request_lock: tokio::sync::Mutex::new(()),
            shutdown: CloseSignal::new(),
        })
    }

    /// Open the transport.
    ///
    /// A no-op while connected. A concurrent attempt fails with
    /// `AlreadyConnecting`; a closed client fails with `NotConnected`.
    pub async fn connect(&self) -> Result<()> {
        if let Err(current) = self
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return match current {
                ConnectionState::Connected => Ok(()),
                ConnectionState::Connecting => Err(RsmError::AlreadyConnecting),
                ConnectionState::Closed | ConnectionState::Disconnected => Err(RsmError::NotConnected),
            };
        }

        tracing::debug!(config = %self.config, "Client connecting");

        let opened = tokio::select! {
            res = self.connector.open_client(self.config.address(), &self.tuning) => res,
            _ = self.shutdown.closed() => Err(RsmError::NotConnected),
        };

        let stream: Arc<dyn ByteStream> = match opened {
            Ok(stream) => Arc::from(stream),
            Err(e) => {
                if !matches!(e, RsmError::NotConnected) {
                    self.metrics.record_error();
                }
                let _ = self
                    .state
                    .transition(ConnectionState::Connecting, ConnectionState::Disconnected);
                tracing::warn!(config = %self.config, error = %e, "Client connect failed");
                return Err(e);
            }
        };

        *self.stream.lock() = Some(stream.clone());
        if self
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Connected)
            .is_err()
        {
            // close() ran while the transport was opening
            self.stream.lock().take();
            let _ = stream.close().await;
            return Err(RsmError::NotConnected);
        }

        tracing::info!(peer = %stream.peer(), kind = %self.config.transport_type(), "Client connected");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn transport_type(&self) -> TransportType {
        self.config.transport_type()
    }

    pub fn metrics(&self) -> Arc<PerformanceMetrics> {
        self.metrics.clone()
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    fn connected_stream(&self) -> Result<Arc<dyn ByteStream>> {
        if !self.is_connected() {
            return Err(RsmError::NotConnected);
        }
        self.stream.lock().clone().ok_or(RsmError::NotConnected)
    }

    /// Send one payload without waiting for a reply
    pub async fn send(&self, payload: Payload) -> Result<()> {
        let stream = self.connected_stream()?;
        let frame = self.codec.encode(&payload).map_err(|e| {
            self.metrics.record_error();
            e
        })?;
        let len = frame.len();

        // Registered before the write so a concurrent receive can pair with it
        let sent_at = Instant::now();
        self.pending.lock().push_back(sent_at);
        if let Err(e) = stream.send(frame).await {
            self.forget_pending(sent_at, 1);
            self.on_failure(&e).await;
            return Err(e);
        }

        self.metrics.record_request();
        self.metrics.record_bytes_sent(len);
        tracing::trace!(bytes = len, "Request sent");
        Ok(())
    }

    /// Send several payloads back to back.
    ///
    /// Frames come from [`FrameCodec::encode_batch`], so the vectorized hint
    /// decides whether they share one buffer. Each payload counts as one
    /// request. On a transport error the payloads not yet written are
    /// dropped and the error is returned.
    pub async fn send_batch(&self, payloads: &[Payload]) -> Result<()> {
        let stream = self.connected_stream()?;
        let frames = self.codec.encode_batch(payloads).map_err(|e| {
            self.metrics.record_error();
            e
        })?;

        let sent_at = Instant::now();
        self.pending
            .lock()
            .extend(std::iter::repeat(sent_at).take(frames.len()));

        let mut unsent = frames.len();
        let mut total = 0;
        for frame in frames {
            let len = frame.len();
            if let Err(e) = stream.send(frame).await {
                self.forget_pending(sent_at, unsent);
                self.on_failure(&e).await;
                return Err(e);
            }
            unsent -= 1;
            total += len;
            self.metrics.record_request();
            self.metrics.record_bytes_sent(len);
        }

        tracing::trace!(
            frames = payloads.len(),
            bytes = total,
            vectorized = self.codec.is_vectorized(),
            "Batch sent"
        );
        Ok(())
    }

    /// Drop up to `count` outstanding timestamps equal to `sent_at`, newest first
    fn forget_pending(&self, sent_at: Instant, count: usize) {
        let mut pending = self.pending.lock();
        for _ in 0..count {
            match pending.iter().rposition(|t| *t == sent_at) {
                Some(index) => {
                    pending.remove(index);
                }
                None => break,
            }
        }
    }

    pub async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        self.send(payload).await
    }

    /// Wait for the next inbound payload.
    ///
    /// The message is paired with the oldest unanswered send for latency;
    /// with none outstanding it is counted as a response without latency.
    pub async fn receive(&self) -> Result<Payload> {
        let stream = self.connected_stream()?;
        let frame = match stream.receive().await {
            Ok(frame) => frame,
            Err(e) => {
                self.on_failure(&e).await;
                return Err(e);
            }
        };
        let len = frame.len();
        let sent_at = self.pending.lock().pop_front();
        self.metrics.record_bytes_received(len);

        let payload = self.codec.decode(frame).map_err(|e| {
            self.metrics.record_error();
            e
        })?;

        match sent_at {
            Some(sent_at) => self
                .metrics
                .record_response(sent_at.elapsed().as_secs_f64() * 1000.0),
            None => self.metrics.record_unmatched_response(),
        }
        tracing::trace!(bytes = len, "Response received");
        Ok(payload)
    }

    /// Send and wait for the reply; concurrent callers are served in order
    pub async fn request_response(&self, payload: Payload) -> Result<Payload> {
        let _guard = self.request_lock.lock().await;
        self.send(payload).await?;
        self.receive().await
    }

    /// Release the transport and move to `Closed`; cancels an in-flight
    /// connect. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let previous = self.state.swap(ConnectionState::Closed);
        self.shutdown.close();
        self.pending.lock().clear();

        let stream = self.stream.lock().take();
        if let Some(stream) = stream {
            if let Err(e) = stream.close().await {
                tracing::debug!(error = %e, "Error while closing client stream");
            }
        }

        if previous != ConnectionState::Closed {
            tracing::info!(config = %self.config, "Client closed");
        }
        Ok(())
    }

    async fn on_failure(&self, e: &RsmError) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.metrics.record_error();

        let next = if e.is_fatal() {
            ConnectionState::Closed
        } else if e.is_transient() {
            ConnectionState::Disconnected
        } else {
            return;
        };
        if self.state.transition(ConnectionState::Connected, next).is_err() {
            return;
        }

        tracing::warn!(error = %e, state = %next, "Client connection dropped");
        self.pending.lock().clear();
        let stream = self.stream.lock().take();
        if let Some(stream) = stream {
            let _ = stream.close().await;
        }
    }
}

impl fmt::Debug for RSocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RSocketClient")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::OverlayListener;
    use crate::connector::Listener;

    #[test]
    fn test_new_client_is_disconnected() {
        let client = RSocketClient::new(TransportConfig::tcp("127.0.0.1:1").unwrap()).unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.metrics().request_count(), 0);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let client = RSocketClient::new(TransportConfig::tcp("127.0.0.1:1").unwrap()).unwrap();
        let err = client.send(Payload::from_text("x", None)).await.unwrap_err();
        assert!(matches!(err, RsmError::NotConnected));
        assert!(matches!(client.receive().await, Err(RsmError::NotConnected)));
    }

    #[tokio::test]
    async fn test_failed_connect_is_retryable() {
        let client = RSocketClient::new(TransportConfig::overlay("iroh://client-nobody").unwrap()).unwrap();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, RsmError::ConnectionFailed(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.metrics().error_count(), 1);

        // once the peer exists the same client connects
        let _listener = OverlayListener::bind("iroh://client-nobody", &TuningOptions::default()).unwrap();
        client.connect().await.unwrap();
        assert!(client.is_connected());
        // idempotent while connected
        client.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_latency_pairs_with_sends() {
        let listener = OverlayListener::bind("iroh://client-latency", &TuningOptions::default()).unwrap();
        let client = RSocketClient::new(TransportConfig::overlay("iroh://client-latency").unwrap()).unwrap();
        client.connect().await.unwrap();
        let peer = listener.accept().await.unwrap();

        client.send(Payload::from_text("one", None)).await.unwrap();
        let frame = peer.receive().await.unwrap();
        peer.send(frame.clone()).await.unwrap();
        // an extra message nobody asked for
        peer.send(frame).await.unwrap();

        assert_eq!(client.receive().await.unwrap().data_utf8().unwrap(), Some("one"));
        assert_eq!(client.receive().await.unwrap().data_utf8().unwrap(), Some("one"));

        let metrics = client.metrics();
        assert_eq!(metrics.request_count(), 1);
        assert_eq!(metrics.response_count(), 2);
        assert_eq!(metrics.latencies().len(), 1);
        assert!(metrics.bytes_sent() > 0);
        assert_eq!(metrics.bytes_sent() * 2, metrics.bytes_received());
    }

    #[tokio::test]
    async fn test_malformed_inbound_keeps_connection() {
        let listener = OverlayListener::bind("iroh://client-malformed", &TuningOptions::default()).unwrap();
        let client = RSocketClient::new(TransportConfig::overlay("iroh://client-malformed").unwrap()).unwrap();
        client.connect().await.unwrap();
        let peer = listener.accept().await.unwrap();

        // reserved flag bits set
        peer.send(bytes::Bytes::from_static(&[0x3F])).await.unwrap();
        let err = client.receive().await.unwrap_err();
        assert!(matches!(err, RsmError::MalformedFrame(_)));
        assert!(client.is_connected());
        assert_eq!(client.metrics().error_count(), 1);
    }

    #[tokio::test]
    async fn test_peer_close_is_fatal() {
        let listener = OverlayListener::bind("iroh://client-peer-close", &TuningOptions::default()).unwrap();
        let client = RSocketClient::new(TransportConfig::overlay("iroh://client-peer-close").unwrap()).unwrap();
        client.connect().await.unwrap();
        let peer = listener.accept().await.unwrap();

        peer.close().await.unwrap();
        let err = client.receive().await.unwrap_err();
        assert!(matches!(err, RsmError::ConnectionClosed));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.send(Payload::from_text("late", None)).await,
            Err(RsmError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_send_batch_on_both_codec_paths() {
        for (name, vectorized) in [("client-batch-plain", false), ("client-batch-vectorized", true)] {
            let address = format!("iroh://{}", name);
            let listener = OverlayListener::bind(&address, &TuningOptions::default()).unwrap();
            let mut config = TransportConfig::overlay(address.as_str()).unwrap();
            if vectorized {
                config.enable_vectorized_processing();
            }
            let client = RSocketClient::new(config).unwrap();
            assert_eq!(client.codec().is_vectorized(), vectorized);
            client.connect().await.unwrap();
            let peer = listener.accept().await.unwrap();

            let payloads: Vec<Payload> = (0..4)
                .map(|i| Payload::from_text(&format!("item-{}", i), Some("batch")))
                .collect();
            client.send_batch(&payloads).await.unwrap();

            let codec = FrameCodec::default();
            for expected in &payloads {
                let frame = peer.receive().await.unwrap();
                assert_eq!(&codec.decode(frame.clone()).unwrap(), expected);
                peer.send(frame).await.unwrap();
            }
            for expected in &payloads {
                assert_eq!(&client.receive().await.unwrap(), expected);
            }

            let metrics = client.metrics();
            assert_eq!(metrics.request_count(), 4);
            assert_eq!(metrics.response_count(), 4);
            assert_eq!(metrics.latencies().len(), 4);
            assert_eq!(metrics.bytes_sent(), metrics.bytes_received());
        }
    }

    #[tokio::test]
    async fn test_receive_started_before_send_records_latency() {
        let listener = OverlayListener::bind("iroh://client-early-receive", &TuningOptions::default()).unwrap();
        let client = Arc::new(
            RSocketClient::new(TransportConfig::overlay("iroh://client-early-receive").unwrap()).unwrap(),
        );
        client.connect().await.unwrap();
        let peer = listener.accept().await.unwrap();

        let echo = tokio::spawn(async move {
            let frame = peer.receive().await.unwrap();
            peer.send(frame).await.unwrap();
            peer
        });
        let waiting = {
            let client = client.clone();
            tokio::spawn(async move { client.receive().await })
        };
        tokio::task::yield_now().await;

        client.send(Payload::from_text("early", None)).await.unwrap();
        let reply = waiting.await.unwrap().unwrap();
        assert_eq!(reply.data_utf8().unwrap(), Some("early"));
        let _peer = echo.await.unwrap();

        let metrics = client.metrics();
        assert_eq!(metrics.response_count(), 1);
        assert_eq!(metrics.latencies().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_leaves_no_outstanding_request() {
        let listener = OverlayListener::bind("iroh://client-failed-send", &TuningOptions::default()).unwrap();
        let client = RSocketClient::new(TransportConfig::overlay("iroh://client-failed-send").unwrap()).unwrap();
        client.connect().await.unwrap();
        let _peer = listener.accept().await.unwrap();

        let oversized = Payload::new(
            Some(bytes::Bytes::from(vec![0u8; client.tuning.max_frame_size])),
            None,
        );
        let err = client.send(oversized).await.unwrap_err();
        assert!(matches!(err, RsmError::ResourceExhausted(_)));
        assert!(client.is_connected());
        assert!(client.pending.lock().is_empty());
        assert_eq!(client.metrics().request_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let _listener = OverlayListener::bind("iroh://client-close", &TuningOptions::default()).unwrap();
        let client = RSocketClient::new(TransportConfig::overlay("iroh://client-close").unwrap()).unwrap();
        client.connect().await.unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(client.connect().await, Err(RsmError::NotConnected)));
    }
}
