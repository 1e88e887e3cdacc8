use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use rsm_core::codec::FrameCodec;
use rsm_core::config::TuningOptions;
use rsm_core::{PerformanceMetrics, Result, RsmError, TransportConfig, TransportType};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::connector::{ByteStream, CloseSignal, Listener, TransportConnector};
use crate::handler::{EchoHandler, RequestHandler};
use crate::session::{ConnectionState, SessionContext, SessionInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ServerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerState::Starting,
            2 => ServerState::Running,
            _ => ServerState::Stopped,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
        };
        f.write_str(name)
    }
}

/// First pause after a failed accept; doubles per consecutive failure
const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// How long `stop` lets closed sessions finish before aborting them
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

struct LiveSession {
    context: Arc<SessionContext>,
    stream: Arc<dyn ByteStream>,
}

type SessionRegistry = DashMap<u64, LiveSession>;

/// Everything the accept loop and its sessions need, fixed at `start`
struct SessionShared {
    config: Arc<TransportConfig>,
    codec: FrameCodec,
    metrics: Arc<PerformanceMetrics>,
    handler: Arc<dyn RequestHandler>,
    per_session_metrics: bool,
    sessions: Arc<SessionRegistry>,
    next_session_id: Arc<AtomicU64>,
}

struct Running {
    listener: Arc<dyn Listener>,
    shutdown: Arc<CloseSignal>,
    accept_task: JoinHandle<()>,
}

/// Accepts connections and serves each one as an independent session.
///
/// ```text
/// Stopped --start()--> Starting --bound--> Running --stop()--> Stopped
/// ```
///
/// Sessions record into the server's metrics unless per-session metrics are
/// enabled, in which case each session gets a fresh instance reachable via
/// [`SessionContext::metrics`].
pub struct RSocketServer {
    config: Arc<TransportConfig>,
    connector: TransportConnector,
    tuning: TuningOptions,
    metrics: Arc<PerformanceMetrics>,
    handler: Arc<dyn RequestHandler>,
    per_session_metrics: bool,
    sessions: Arc<SessionRegistry>,
    next_session_id: Arc<AtomicU64>,
    state: AtomicU8,
    running: Mutex<Option<Running>>,
    local_address: SyncMutex<Option<String>>,
}

impl RSocketServer {
    /// Create a stopped server that echoes every request
    pub fn new(config: TransportConfig) -> Result<Self> {
        Self::with_handler(config, Arc::new(EchoHandler))
    }

    pub fn with_handler(config: TransportConfig, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            connector: TransportConnector::for_kind(config.transport_type()),
            tuning: config.tuning(),
            config: Arc::new(config),
            metrics: PerformanceMetrics::shared(),
            handler,
            per_session_metrics: false,
            sessions: Arc::new(DashMap::new()),
            next_session_id: Arc::new(AtomicU64::new(1)),
            state: AtomicU8::new(ServerState::Stopped as u8),
            running: Mutex::new(None),
            local_address: SyncMutex::new(None),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<PerformanceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_per_session_metrics(mut self, enabled: bool) -> Self {
        self.per_session_metrics = enabled;
        self
    }

    /// Override how many sessions are serviced at once
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.tuning.max_sessions = max_sessions.max(1);
        self
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn transport_type(&self) -> TransportType {
        self.config.transport_type()
    }

    pub fn tuning(&self) -> &TuningOptions {
        &self.tuning
    }

    pub fn metrics(&self) -> Arc<PerformanceMetrics> {
        self.metrics.clone()
    }

    /// Dialable address of the bound listener while running.
    ///
    /// Differs from the configured address when binding port `0`.
    pub fn local_address(&self) -> Option<String> {
        self.local_address.lock().clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().context.info())
            .collect();
        sessions.sort_by_key(|info| info.id);
        sessions
    }

    /// Context of a live session, including its metrics
    pub fn session(&self, id: u64) -> Option<Arc<SessionContext>> {
        self.sessions.get(&id).map(|entry| entry.value().context.clone())
    }

    /// Bind and begin accepting; a no-op returning the current state while
    /// starting or running
    pub async fn start(&self) -> Result<ServerState> {
        if let Err(current) = self.state.compare_exchange(
            ServerState::Stopped as u8,
            ServerState::Starting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Ok(ServerState::from_u8(current));
        }

        let mut running = self.running.lock().await;
        tracing::debug!(config = %self.config, "Server starting");

        let listener: Arc<dyn Listener> =
            match self.connector.open_server(self.config.address(), &self.tuning).await {
                Ok(listener) => Arc::from(listener),
                Err(e) => {
                    self.metrics.record_error();
                    self.state.store(ServerState::Stopped as u8, Ordering::Release);
                    tracing::error!(config = %self.config, error = %e, "Server failed to bind");
                    return Err(e);
                }
            };

        let shared = Arc::new(SessionShared {
            config: self.config.clone(),
            codec: FrameCodec::new(self.tuning.vectorized),
            metrics: self.metrics.clone(),
            handler: self.handler.clone(),
            per_session_metrics: self.per_session_metrics,
            sessions: self.sessions.clone(),
            next_session_id: self.next_session_id.clone(),
        });
        let shutdown = Arc::new(CloseSignal::new());
        let accept_task = tokio::spawn(accept_loop(
            listener.clone(),
            shutdown.clone(),
            shared,
            self.tuning.max_sessions,
        ));

        let local = listener.local_addr();
        *self.local_address.lock() = Some(local.clone());
        *running = Some(Running {
            listener,
            shutdown,
            accept_task,
        });
        self.state.store(ServerState::Running as u8, Ordering::Release);

        tracing::info!(
            addr = %local,
            kind = %self.config.transport_type(),
            max_sessions = self.tuning.max_sessions,
            "Server running"
        );
        Ok(ServerState::Running)
    }

    /// Close the listener and every live session, then wait for their tasks
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(Running {
            listener,
            shutdown,
            accept_task,
        }) = running.take()
        else {
            return Ok(());
        };

        shutdown.close();
        listener.close().await;
        if let Err(e) = accept_task.await {
            if e.is_panic() {
                tracing::error!(error = %e, "Accept loop panicked");
            }
        }

        self.sessions.clear();
        *self.local_address.lock() = None;
        self.state.store(ServerState::Stopped as u8, Ordering::Release);
        tracing::info!(config = %self.config, "Server stopped");
        Ok(())
    }
}

impl fmt::Debug for RSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RSocketServer")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl Drop for RSocketServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.close();
            // Dropping the loop's JoinSet aborts every session task
            running.accept_task.abort();
        }
    }
}

async fn accept_loop(
    listener: Arc<dyn Listener>,
    shutdown: Arc<CloseSignal>,
    shared: Arc<SessionShared>,
    max_sessions: usize,
) {
    let permits = Arc::new(Semaphore::new(max_sessions));
    let mut tasks = JoinSet::new();
    let mut backoff: Option<Duration> = None;

    loop {
        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.closed() => break,
        };

        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.closed() => break,
        };

        match accepted {
            Ok(stream) => {
                backoff = None;
                let stream: Arc<dyn ByteStream> = Arc::from(stream);
                let context = open_session(&shared, &stream);
                tasks.spawn(run_session(shared.clone(), context, stream, permit));
            }
            Err(RsmError::ListenerClosed) => break,
            Err(e) => {
                shared.metrics.record_error();
                drop(permit);
                let delay = backoff
                    .map(|d| (d * 2).min(ACCEPT_BACKOFF_MAX))
                    .unwrap_or(ACCEPT_BACKOFF_INITIAL);
                backoff = Some(delay);
                tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Accept failed");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.closed() => break,
                }
            }
        }

        while tasks.try_join_next().is_some() {}
    }

    let live: Vec<Arc<dyn ByteStream>> = shared
        .sessions
        .iter()
        .map(|entry| entry.value().stream.clone())
        .collect();
    for stream in live {
        let _ = stream.close().await;
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(remaining = tasks.len(), "Sessions still busy at shutdown, aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
    tracing::debug!("Accept loop finished");
}

fn open_session(shared: &SessionShared, stream: &Arc<dyn ByteStream>) -> Arc<SessionContext> {
    let id = shared.next_session_id.fetch_add(1, Ordering::Relaxed);
    let metrics = if shared.per_session_metrics {
        PerformanceMetrics::shared()
    } else {
        shared.metrics.clone()
    };
    let context = Arc::new(SessionContext::new(
        id,
        stream.peer(),
        metrics,
        shared.config.clone(),
    ));
    shared.sessions.insert(
        id,
        LiveSession {
            context: context.clone(),
            stream: stream.clone(),
        },
    );
    context
}

async fn run_session(
    shared: Arc<SessionShared>,
    context: Arc<SessionContext>,
    stream: Arc<dyn ByteStream>,
    _permit: OwnedSemaphorePermit,
) {
    context.set_state(ConnectionState::Connected);
    let metrics = context.metrics().clone();
    tracing::info!(session_id = context.id(), peer = %context.peer(), "Session opened");

    loop {
        let frame = match stream.receive().await {
            Ok(frame) => frame,
            Err(e) if e.is_codec() => {
                metrics.record_error();
                tracing::warn!(session_id = context.id(), error = %e, "Dropped inbound frame");
                continue;
            }
            Err(RsmError::ConnectionClosed) => break,
            Err(e) => {
                metrics.record_error();
                tracing::warn!(session_id = context.id(), error = %e, "Session transport failed");
                break;
            }
        };

        let started = Instant::now();
        metrics.record_request();
        metrics.record_bytes_received(frame.len());

        let request = match shared.codec.decode(frame) {
            Ok(payload) => payload,
            Err(e) => {
                metrics.record_error();
                tracing::warn!(session_id = context.id(), error = %e, "Malformed request");
                continue;
            }
        };

        let reply = match shared.handler.handle(&context, request).await {
            Ok(Some(reply)) => reply,
            Ok(None) => continue,
            Err(e) => {
                metrics.record_error();
                tracing::warn!(session_id = context.id(), error = %e, "Handler failed");
                continue;
            }
        };

        let frame = match shared.codec.encode(&reply) {
            Ok(frame) => frame,
            Err(e) => {
                metrics.record_error();
                tracing::warn!(session_id = context.id(), error = %e, "Reply could not be encoded");
                continue;
            }
        };
        let len = frame.len();
        match stream.send(frame).await {
            Ok(()) => {
                metrics.record_response(started.elapsed().as_secs_f64() * 1000.0);
                metrics.record_bytes_sent(len);
            }
            Err(e) if e.is_codec() => {
                metrics.record_error();
                tracing::warn!(session_id = context.id(), error = %e, "Reply rejected");
            }
            Err(e) => {
                if !e.is_fatal() {
                    metrics.record_error();
                }
                tracing::debug!(session_id = context.id(), error = %e, "Session send failed");
                break;
            }
        }
    }

    context.set_state(ConnectionState::Closed);
    let _ = stream.close().await;
    shared.sessions.remove(&context.id());
    tracing::info!(session_id = context.id(), peer = %context.peer(), "Session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RSocketClient;
    use crate::handler::FnHandler;
    use rsm_core::Payload;
    use std::time::Duration;

    // Replies reach the client before the server records them
    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_new_server_is_stopped() {
        let server = RSocketServer::new(TransportConfig::tcp("127.0.0.1:0").unwrap()).unwrap();
        assert!(!server.is_running());
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.local_address(), None);
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_releases() {
        let server = RSocketServer::new(TransportConfig::overlay("iroh://server-idempotent").unwrap()).unwrap();

        assert_eq!(server.start().await.unwrap(), ServerState::Running);
        assert_eq!(server.start().await.unwrap(), ServerState::Running);
        assert!(server.is_running());

        server.stop().await.unwrap();
        assert!(!server.is_running());
        // the identifier was released, so a restart binds again
        assert_eq!(server.start().await.unwrap(), ServerState::Running);
        server.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_echo_session_updates_server_metrics() {
        let server = RSocketServer::new(TransportConfig::tcp("127.0.0.1:0").unwrap()).unwrap();
        server.start().await.unwrap();
        let address = server.local_address().unwrap();

        let client = RSocketClient::new(TransportConfig::tcp(address).unwrap()).unwrap();
        client.connect().await.unwrap();
        let reply = client
            .request_response(Payload::from_text("Hello, World!", Some("metadata")))
            .await
            .unwrap();
        assert_eq!(reply.data_utf8().unwrap(), Some("Hello, World!"));
        assert_eq!(reply.metadata_utf8().unwrap(), Some("metadata"));

        let metrics = server.metrics();
        let client_metrics = client.metrics();
        assert_eq!(metrics.request_count(), 1);
        assert!(
            eventually(|| {
                metrics.response_count() == 1
                    && metrics.bytes_sent() == client_metrics.bytes_received()
            })
            .await
        );
        assert_eq!(metrics.bytes_received(), client_metrics.bytes_sent());
        assert_eq!(server.session_count(), 1);
        assert_eq!(server.sessions()[0].state, ConnectionState::Connected);

        client.close().await.unwrap();
        server.stop().await.unwrap();
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_per_session_metrics() {
        let server = RSocketServer::new(TransportConfig::overlay("iroh://server-per-session").unwrap())
            .unwrap()
            .with_per_session_metrics(true);
        server.start().await.unwrap();

        let client = RSocketClient::new(TransportConfig::overlay("iroh://server-per-session").unwrap()).unwrap();
        client.connect().await.unwrap();
        client.request_response(Payload::from_text("a", None)).await.unwrap();
        client.request_response(Payload::from_text("b", None)).await.unwrap();

        let id = server.sessions()[0].id;
        let session = server.session(id).unwrap();
        assert_eq!(session.metrics().request_count(), 2);
        assert_eq!(server.metrics().request_count(), 0);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_errors_keep_session_alive() {
        let handler = Arc::new(FnHandler::new(|_: &SessionContext, payload: Payload| {
            match payload.data_utf8()? {
                Some("fail") => Err(RsmError::Encoding("refused".into())),
                Some("quiet") => Ok(None),
                _ => Ok(Some(payload)),
            }
        }));
        let server = RSocketServer::with_handler(
            TransportConfig::overlay("iroh://server-handler-errors").unwrap(),
            handler,
        )
        .unwrap();
        server.start().await.unwrap();

        let client = RSocketClient::new(TransportConfig::overlay("iroh://server-handler-errors").unwrap()).unwrap();
        client.connect().await.unwrap();
        client.send(Payload::from_text("fail", None)).await.unwrap();
        client.send(Payload::from_text("quiet", None)).await.unwrap();
        let reply = client.request_response(Payload::from_text("ok", None)).await;

        // the first two sends are still pending on the client, so the echo
        // of "ok" pairs with the oldest one; only content matters here
        assert_eq!(reply.unwrap().data_utf8().unwrap(), Some("ok"));
        let metrics = server.metrics();
        assert_eq!(metrics.request_count(), 3);
        assert_eq!(metrics.error_count(), 1);
        assert!(eventually(|| metrics.response_count() == 1).await);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_live_sessions() {
        let server = RSocketServer::new(TransportConfig::tcp("127.0.0.1:0").unwrap()).unwrap();
        server.start().await.unwrap();
        let address = server.local_address().unwrap();

        let client = RSocketClient::new(TransportConfig::tcp(address).unwrap()).unwrap();
        client.connect().await.unwrap();
        client.request_response(Payload::from_text("hi", None)).await.unwrap();

        server.stop().await.unwrap();
        let err = client.receive().await.unwrap_err();
        assert!(matches!(err, RsmError::ConnectionClosed));
        assert!(!client.is_connected());
    }

    struct StuckHandler;

    #[async_trait::async_trait]
    impl RequestHandler for StuckHandler {
        async fn handle(&self, _session: &SessionContext, _payload: Payload) -> Result<Option<Payload>> {
            std::future::pending::<()>().await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_stop_aborts_stuck_handlers() {
        let server = RSocketServer::with_handler(
            TransportConfig::overlay("iroh://server-stuck-handler").unwrap(),
            Arc::new(StuckHandler),
        )
        .unwrap();
        server.start().await.unwrap();

        let client = RSocketClient::new(TransportConfig::overlay("iroh://server-stuck-handler").unwrap()).unwrap();
        client.connect().await.unwrap();
        client.send(Payload::from_text("never answered", None)).await.unwrap();
        assert!(eventually(|| server.metrics().request_count() == 1).await);

        tokio::time::timeout(Duration::from_secs(5), server.stop())
            .await
            .expect("stop returns despite a stuck handler")
            .unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.session_count(), 0);
    }

    /// Listener whose accept always fails
    struct BrokenListener {
        attempts: AtomicU64,
    }

    #[async_trait::async_trait]
    impl Listener for BrokenListener {
        async fn accept(&self) -> Result<Box<dyn ByteStream>> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            Err(RsmError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "too many open files",
            )))
        }

        fn local_addr(&self) -> String {
            "broken".into()
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_accept_errors_back_off() {
        let listener = Arc::new(BrokenListener {
            attempts: AtomicU64::new(0),
        });
        let metrics = PerformanceMetrics::shared();
        let shared = Arc::new(SessionShared {
            config: Arc::new(TransportConfig::tcp("127.0.0.1:0").unwrap()),
            codec: FrameCodec::default(),
            metrics: metrics.clone(),
            handler: Arc::new(EchoHandler),
            per_session_metrics: false,
            sessions: Arc::new(DashMap::new()),
            next_session_id: Arc::new(AtomicU64::new(1)),
        });
        let shutdown = Arc::new(CloseSignal::new());

        let task = tokio::spawn(accept_loop(listener.clone(), shutdown.clone(), shared, 4));
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.close();
        task.await.unwrap();

        let attempts = listener.attempts.load(Ordering::Relaxed);
        assert!(attempts >= 2, "attempts = {}", attempts);
        assert!(attempts < 20, "attempts = {}", attempts);
        assert_eq!(metrics.error_count(), attempts);
    }

    #[tokio::test]
    async fn test_bind_failure_returns_to_stopped() {
        let holder = RSocketServer::new(TransportConfig::overlay("iroh://server-taken").unwrap()).unwrap();
        holder.start().await.unwrap();

        let server = RSocketServer::new(TransportConfig::overlay("iroh://server-taken").unwrap()).unwrap();
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, RsmError::BindFailed(_)));
        assert_eq!(server.state(), ServerState::Stopped);
    }
}
