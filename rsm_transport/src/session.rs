use rsm_core::{PerformanceMetrics, TransportConfig};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of one logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    /// Terminal
    Closed = 3,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free cell for a [`ConnectionState`] with compare-and-swap transitions
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Returns the previous state
    pub fn swap(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }

    /// Move `from -> to`; on failure returns the state actually observed
    pub fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> std::result::Result<(), ConnectionState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }
}

/// Per-session view handed to request handlers
#[derive(Debug)]
pub struct SessionContext {
    id: u64,
    peer: String,
    state: AtomicConnectionState,
    metrics: Arc<PerformanceMetrics>,
    config: Arc<TransportConfig>,
}

impl SessionContext {
    pub(crate) fn new(
        id: u64,
        peer: String,
        metrics: Arc<PerformanceMetrics>,
        config: Arc<TransportConfig>,
    ) -> Self {
        Self {
            id,
            peer,
            state: AtomicConnectionState::new(ConnectionState::Connecting),
            metrics,
            config,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state);
    }

    /// Metrics this session records into: the server's aggregate, or its own
    /// when per-session metrics are enabled
    pub fn metrics(&self) -> &Arc<PerformanceMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            peer: self.peer.clone(),
            state: self.state(),
        }
    }
}

/// Snapshot of a live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub peer: String,
    pub state: ConnectionState,
}
