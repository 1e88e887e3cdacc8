//! Process-local peer-addressed overlay.
//!
//! A listener registers the peer identifier of its `scheme://peer-id`
//! address; dialers look the identifier up and are handed one end of an
//! in-memory duplex pipe carrying length-prefixed frames.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rsm_core::config::{overlay_peer_id, TuningOptions};
use rsm_core::{Result, RsmError, TransportType};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};

use crate::connector::{ByteStream, CloseSignal, Listener};
use crate::framed::FramedStream;

/// Pending dials a listener may queue before dialers wait
const ACCEPT_BACKLOG: usize = 128;

pub type OverlayConnection = FramedStream<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

struct Registration {
    token: u64,
    dialer: mpsc::Sender<(String, DuplexStream)>,
}

static PEERS: Lazy<DashMap<String, Registration>> = Lazy::new(DashMap::new);
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
static NEXT_DIALER: AtomicU64 = AtomicU64::new(1);

fn peer_id(address: &str) -> Result<&str> {
    overlay_peer_id(address).ok_or_else(|| RsmError::invalid_address(address, TransportType::Overlay))
}

fn framed(stream: DuplexStream, peer: String, tuning: &TuningOptions) -> OverlayConnection {
    let (reader, writer) = tokio::io::split(stream);
    FramedStream::new(reader, writer, peer, tuning)
}

/// Peer identifiers currently accepting connections
pub fn registered_peers() -> Vec<String> {
    PEERS.iter().map(|entry| entry.key().clone()).collect()
}

pub async fn connect(address: &str, tuning: &TuningOptions) -> Result<Box<dyn ByteStream>> {
    let id = peer_id(address)?;
    // Clone the sender out so no map guard is held across the await
    let dialer = PEERS
        .get(id)
        .map(|registration| registration.dialer.clone())
        .ok_or_else(|| RsmError::connection_failed(format!("overlay peer {} is not reachable", id)))?;

    let (local, remote) = tokio::io::duplex(tuning.buffer_size);
    let local_name = format!("overlay-dialer-{}", NEXT_DIALER.fetch_add(1, Ordering::Relaxed));
    dialer
        .send((local_name, remote))
        .await
        .map_err(|_| RsmError::connection_failed(format!("overlay peer {} stopped listening", id)))?;

    tracing::info!(peer = %address, "Overlay connection established");

    Ok(Box::new(framed(local, address.to_string(), tuning)))
}

pub async fn bind(address: &str, tuning: &TuningOptions) -> Result<Box<dyn Listener>> {
    Ok(Box::new(OverlayListener::bind(address, tuning)?))
}

pub struct OverlayListener {
    address: String,
    peer_id: String,
    token: u64,
    incoming: Mutex<mpsc::Receiver<(String, DuplexStream)>>,
    tuning: TuningOptions,
    closed: CloseSignal,
}

impl OverlayListener {
    pub fn bind(address: &str, tuning: &TuningOptions) -> Result<Self> {
        let id = peer_id(address)?.to_string();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);

        match PEERS.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(RsmError::bind_failed(format!(
                    "overlay peer {} is already registered",
                    id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(Registration { token, dialer: tx });
            }
        }

        tracing::info!(addr = %address, "Overlay peer listening");

        Ok(Self {
            address: address.to_string(),
            peer_id: id,
            token,
            incoming: Mutex::new(rx),
            tuning: *tuning,
            closed: CloseSignal::new(),
        })
    }

    fn unregister(&self) {
        PEERS.remove_if(&self.peer_id, |_, registration| registration.token == self.token);
    }
}

#[async_trait]
impl Listener for OverlayListener {
    async fn accept(&self) -> Result<Box<dyn ByteStream>> {
        if self.closed.is_closed() {
            return Err(RsmError::ListenerClosed);
        }

        let mut incoming = self.incoming.lock().await;
        let (dialer, stream) = tokio::select! {
            next = incoming.recv() => next.ok_or(RsmError::ListenerClosed)?,
            _ = self.closed.closed() => return Err(RsmError::ListenerClosed),
        };

        tracing::info!(peer = %dialer, local = %self.address, "Overlay connection accepted");

        Ok(Box::new(framed(stream, dialer, &self.tuning)))
    }

    fn local_addr(&self) -> String {
        self.address.clone()
    }

    async fn close(&self) {
        if self.closed.close() {
            self.unregister();
            tracing::debug!(addr = %self.address, "Overlay peer closed");
        }
    }
}

impl Drop for OverlayListener {
    fn drop(&mut self) {
        self.unregister();
    }
}
