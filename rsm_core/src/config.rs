use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, RsmError};

/// Option key enabling higher internal connection concurrency
pub const OPT_CONCURRENCY: &str = "crossbeam_optimizations";
/// Option key enabling vectorized batch encode/decode
pub const OPT_VECTORIZED: &str = "simd_processing";
/// Option key selecting a [`PerformanceMode`]
pub const OPT_PERFORMANCE_MODE: &str = "performance_mode";
/// Option key overriding the transport I/O buffer size in bytes
pub const OPT_BUFFER_SIZE: &str = "buffer_size";

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
pub const HIGH_BUFFER_SIZE: usize = 256 * 1024;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_SESSIONS: usize = 256;
pub const HIGH_MAX_SESSIONS: usize = 4096;

/// Transport kinds understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Length-prefixed frames over a TCP stream
    Tcp,
    /// One frame per binary WebSocket message
    WebSocket,
    /// Length-prefixed frames over a QUIC bidirectional stream
    Quic,
    /// Peer-addressed overlay network
    Overlay,
}

impl TransportType {
    /// Every supported kind, in canonical order
    pub const ALL: [TransportType; 4] = [
        TransportType::Tcp,
        TransportType::WebSocket,
        TransportType::Quic,
        TransportType::Overlay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Tcp => "tcp",
            TransportType::WebSocket => "websocket",
            TransportType::Quic => "quic",
            TransportType::Overlay => "overlay",
        }
    }

    /// Check `address` against the syntax this transport expects
    pub fn validate_address(&self, address: &str) -> Result<()> {
        let ok = match self {
            TransportType::Tcp | TransportType::Quic => is_host_port(address),
            TransportType::WebSocket => is_websocket_url(address),
            TransportType::Overlay => is_overlay_address(address),
        };
        if ok {
            Ok(())
        } else {
            Err(RsmError::invalid_address(address, *self))
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = RsmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportType::Tcp),
            "websocket" | "ws" => Ok(TransportType::WebSocket),
            "quic" | "quinn-quic" => Ok(TransportType::Quic),
            "overlay" | "iroh-p2p" => Ok(TransportType::Overlay),
            _ => Err(RsmError::UnsupportedTransport(s.to_string())),
        }
    }
}

/// `host:port` with a non-empty host and a numeric port
fn is_host_port(address: &str) -> bool {
    if address.contains("://") || address.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((host, port)) = address.rsplit_once(':') else {
        return false;
    };
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    !host.is_empty() && port.parse::<u16>().is_ok()
}

/// `ws://host:port[/path]` or `wss://host:port[/path]`
fn is_websocket_url(address: &str) -> bool {
    let rest = address
        .strip_prefix("ws://")
        .or_else(|| address.strip_prefix("wss://"));
    match rest {
        Some(rest) => {
            let authority = rest.split('/').next().unwrap_or_default();
            is_host_port(authority)
        }
        None => false,
    }
}

/// `scheme://peer-identifier`
fn is_overlay_address(address: &str) -> bool {
    let Some((scheme, peer)) = address.split_once("://") else {
        return false;
    };
    let mut chars = scheme.chars();
    let scheme_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    let peer_ok = !peer.is_empty() && !peer.chars().any(|c| c.is_whitespace() || c == '/');
    scheme_ok && peer_ok
}

/// Peer identifier part of an overlay address
pub fn overlay_peer_id(address: &str) -> Option<&str> {
    address.split_once("://").map(|(_, peer)| peer)
}

/// Socket address part (`host:port`) of a websocket URL
pub fn websocket_authority(address: &str) -> Option<&str> {
    address
        .strip_prefix("ws://")
        .or_else(|| address.strip_prefix("wss://"))
        .and_then(|rest| rest.split('/').next())
}

/// Coarse tuning preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMode {
    #[default]
    Normal,
    /// Turns on concurrency and vectorized processing with larger buffers
    High,
}

impl PerformanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceMode::Normal => "normal",
            PerformanceMode::High => "high",
        }
    }
}

impl fmt::Display for PerformanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PerformanceMode {
    type Err = RsmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(PerformanceMode::Normal),
            "high" => Ok(PerformanceMode::High),
            other => Err(RsmError::Encoding(format!("unknown performance mode: {}", other))),
        }
    }
}

/// Typed view of the recognized option keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuningOptions {
    pub concurrency: bool,
    pub vectorized: bool,
    pub mode: PerformanceMode,
    /// Capacity of transport read/write buffers
    pub buffer_size: usize,
    /// Largest frame accepted on send or receive
    pub max_frame_size: usize,
    /// Sessions a server services at once
    pub max_sessions: usize,
}

impl Default for TuningOptions {
    fn default() -> Self {
        Self {
            concurrency: false,
            vectorized: false,
            mode: PerformanceMode::Normal,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

fn parse_flag(key: &str, value: &str) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" | "enabled" => true,
        "false" | "0" | "no" | "off" | "disabled" => false,
        _ => {
            tracing::warn!(key, value, "Unrecognized flag value, treating as disabled");
            false
        }
    }
}

/// How to reach a transport endpoint plus tuning options.
///
/// The address is validated on construction. Clients and servers hold the
/// config behind an `Arc` and never mutate it after `connect`/`start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    transport_type: TransportType,
    address: String,
    #[serde(default)]
    options: HashMap<String, String>,
}

impl TransportConfig {
    /// Create a config, applying process-wide optimization hints to keys the
    /// caller did not set
    pub fn new(
        transport_type: TransportType,
        address: impl Into<String>,
        options: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let address = address.into();
        transport_type.validate_address(&address)?;

        let mut options = options.unwrap_or_default();
        global_optimizations().apply_defaults(&mut options);

        Ok(Self {
            transport_type,
            address,
            options,
        })
    }

    /// Like [`TransportConfig::new`] but resolves the transport kind by name
    pub fn parse(
        transport_type: &str,
        address: impl Into<String>,
        options: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        Self::new(transport_type.parse()?, address, options)
    }

    pub fn tcp(address: impl Into<String>) -> Result<Self> {
        Self::new(TransportType::Tcp, address, None)
    }

    pub fn websocket(address: impl Into<String>) -> Result<Self> {
        Self::new(TransportType::WebSocket, address, None)
    }

    pub fn quic(address: impl Into<String>) -> Result<Self> {
        Self::new(TransportType::Quic, address, None)
    }

    pub fn overlay(address: impl Into<String>) -> Result<Self> {
        Self::new(TransportType::Overlay, address, None)
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Re-check the address; configs built through serde skip `new`
    pub fn validate(&self) -> Result<()> {
        self.transport_type.validate_address(&self.address)
    }

    pub fn set_option(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.options.insert(key.into(), value.into());
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Snapshot of every option, recognized or not
    pub fn all_options(&self) -> HashMap<String, String> {
        self.options.clone()
    }

    pub fn enable_concurrency_optimizations(&mut self) {
        self.set_option(OPT_CONCURRENCY, "true");
    }

    pub fn enable_vectorized_processing(&mut self) {
        self.set_option(OPT_VECTORIZED, "true");
    }

    pub fn set_performance_mode(&mut self, mode: PerformanceMode) {
        self.set_option(OPT_PERFORMANCE_MODE, mode.as_str());
    }

    pub fn set_buffer_size(&mut self, size: usize) {
        self.set_option(OPT_BUFFER_SIZE, size.to_string());
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_option(key, value);
        self
    }

    pub fn with_concurrency_optimizations(mut self) -> Self {
        self.enable_concurrency_optimizations();
        self
    }

    pub fn with_vectorized_processing(mut self) -> Self {
        self.enable_vectorized_processing();
        self
    }

    pub fn with_performance_mode(mut self, mode: PerformanceMode) -> Self {
        self.set_performance_mode(mode);
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.set_buffer_size(size);
        self
    }

    /// Resolve the recognized keys; unrecognized keys are ignored here
    pub fn tuning(&self) -> TuningOptions {
        let mode = match self.option(OPT_PERFORMANCE_MODE) {
            Some(value) => value.parse().unwrap_or_else(|_| {
                tracing::warn!(value, "Unknown performance mode, using normal");
                PerformanceMode::Normal
            }),
            None => PerformanceMode::Normal,
        };
        let high = mode == PerformanceMode::High;

        let concurrency = high
            || self
                .option(OPT_CONCURRENCY)
                .map(|v| parse_flag(OPT_CONCURRENCY, v))
                .unwrap_or(false);
        let vectorized = high
            || self
                .option(OPT_VECTORIZED)
                .map(|v| parse_flag(OPT_VECTORIZED, v))
                .unwrap_or(false);

        let default_buffer = if high { HIGH_BUFFER_SIZE } else { DEFAULT_BUFFER_SIZE };
        let buffer_size = match self.option(OPT_BUFFER_SIZE) {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(size) if size > 0 => size,
                _ => {
                    tracing::warn!(value, "Invalid buffer size, using default");
                    default_buffer
                }
            },
            None => default_buffer,
        };

        TuningOptions {
            concurrency,
            vectorized,
            mode,
            buffer_size,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_sessions: if concurrency { HIGH_MAX_SESSIONS } else { DEFAULT_MAX_SESSIONS },
        }
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportConfig({}, {})", self.transport_type, self.address)
    }
}

/// Process-wide optimization hints applied to configs created afterwards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationFlags {
    pub concurrency: bool,
    pub vectorized: bool,
    pub performance_mode: Option<PerformanceMode>,
}

impl OptimizationFlags {
    fn apply_defaults(&self, options: &mut HashMap<String, String>) {
        if self.concurrency {
            options
                .entry(OPT_CONCURRENCY.to_string())
                .or_insert_with(|| "true".to_string());
        }
        if self.vectorized {
            options
                .entry(OPT_VECTORIZED.to_string())
                .or_insert_with(|| "true".to_string());
        }
        if let Some(mode) = self.performance_mode {
            options
                .entry(OPT_PERFORMANCE_MODE.to_string())
                .or_insert_with(|| mode.as_str().to_string());
        }
    }
}

static GLOBAL_OPTIMIZATIONS: Lazy<RwLock<OptimizationFlags>> =
    Lazy::new(|| RwLock::new(OptimizationFlags::default()));

/// Replace the process-wide optimization hints
pub fn enable_optimizations(flags: OptimizationFlags) {
    tracing::debug!(?flags, "Global optimization hints updated");
    *GLOBAL_OPTIMIZATIONS.write() = flags;
}

pub fn global_optimizations() -> OptimizationFlags {
    *GLOBAL_OPTIMIZATIONS.read()
}
