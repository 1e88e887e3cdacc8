//! Error type shared by every layer of the engine

use crate::config::TransportType;

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, RsmError>;

/// Errors surfaced by configuration, codec, transport and session operations
#[derive(Debug, thiserror::Error)]
pub enum RsmError {
    #[error("invalid {transport} address: {address:?}")]
    InvalidAddress {
        address: String,
        transport: TransportType,
    },

    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("connect already in progress")]
    AlreadyConnecting,

    #[error("listener closed")]
    ListenerClosed,

    /// The peer closed or reset the byte stream
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("operation timed out")]
    Timeout,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RsmError {
    pub fn invalid_address(address: impl Into<String>, transport: TransportType) -> Self {
        RsmError::InvalidAddress {
            address: address.into(),
            transport,
        }
    }

    pub fn connection_failed(reason: impl std::fmt::Display) -> Self {
        RsmError::ConnectionFailed(reason.to_string())
    }

    pub fn bind_failed(reason: impl std::fmt::Display) -> Self {
        RsmError::BindFailed(reason.to_string())
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        RsmError::MalformedFrame(reason.into())
    }

    /// Errors after which the session cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(self, RsmError::ConnectionClosed | RsmError::ListenerClosed)
    }

    /// Transport failures that drop a connection but leave it retryable
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RsmError::Io(_) | RsmError::ConnectionFailed(_) | RsmError::Timeout
        )
    }

    /// Codec-level failures scoped to a single message
    pub fn is_codec(&self) -> bool {
        matches!(
            self,
            RsmError::MalformedFrame(_) | RsmError::Encoding(_) | RsmError::ResourceExhausted(_)
        )
    }
}

impl From<serde_json::Error> for RsmError {
    fn from(e: serde_json::Error) -> Self {
        RsmError::Encoding(e.to_string())
    }
}

impl From<std::str::Utf8Error> for RsmError {
    fn from(e: std::str::Utf8Error) -> Self {
        RsmError::Encoding(format!("invalid UTF-8: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(RsmError::ConnectionClosed.is_fatal());
        assert!(RsmError::ListenerClosed.is_fatal());
        assert!(!RsmError::NotConnected.is_fatal());

        let io = RsmError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"));
        assert!(io.is_transient());
        assert!(!io.is_fatal());

        assert!(RsmError::malformed("short").is_codec());
        assert!(!RsmError::malformed("short").is_transient());
    }

    #[test]
    fn test_invalid_address_message() {
        let err = RsmError::invalid_address("nope", TransportType::Tcp);
        let msg = err.to_string();
        assert!(msg.contains("tcp"));
        assert!(msg.contains("nope"));
    }
}
