//! Error types and structured denials for the proxy

use serde::Serialize;
use std::time::Duration;

/// Reason codes for connections that cannot reach their intended backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialCode {
    /// On-demand backend is stopped and nobody has asked for it yet
    Sleeping,
    /// On-demand backend is being started
    Starting,
    /// Player is not on the allow-list
    NotAuthorized,
    /// Too many login attempts from this address
    RateLimited,
    /// No route matches the requested host
    NoRoute,
    /// Backend could not be reached
    Unavailable,
}

impl DenialCode {
    /// Every code the friendly responder serves
    pub const ALL: [DenialCode; 6] = [
        DenialCode::Sleeping,
        DenialCode::Starting,
        DenialCode::NotAuthorized,
        DenialCode::RateLimited,
        DenialCode::NoRoute,
        DenialCode::Unavailable,
    ];

    /// Get the code as a static string (for logs and the admin API)
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialCode::Sleeping => "SLEEPING",
            DenialCode::Starting => "STARTING",
            DenialCode::NotAuthorized => "NOT_AUTHORIZED",
            DenialCode::RateLimited => "RATE_LIMITED",
            DenialCode::NoRoute => "NO_ROUTE",
            DenialCode::Unavailable => "UNAVAILABLE",
        }
    }

    /// Whether this denial counts against the client in the failure tracker
    pub fn is_failure(&self) -> bool {
        matches!(self, DenialCode::NotAuthorized | DenialCode::RateLimited)
    }
}

impl std::fmt::Display for DenialCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured denial, delivered to the client by the friendly responder
#[derive(Debug, Clone, Serialize)]
pub struct Denial {
    /// The reason code
    pub code: DenialCode,
    /// Human-readable message
    pub message: String,
}

impl Denial {
    pub fn new(code: DenialCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Violations of the handshake wire format. Always fatal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("varint exceeds 5 bytes")]
    VarIntTooLong,
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("packet length {len} exceeds limit {max}")]
    PacketTooLarge { len: usize, max: usize },
    #[error("string length {len} exceeds limit {max}")]
    StringTooLong { len: usize, max: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("field runs past end of packet")]
    Truncated,
    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacket(i32),
}

/// Errors while reading a handshake from a live connection
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed before handshake completed ({buffered} bytes buffered)")]
    Closed { buffered: usize },
    #[error("handshake not completed within {0:?}")]
    Timeout(Duration),
}

/// Errors reported by a compute provider
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("instance '{0}' not found")]
    NotFound(String),
    #[error("provider unreachable: {0}")]
    Unreachable(String),
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

/// Errors from the backend lifecycle controller
#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("backend not ready after {0:?}")]
    Timeout(Duration),
    #[error("readiness sequence ended without an outcome")]
    Aborted,
}

/// Errors from the connection forwarder
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out connecting to {target} after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },
    #[error("failed to replay handshake to {target}: {source}")]
    Replay {
        target: String,
        #[source]
        source: std::io::Error,
    },
}
