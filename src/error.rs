//! Error types for astm-client.

use serde::Serialize;
use thiserror::Error;

/// Main error type for all engine operations.
#[derive(Debug, Error)]
pub enum AstmError {
    /// Invalid host/port or other local configuration. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transport-level failure (refused, reset, DNS failure).
    #[error("Connection error: {0}")]
    Connection(String),

    /// Handshake or frame acknowledgement failed after exhausting retries.
    #[error("Transmission error: {0}")]
    Transmission(String),

    /// Malformed inbound data (checksum mismatch, unexpected control sequence).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// `send_message` called while the connection is not established.
    #[error("Not connected to server")]
    NotConnected,

    /// The operation was aborted by `disconnect()`.
    #[error("Transmission cancelled")]
    Cancelled,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A message aggregate violates its structural invariants.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Record text could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Machine-distinguishable error category reported alongside human-readable status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Connection,
    Transmission,
    Protocol,
    NotConnected,
    Cancelled,
    Message,
}

impl AstmError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::Json(_) => ErrorKind::Configuration,
            Self::Connection(_) | Self::ConnectionClosed | Self::Io(_) => ErrorKind::Connection,
            Self::Transmission(_) => ErrorKind::Transmission,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidMessage(_) | Self::Parse(_) => ErrorKind::Message,
        }
    }
}

/// Result type alias using AstmError.
pub type Result<T> = std::result::Result<T, AstmError>;
