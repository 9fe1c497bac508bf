//! Error Types
//!
//! Errors are grouped by the phase of the connection lifecycle they come
//! from. Configuration errors are fatal at startup; every other kind is
//! handled by the reconnect supervisor.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting was not provided
    #[error("{0} is required")]
    Missing(&'static str),

    /// A duration setting could not be parsed
    #[error("invalid duration for {key}: '{value}' (expected e.g. 500ms, 30s, 1m30s, 1.5h)")]
    InvalidDuration { key: &'static str, value: String },

    /// A numeric or boolean setting could not be parsed
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    /// TLS material was provided in an unusable combination
    #[error("invalid TLS configuration: {0}")]
    Tls(String),

    /// Backoff bounds are inconsistent
    #[error("invalid backoff: floor {floor:?} must be non-zero and not above ceiling {ceiling:?}")]
    Backoff { floor: Duration, ceiling: Duration },
}

/// Errors raised while establishing the transport.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("failed to read TLS file {}: {source}", path.display())]
    TlsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to configure TLS: {0}")]
    Tls(String),

    #[error("connection to {endpoint} not ready within {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("failed to connect to {endpoint}: {reason}")]
    Dial { endpoint: String, reason: String },
}

/// Errors raised by the authenticate exchange.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to open stream: {0}")]
    OpenStream(String),

    #[error("failed to send auth message: stream closed")]
    Send,

    #[error("failed to receive auth response: {0}")]
    Receive(String),

    #[error("stream closed before auth response")]
    StreamClosed,

    #[error("protocol violation: expected auth result, got {0}")]
    ProtocolViolation(&'static str),

    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("no auth response within {0:?}")]
    Timeout(Duration),
}

impl HandshakeError {
    /// The server's reason, if it explicitly refused the agent's credentials
    pub fn rejection_reason(&self) -> Option<&str> {
        match self {
            HandshakeError::AuthenticationRejected(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Errors that end an active session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("failed to send {0}: stream closed")]
    Send(&'static str),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("stream closed by server")]
    StreamClosed,
}

/// Terminal errors returned by the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("authentication rejected {attempts} consecutive times, last reason: {reason}")]
    AuthenticationExhausted { attempts: u32, reason: String },
}
