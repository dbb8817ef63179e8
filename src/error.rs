//! Error types for the proxy.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving a proxied connection.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Client violated the SOCKS5 handshake or request format
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Destination could not be resolved
    #[error("resolution failed: {0}")]
    Resolve(String),

    /// HTTP error while talking to the DNS-over-HTTPS resolver
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Relay tunnel could not be opened or was rejected
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new protocol violation
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new resolution error
    pub fn resolve(msg: impl Into<String>) -> Self {
        Error::Resolve(msg.into())
    }

    /// Create a new tunnel error
    pub fn tunnel(msg: impl Into<String>) -> Self {
        Error::Tunnel(msg.into())
    }

    /// Check if this error was caused by the client's own bytes
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Check if this error happened while establishing an upstream
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Tunnel(_) | Error::Tls(_))
    }
}
