//! Error types for proxy operations.
//!
//! This module defines structured error types for the proxy:
//! - Server errors (binding, accept)
//! - TLS errors (certificate resolution, handshake)
//! - Connection errors (upstream dial, bridging)
//! - The `SilentClose` sentinel for connections that must end with zero
//!   bytes written back to the client

use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Response construction error.
    #[error("HTTP build error: {0}")]
    HttpBuild(#[from] hyper::http::Error),

    /// Failed to bind the listening socket.
    #[error("Failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        /// The requested port.
        port: u16,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Invalid CONNECT request.
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// TLS error during handshake or certificate operations.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate issuance failed.
    #[error("Certificate error: {0}")]
    Certificate(#[from] crate::ca::CaError),

    /// WebSocket upgrade request is missing required headers.
    #[error("Malformed WebSocket upgrade: {0}")]
    MalformedUpgrade(String),

    /// Upgrade to tunnel failed.
    #[error("HTTP upgrade failed: {0}")]
    UpgradeFailed(String),

    /// The connection must be dropped without writing a response.
    ///
    /// Returned as `Err` from the hyper service so the connection task
    /// aborts before any bytes reach the client. Used for forward-proxy
    /// requests to unresolvable names and failed CONNECT dials.
    #[error("Connection closed without response")]
    SilentClose,
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}
