//! Error types for service discovery.
//!
//! Scan failures never reach the request path: the cache degrades to the
//! previous mapping and logs the error instead.

use thiserror::Error;

/// Errors from service discovery operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Failed to scan for services.
    #[error("Failed to scan services: {0}")]
    ScanFailed(String),

    /// Failed to parse socket or process information.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
