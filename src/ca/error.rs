//! Error types for certificate authority operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from CA loading and leaf issuance.
#[derive(Debug, Error)]
pub enum CaError {
    /// No root CA could be located.
    #[error("No root CA found (set NAMEDOCK_CA_ROOT or install one with mkcert)")]
    NotFound,

    /// Failed to read a CA file.
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        /// The file we tried to read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the CA certificate.
    #[error("Failed to parse CA certificate: {0}")]
    ParseCertificate(String),

    /// Failed to parse the CA private key.
    #[error("Failed to parse CA private key: {0}")]
    ParseKey(String),

    /// Leaf certificate generation failed.
    #[error("Leaf certificate generation failed for '{hostname}': {message}")]
    LeafGeneration {
        /// The hostname the leaf was for.
        hostname: String,
        /// Error message.
        message: String,
    },
}
