//! Error types for tunnel driver operations.

use thiserror::Error;

/// Result alias for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors that can occur while driving an encrypted peer link.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    /// The underlying tunnel subsystem or the remote endpoint is unavailable.
    /// Transient: callers may retry with backoff.
    #[error("tunnel unreachable: {0}")]
    Unreachable(String),

    /// The peer configuration is malformed or incomplete.
    #[error("invalid tunnel config: {0}")]
    InvalidConfig(String),

    /// No link exists for the given cluster.
    #[error("no tunnel link for cluster {0}")]
    NotFound(String),

    /// Invalid key material.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid base64 encoding.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Invalid tunnel endpoint.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Invalid CIDR notation.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),
}

impl TunnelError {
    /// Returns whether this error is transient and worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}
