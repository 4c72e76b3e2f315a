//! Error types for peering handshakes and lifecycle reconciliation.

use thiserror::Error;

use fed_fabric::FabricError;

/// Result alias for handshake operations.
pub type HandshakeResult<T> = std::result::Result<T, HandshakeError>;

/// Result alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, PeeringError>;

/// Errors from the cross-cluster handshake exchange.
#[derive(Debug, Clone, Error)]
pub enum HandshakeError {
    /// The remote cluster's API could not be reached. Transient: retried
    /// with capped exponential backoff.
    #[error("remote cluster unreachable: {0}")]
    Unreachable(String),

    /// The remote cluster rejected the peering request. Terminal for this
    /// request: requires operator intervention, never retried.
    #[error("peering request rejected: {0}")]
    Rejected(String),

    /// The request itself is malformed.
    #[error("invalid peering request: {0}")]
    InvalidRequest(String),
}

impl HandshakeError {
    /// Returns whether this error is transient and worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Errors from lifecycle reconciliation.
#[derive(Debug, Clone, Error)]
pub enum PeeringError {
    /// The handshake with the remote cluster failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The tunnel fabric failed to establish or tear down the link.
    #[error(transparent)]
    Fabric(#[from] FabricError),

    /// No record exists for the cluster.
    #[error("unknown cluster {0}")]
    UnknownCluster(String),
}

impl PeeringError {
    /// Returns whether this error is transient and worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Handshake(inner) => inner.is_transient(),
            Self::Fabric(inner) => inner.is_transient(),
            Self::UnknownCluster(_) => false,
        }
    }
}
