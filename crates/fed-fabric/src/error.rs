//! Error types for tunnel fabric operations.

use thiserror::Error;

use fed_nat::NatError;
use fed_tunnel::TunnelError;

/// Result alias for fabric operations.
pub type Result<T> = std::result::Result<T, FabricError>;

/// Errors that can occur while managing the tunnel fabric.
#[derive(Debug, Clone, Error)]
pub enum FabricError {
    /// Address translation could not produce a mapping.
    ///
    /// Aborts the peering attempt; retried only after desired state changes
    /// or pool capacity is freed.
    #[error("address translation failed: {0}")]
    TranslationFailed(#[source] NatError),

    /// The tunnel driver rejected or failed the operation.
    #[error("tunnel driver failed: {0}")]
    DriverFailed(#[source] TunnelError),

    /// No active tunnel exists for the cluster.
    #[error("no active tunnel for cluster {0}")]
    NotEstablished(String),
}

impl FabricError {
    /// Returns whether this error is transient and worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DriverFailed(inner) => inner.is_transient(),
            Self::TranslationFailed(_) | Self::NotEstablished(_) => false,
        }
    }
}
