//! Error types for address translation.

use ipnet::IpNet;
use thiserror::Error;

/// Result alias for translation operations.
pub type Result<T> = std::result::Result<T, NatError>;

/// Errors that can occur during address translation.
#[derive(Debug, Clone, Error)]
pub enum NatError {
    /// No free block of the required size remains in the substitute pool.
    ///
    /// Not retried automatically; the peering attempt is aborted until an
    /// operator frees capacity.
    #[error("substitute pool exhausted: no free block for {cidr} (cluster {cluster})")]
    RangeExhausted {
        /// The cluster whose allocation failed.
        cluster: String,
        /// The remote CIDR that could not be remapped.
        cidr: IpNet,
    },

    /// A colliding range cannot be translated (only IPv4 ranges can be
    /// remapped into the substitute pool).
    #[error("cannot translate colliding range {0}: unsupported address family")]
    UnsupportedRange(IpNet),

    /// Invalid pool or local range configuration.
    #[error("invalid translation config: {0}")]
    InvalidConfig(String),
}
