//! Tunnel fabric management for Fedmesh cluster peering.
//!
//! The fabric sits between the peering lifecycle and the tunnel driver:
//! it composes address translation with link configuration to establish
//! encrypted peer links, tears them down symmetrically, and publishes
//! per-peer traffic metrics.

pub mod error;
pub mod fabric;
pub mod metrics;

pub use error::{FabricError, Result};
pub use fabric::{FabricConfig, PeerTunnelHalf, TunnelFabric};
pub use metrics::{
    MetricPoint, PeerLabels, PeerMetricsRegistry, PEER_LAST_HANDSHAKE_SECONDS,
    PEER_RECEIVE_BYTES_TOTAL, PEER_TRANSMIT_BYTES_TOTAL,
};
