//! Encrypted tunnel driver abstraction for Fedmesh cluster peering.
//!
//! This crate defines the peer-link primitive the tunnel fabric builds on:
//! Curve25519 keys, per-peer link configuration, the [`TunnelDriver`]
//! contract (ensure/remove/sample), an in-memory fake for tests, and an
//! optional kernel WireGuard implementation.

pub mod driver;
pub mod error;
pub mod keys;
#[cfg(feature = "kernel")]
pub mod kernel;
pub mod types;

pub use driver::{EnsureOutcome, FakeTunnelDriver, TunnelDriver};
pub use error::{Result, TunnelError};
#[cfg(feature = "kernel")]
pub use kernel::KernelTunnelDriver;
pub use keys::{generate_keypair, KeyPair, PrivateKey, PublicKey, KEY_SIZE};
pub use types::{
    AllowedRange, ClusterId, Endpoint, PeerMetricsSample, TunnelPeerConfig,
    DEFAULT_KEEPALIVE_SECS,
};
