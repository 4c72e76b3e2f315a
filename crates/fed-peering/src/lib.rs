//! Peering lifecycle management for Fedmesh cluster federation.
//!
//! This crate owns the cross-cluster handshake (request/accept/reject)
//! and the lifecycle state machine that drives a remote cluster from
//! discovery through an established encrypted peering and back. The
//! tunnel itself is delegated to the fabric layer; this crate decides
//! when links come and go and keeps the foreign-cluster record as the
//! single source of truth.

pub mod controller;
pub mod error;
pub mod handshake;
pub mod store;
pub mod types;

pub use controller::{ClusterWorker, PeeringController, RetryPolicy};
pub use error::{HandshakeError, HandshakeResult, PeeringError, Result};
pub use handshake::{
    AcceptorConfig, AllowAll, AllowList, FakePeeringTransport, HandshakeConfig, PeeringAcceptor,
    PeeringPolicy, PeeringRequester, PeeringTransport,
};
pub use store::{ForeignClusterRecord, ForeignClusterStore};
pub use types::{
    AcceptResponse, ClusterIdentity, PeeringPhase, PeeringRequestRecord, PeeringRequestRef,
    PeeringScope,
};
