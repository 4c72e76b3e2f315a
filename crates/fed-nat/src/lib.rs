//! Per-peer address translation for Fedmesh cluster peering.
//!
//! Remote clusters assign their pod and service ranges independently, so a
//! peer's CIDRs may collide with the local cluster's or with another
//! peer's. This crate decides, per remote cluster, which ranges can be
//! routed as-is and which need a disjoint substitute range carved from a
//! reserved pool, and produces the translation table between the two.

pub mod allocator;
pub mod error;
pub mod mapping;

pub use allocator::{NatAllocator, NatAllocatorConfig, DEFAULT_SUBSTITUTE_POOL};
pub use error::{NatError, Result};
pub use mapping::{AddressMapping, MappingEntry};
