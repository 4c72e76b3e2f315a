//! Substitute range allocation from the reserved pool.
//!
//! Colliding remote ranges are remapped into a private reserved pool.
//! Allocation scans pool blocks of the required size in ascending address
//! order and takes the first free one, so the same inputs replayed over the
//! same prior allocations always produce the same mapping. That makes the
//! allocator restart-stable as long as prior mappings are restored from
//! persisted state before new requests arrive.

use std::collections::HashMap;

use ipnet::{IpNet, Ipv4Net};
use parking_lot::Mutex;
use tracing::{debug, info};

use fed_tunnel::ClusterId;

use crate::error::{NatError, Result};
use crate::mapping::{AddressMapping, MappingEntry};

/// Default reserved pool for substitute ranges.
pub const DEFAULT_SUBSTITUTE_POOL: &str = "10.70.0.0/15";

/// Configuration for the translation allocator.
#[derive(Clone, Debug)]
pub struct NatAllocatorConfig {
    /// The reserved pool substitute ranges are carved from.
    pub pool: Ipv4Net,
    /// The local cluster's own ranges (pod/service CIDRs). Remote ranges
    /// overlapping these are always translated.
    pub local_ranges: Vec<IpNet>,
}

impl Default for NatAllocatorConfig {
    fn default() -> Self {
        Self {
            // The constant is a valid CIDR literal.
            #[allow(clippy::expect_used)]
            pool: DEFAULT_SUBSTITUTE_POOL.parse().expect("valid pool CIDR"),
            local_ranges: Vec::new(),
        }
    }
}

impl NatAllocatorConfig {
    /// Creates a config with the given pool.
    #[must_use]
    pub fn new(pool: Ipv4Net) -> Self {
        Self {
            pool,
            local_ranges: Vec::new(),
        }
    }

    /// Adds a local cluster range.
    #[must_use]
    pub fn with_local_range(mut self, range: IpNet) -> Self {
        self.local_ranges.push(range);
        self
    }
}

/// Returns whether two CIDRs share any address.
///
/// CIDRs are aligned, so overlap implies one contains the other.
fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}

/// Shared allocator state behind the critical section.
#[derive(Debug, Default)]
struct AllocatorState {
    mappings: HashMap<ClusterId, AddressMapping>,
}

impl AllocatorState {
    /// Every range currently routed locally: identity originals plus
    /// assigned substitutes.
    fn routed_ranges(&self) -> Vec<IpNet> {
        self.mappings
            .values()
            .flat_map(AddressMapping::translated_ranges)
            .collect()
    }
}

/// The address translation manager.
///
/// The pool-scan-and-reserve operation is a critical section: peers may be
/// onboarded concurrently and substitute disjointness must hold across all
/// of them.
#[derive(Debug)]
pub struct NatAllocator {
    config: NatAllocatorConfig,
    state: Mutex<AllocatorState>,
}

impl NatAllocator {
    /// Creates an allocator with the given configuration.
    #[must_use]
    pub fn new(config: NatAllocatorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    /// Computes the address mapping for a remote cluster's advertised CIDRs.
    ///
    /// Non-colliding ranges map to themselves; colliding ranges get a
    /// deterministic first-fit substitute from the pool. Re-running with the
    /// same advertised set returns the stored mapping unchanged. A changed
    /// advertised set discards the old mapping and derives a fresh one.
    ///
    /// All-or-nothing: on failure no partial mapping is retained.
    ///
    /// # Errors
    ///
    /// Returns `RangeExhausted` when no free pool block of the required size
    /// remains, or `UnsupportedRange` for a colliding non-IPv4 range.
    pub fn allocate(&self, cluster: &ClusterId, remote_cidrs: &[IpNet]) -> Result<AddressMapping> {
        // Deduplicate and order the advertised set so allocation order does
        // not depend on how the caller happened to list the ranges.
        let mut requested: Vec<IpNet> = remote_cidrs.to_vec();
        requested.sort();
        requested.dedup();

        let mut state = self.state.lock();

        if let Some(existing) = state.mappings.get(cluster) {
            let mut prior = existing.original_ranges();
            prior.sort();
            if prior == requested {
                return Ok(existing.clone());
            }
            debug!(cluster = %cluster, "advertised ranges changed, rebuilding mapping");
            state.mappings.remove(cluster);
        }

        let mut busy: Vec<IpNet> = self.config.local_ranges.clone();
        busy.extend(state.routed_ranges());

        let mut entries = Vec::with_capacity(requested.len());
        for cidr in requested {
            if busy.iter().any(|used| overlaps(used, &cidr)) {
                let substitute = self.find_substitute(&cluster.to_string(), cidr, &busy)?;
                busy.push(substitute);
                entries.push(MappingEntry::translated(cidr, substitute));
            } else {
                busy.push(cidr);
                entries.push(MappingEntry::identity(cidr));
            }
        }

        let mapping = AddressMapping::new(cluster.clone(), entries);
        state.mappings.insert(cluster.clone(), mapping.clone());

        info!(
            cluster = %cluster,
            identity = mapping.is_identity(),
            ranges = mapping.entries().len(),
            "allocated address mapping"
        );
        Ok(mapping)
    }

    /// Releases a cluster's mapping, freeing its substitute ranges.
    ///
    /// Unknown clusters are a no-op so teardown stays idempotent.
    pub fn release(&self, cluster: &ClusterId) {
        let mut state = self.state.lock();
        if state.mappings.remove(cluster).is_some() {
            info!(cluster = %cluster, "released address mapping");
        }
    }

    /// Reseeds state from persisted mappings.
    ///
    /// Called at startup so a restarted controller reproduces the same
    /// substitute assignments for existing peerings.
    pub fn restore(&self, mappings: impl IntoIterator<Item = AddressMapping>) {
        let mut state = self.state.lock();
        for mapping in mappings {
            debug!(cluster = %mapping.cluster(), "restored address mapping");
            state.mappings.insert(mapping.cluster().clone(), mapping);
        }
    }

    /// Returns the mapping for a cluster, if one is active.
    #[must_use]
    pub fn mapping(&self, cluster: &ClusterId) -> Option<AddressMapping> {
        self.state.lock().mappings.get(cluster).cloned()
    }

    /// Returns all active mappings.
    #[must_use]
    pub fn active_mappings(&self) -> Vec<AddressMapping> {
        self.state.lock().mappings.values().cloned().collect()
    }

    /// First-fit scan of pool blocks for a free block matching the prefix
    /// length of `cidr`.
    fn find_substitute(&self, cluster: &str, cidr: IpNet, busy: &[IpNet]) -> Result<IpNet> {
        let IpNet::V4(v4) = cidr else {
            return Err(NatError::UnsupportedRange(cidr));
        };

        let exhausted = || NatError::RangeExhausted {
            cluster: cluster.to_string(),
            cidr,
        };

        if v4.prefix_len() < self.config.pool.prefix_len() {
            // The range is larger than the whole pool.
            return Err(exhausted());
        }

        let blocks = self
            .config
            .pool
            .subnets(v4.prefix_len())
            .map_err(|_| exhausted())?;

        for block in blocks {
            let candidate = IpNet::V4(block);
            if !busy.iter().any(|used| overlaps(used, &candidate)) {
                return Ok(candidate);
            }
        }

        Err(exhausted())
    }
}

impl Default for NatAllocator {
    fn default() -> Self {
        Self::new(NatAllocatorConfig::default())
    }
}
