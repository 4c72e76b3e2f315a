//! Per-peer address mappings between real and substitute ranges.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use fed_tunnel::ClusterId;

/// One translated range: the peer's real CIDR and the disjoint CIDR the
/// local cluster routes in its place. Identity entries have
/// `substitute == original`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// The CIDR the remote cluster actually uses.
    pub original: IpNet,
    /// The CIDR the local cluster addresses the remote range by.
    pub substitute: IpNet,
}

impl MappingEntry {
    /// Creates an identity entry (no translation).
    #[must_use]
    pub fn identity(original: IpNet) -> Self {
        Self {
            original,
            substitute: original,
        }
    }

    /// Creates a translated entry.
    #[must_use]
    pub fn translated(original: IpNet, substitute: IpNet) -> Self {
        Self {
            original,
            substitute,
        }
    }

    /// Returns whether this entry performs no translation.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.original == self.substitute
    }
}

/// The full translation table for one remote cluster.
///
/// Invariant: substitute ranges are disjoint across all active mappings and
/// from the local cluster's own ranges. Once assigned, a substitute range
/// is stable for the lifetime of the peering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMapping {
    cluster: ClusterId,
    entries: Vec<MappingEntry>,
}

impl AddressMapping {
    /// Creates a mapping from its entries.
    #[must_use]
    pub fn new(cluster: ClusterId, entries: Vec<MappingEntry>) -> Self {
        Self { cluster, entries }
    }

    /// The cluster this mapping belongs to.
    #[must_use]
    pub fn cluster(&self) -> &ClusterId {
        &self.cluster
    }

    /// The translation entries, in allocation order.
    #[must_use]
    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    /// Returns whether every entry is identity (nothing translated).
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.entries.iter().all(MappingEntry::is_identity)
    }

    /// The ranges the local cluster routes for this peer (substitutes,
    /// which equal the originals for identity entries).
    #[must_use]
    pub fn translated_ranges(&self) -> Vec<IpNet> {
        self.entries.iter().map(|e| e.substitute).collect()
    }

    /// The ranges the peer actually advertised.
    #[must_use]
    pub fn original_ranges(&self) -> Vec<IpNet> {
        self.entries.iter().map(|e| e.original).collect()
    }

    /// Rewrites a substitute-range address to the peer's real address.
    ///
    /// Returns `None` if the address is not in any substitute range.
    #[must_use]
    pub fn to_original(&self, addr: IpAddr) -> Option<IpAddr> {
        self.entries
            .iter()
            .find(|e| e.substitute.contains(&addr))
            .and_then(|e| rebase(addr, &e.substitute, &e.original))
    }

    /// Rewrites a real peer address to its substitute-range form.
    ///
    /// Returns `None` if the address is not in any original range.
    #[must_use]
    pub fn to_substitute(&self, addr: IpAddr) -> Option<IpAddr> {
        self.entries
            .iter()
            .find(|e| e.original.contains(&addr))
            .and_then(|e| rebase(addr, &e.original, &e.substitute))
    }
}

/// Moves `addr` from `from` into `to`, preserving the host offset.
///
/// Both networks must have the same prefix length; the allocator only pairs
/// equal-sized ranges.
fn rebase(addr: IpAddr, from: &IpNet, to: &IpNet) -> Option<IpAddr> {
    match (addr, from, to) {
        (IpAddr::V4(v4), IpNet::V4(from_v4), IpNet::V4(to_v4)) => {
            let offset = u32::from(v4).checked_sub(u32::from(from_v4.network()))?;
            let rebased = u32::from(to_v4.network()).checked_add(offset)?;
            Some(IpAddr::V4(Ipv4Addr::from(rebased)))
        }
        // Identity is the only supported IPv6 mapping.
        (IpAddr::V6(_), _, _) if from == to => Some(addr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> ClusterId {
        ClusterId::new("cluster-a").expect("valid id")
    }

    fn net(s: &str) -> IpNet {
        s.parse().expect("valid cidr")
    }

    #[test]
    fn identity_mapping_reports_identity() {
        let mapping = AddressMapping::new(
            cluster(),
            vec![MappingEntry::identity(net("192.168.0.0/24"))],
        );
        assert!(mapping.is_identity());
        assert_eq!(mapping.translated_ranges(), vec![net("192.168.0.0/24")]);
    }

    #[test]
    fn translated_mapping_is_not_identity() {
        let mapping = AddressMapping::new(
            cluster(),
            vec![MappingEntry::translated(
                net("10.244.0.0/16"),
                net("10.70.0.0/16"),
            )],
        );
        assert!(!mapping.is_identity());
    }

    #[test]
    fn to_substitute_preserves_host_offset() {
        let mapping = AddressMapping::new(
            cluster(),
            vec![MappingEntry::translated(
                net("10.244.0.0/16"),
                net("10.70.0.0/16"),
            )],
        );

        let rewritten = mapping
            .to_substitute("10.244.3.7".parse().expect("valid ip"))
            .expect("in range");
        assert_eq!(rewritten, "10.70.3.7".parse::<IpAddr>().expect("valid ip"));
    }

    #[test]
    fn to_original_inverts_to_substitute() {
        let mapping = AddressMapping::new(
            cluster(),
            vec![MappingEntry::translated(
                net("10.244.0.0/16"),
                net("10.70.0.0/16"),
            )],
        );

        let addr: IpAddr = "10.244.200.1".parse().expect("valid ip");
        let there = mapping.to_substitute(addr).expect("forward");
        let back = mapping.to_original(there).expect("reverse");
        assert_eq!(back, addr);
    }

    #[test]
    fn out_of_range_address_is_none() {
        let mapping = AddressMapping::new(
            cluster(),
            vec![MappingEntry::translated(
                net("10.244.0.0/16"),
                net("10.70.0.0/16"),
            )],
        );
        assert!(mapping
            .to_substitute("192.168.1.1".parse().expect("valid ip"))
            .is_none());
    }

    #[test]
    fn identity_entry_rewrites_to_itself() {
        let mapping = AddressMapping::new(
            cluster(),
            vec![MappingEntry::identity(net("192.168.0.0/24"))],
        );
        let addr: IpAddr = "192.168.0.9".parse().expect("valid ip");
        assert_eq!(mapping.to_substitute(addr), Some(addr));
        assert_eq!(mapping.to_original(addr), Some(addr));
    }
}
