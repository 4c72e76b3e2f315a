//! Core types for tunnel peer configuration.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::TunnelError;
use crate::keys::{PrivateKey, PublicKey};

/// Default persistent keepalive interval for peer links.
pub const DEFAULT_KEEPALIVE_SECS: u16 = 25;

/// Unique identifier for a remote cluster.
///
/// Generated once when a cluster is first provisioned and never reused.
/// Used as the primary key for all peer-scoped state.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    /// Creates a cluster ID from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty.
    pub fn new(id: impl Into<String>) -> Result<Self, TunnelError> {
        let id = id.into();
        if id.is_empty() {
            return Err(TunnelError::InvalidConfig(
                "cluster ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClusterId({})", self.0)
    }
}

impl FromStr for ClusterId {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A remote tunnel endpoint (host:port).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    address: SocketAddr,
}

impl Endpoint {
    /// Creates a new endpoint from a socket address.
    #[must_use]
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }

    /// Creates an endpoint from an IP address and port.
    #[must_use]
    pub fn from_ip_port(ip: IpAddr, port: u16) -> Self {
        Self {
            address: SocketAddr::new(ip, port),
        }
    }

    /// Returns the socket address.
    #[must_use]
    pub fn address(&self) -> &SocketAddr {
        &self.address
    }

    /// Returns the IP address.
    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.address.ip()
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl FromStr for Endpoint {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = s
            .parse::<SocketAddr>()
            .map_err(|e| TunnelError::InvalidEndpoint(e.to_string()))?;
        Ok(Self { address })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// An address range a peer may advertise or route, in CIDR notation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllowedRange {
    network: IpNet,
}

impl AllowedRange {
    /// Creates an allowed range from an `IpNet`.
    #[must_use]
    pub fn new(network: IpNet) -> Self {
        Self { network }
    }

    /// Returns the network.
    #[must_use]
    pub fn network(&self) -> &IpNet {
        &self.network
    }

    /// Creates an allowed range from CIDR notation.
    ///
    /// # Errors
    ///
    /// Returns an error if the CIDR notation is invalid.
    pub fn from_cidr(s: &str) -> Result<Self, TunnelError> {
        let network = s
            .parse::<IpNet>()
            .map_err(|e| TunnelError::InvalidCidr(e.to_string()))?;
        Ok(Self { network })
    }

    /// Returns the CIDR string representation.
    #[must_use]
    pub fn to_cidr(&self) -> String {
        self.network.to_string()
    }
}

impl FromStr for AllowedRange {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl fmt::Display for AllowedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}

/// Live configuration for one encrypted peer link.
///
/// One instance exists per currently-peered cluster, owned exclusively by
/// the tunnel fabric. Destroyed when the peer is unpeered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelPeerConfig {
    /// The remote cluster this link connects to.
    pub cluster: ClusterId,
    /// Our private key for this link.
    pub local_private_key: PrivateKey,
    /// The remote side's public key.
    pub remote_public_key: PublicKey,
    /// The remote tunnel endpoint.
    pub remote_endpoint: Endpoint,
    /// Address ranges routed over this link (possibly NAT-translated).
    pub allowed_ranges: Vec<AllowedRange>,
    /// Persistent keepalive interval in seconds.
    pub keepalive_secs: u16,
}

impl TunnelPeerConfig {
    /// Creates a new peer config.
    #[must_use]
    pub fn new(
        cluster: ClusterId,
        local_private_key: PrivateKey,
        remote_public_key: PublicKey,
        remote_endpoint: Endpoint,
    ) -> Self {
        Self {
            cluster,
            local_private_key,
            remote_public_key,
            remote_endpoint,
            allowed_ranges: Vec::new(),
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
        }
    }

    /// Adds an allowed range.
    #[must_use]
    pub fn with_allowed_range(mut self, range: AllowedRange) -> Self {
        self.allowed_ranges.push(range);
        self
    }

    /// Replaces the allowed range set.
    #[must_use]
    pub fn with_allowed_ranges(mut self, ranges: Vec<AllowedRange>) -> Self {
        self.allowed_ranges = ranges;
        self
    }

    /// Sets the keepalive interval.
    #[must_use]
    pub fn with_keepalive(mut self, seconds: u16) -> Self {
        self.keepalive_secs = seconds;
        self
    }

    /// Validates the config before it reaches a driver.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if no allowed ranges are set.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.allowed_ranges.is_empty() {
            return Err(TunnelError::InvalidConfig(format!(
                "peer config for {} has no allowed ranges",
                self.cluster
            )));
        }
        Ok(())
    }

    /// Returns whether applying `other` over this config rotates the link.
    ///
    /// A changed endpoint or key requires re-creating the underlying link;
    /// a changed allowed-range set or keepalive can be applied in place.
    #[must_use]
    pub fn requires_rotation(&self, other: &Self) -> bool {
        self.remote_public_key != other.remote_public_key
            || self.remote_endpoint != other.remote_endpoint
            || self.local_private_key != other.local_private_key
    }
}

impl PartialEq for TunnelPeerConfig {
    fn eq(&self, other: &Self) -> bool {
        self.cluster == other.cluster
            && self.local_private_key == other.local_private_key
            && self.remote_public_key == other.remote_public_key
            && self.remote_endpoint == other.remote_endpoint
            && self.allowed_ranges == other.allowed_ranges
            && self.keepalive_secs == other.keepalive_secs
    }
}

impl Eq for TunnelPeerConfig {}

/// Point-in-time traffic reading for one peer link.
///
/// Counters are monotonic but may reset when a link is re-created.
/// Ephemeral: recomputed on each collection tick, never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerMetricsSample {
    /// Bytes received from the peer.
    pub rx_bytes: u64,
    /// Bytes transmitted to the peer.
    pub tx_bytes: u64,
    /// Unix timestamp of the last successful handshake, if any.
    pub last_handshake_secs: Option<u64>,
    /// When this sample was taken.
    pub sampled_at: DateTime<Utc>,
}

impl PeerMetricsSample {
    /// Creates a sample taken now.
    #[must_use]
    pub fn now(rx_bytes: u64, tx_bytes: u64, last_handshake_secs: Option<u64>) -> Self {
        Self {
            rx_bytes,
            tx_bytes,
            last_handshake_secs,
            sampled_at: Utc::now(),
        }
    }

    /// Seconds elapsed since the last handshake, relative to the sample time.
    #[must_use]
    pub fn seconds_since_handshake(&self) -> Option<u64> {
        let handshake = self.last_handshake_secs?;
        let sampled = u64::try_from(self.sampled_at.timestamp()).ok()?;
        Some(sampled.saturating_sub(handshake))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TunnelPeerConfig {
        let cluster = ClusterId::new("cluster-a").expect("valid id");
        let local = PrivateKey::generate();
        let remote = PrivateKey::generate().public_key();
        let endpoint: Endpoint = "203.0.113.10:51820".parse().expect("valid endpoint");
        TunnelPeerConfig::new(cluster, local, remote, endpoint)
            .with_allowed_range(AllowedRange::from_cidr("10.244.0.0/16").expect("valid cidr"))
    }

    // ==================== ClusterId Tests ====================

    #[test]
    fn cluster_id_rejects_empty() {
        assert!(ClusterId::new("").is_err());
    }

    #[test]
    fn cluster_id_display_and_parse() {
        let id: ClusterId = "cluster-a".parse().expect("valid id");
        assert_eq!(id.to_string(), "cluster-a");
        assert_eq!(id.as_str(), "cluster-a");
    }

    // ==================== Endpoint Tests ====================

    #[test]
    fn endpoint_parse_roundtrip() {
        let endpoint: Endpoint = "192.0.2.1:51820".parse().expect("valid endpoint");
        assert_eq!(endpoint.port(), 51820);
        assert_eq!(endpoint.to_string(), "192.0.2.1:51820");
    }

    #[test]
    fn endpoint_parse_invalid_fails() {
        let result = "not-an-endpoint".parse::<Endpoint>();
        assert!(matches!(result, Err(TunnelError::InvalidEndpoint(_))));
    }

    // ==================== AllowedRange Tests ====================

    #[test]
    fn allowed_range_from_cidr() {
        let range = AllowedRange::from_cidr("10.244.0.0/16").expect("valid cidr");
        assert_eq!(range.to_cidr(), "10.244.0.0/16");
    }

    #[test]
    fn allowed_range_invalid_cidr_fails() {
        let result = AllowedRange::from_cidr("10.244.0.0/99");
        assert!(matches!(result, Err(TunnelError::InvalidCidr(_))));
    }

    // ==================== TunnelPeerConfig Tests ====================

    #[test]
    fn config_validate_requires_ranges() {
        let mut config = test_config();
        config.allowed_ranges.clear();
        assert!(matches!(
            config.validate(),
            Err(TunnelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn config_validate_accepts_populated() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn unchanged_config_needs_no_rotation() {
        let config = test_config();
        assert!(!config.requires_rotation(&config.clone()));
    }

    #[test]
    fn changed_endpoint_requires_rotation() {
        let config = test_config();
        let mut updated = config.clone();
        updated.remote_endpoint = "203.0.113.99:51820".parse().expect("valid endpoint");
        assert!(config.requires_rotation(&updated));
    }

    #[test]
    fn changed_remote_key_requires_rotation() {
        let config = test_config();
        let mut updated = config.clone();
        updated.remote_public_key = PrivateKey::generate().public_key();
        assert!(config.requires_rotation(&updated));
    }

    #[test]
    fn changed_ranges_do_not_require_rotation() {
        let config = test_config();
        let updated = config
            .clone()
            .with_allowed_range(AllowedRange::from_cidr("10.96.0.0/12").expect("valid cidr"));
        assert!(!config.requires_rotation(&updated));
        assert_ne!(config, updated);
    }

    // ==================== PeerMetricsSample Tests ====================

    #[test]
    fn sample_seconds_since_handshake() {
        let now = u64::try_from(Utc::now().timestamp()).expect("positive timestamp");
        let sample = PeerMetricsSample::now(100, 50, Some(now - 30));
        let elapsed = sample.seconds_since_handshake().expect("has handshake");
        assert!((30..=31).contains(&elapsed));
    }

    #[test]
    fn sample_without_handshake() {
        let sample = PeerMetricsSample::now(0, 0, None);
        assert!(sample.seconds_since_handshake().is_none());
    }
}
