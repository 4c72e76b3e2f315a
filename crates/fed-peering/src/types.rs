//! Core types for cluster peering: identities, phases, and the
//! handshake request/response records.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fed_fabric::PeerTunnelHalf;
use fed_tunnel::{ClusterId, Endpoint, PublicKey, TunnelError};

/// Immutable identifier for a remote cluster.
///
/// The ID is generated once when a cluster is first provisioned and never
/// reused; the name is free-form and only for operators and metric labels.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterIdentity {
    /// Unique cluster ID, the primary key for all peer-scoped state.
    pub id: ClusterId,
    /// Human-readable cluster name.
    pub name: String,
}

impl ClusterIdentity {
    /// Creates an identity from an existing ID and name.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Result<Self, TunnelError> {
        Ok(Self {
            id: ClusterId::new(id)?,
            name: name.into(),
        })
    }

    /// Generates a fresh identity with a random unique ID.
    ///
    /// # Panics
    ///
    /// Never panics: a UUID string is always a valid cluster ID.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn generate(name: impl Into<String>) -> Self {
        // A freshly generated UUID is never empty.
        Self {
            id: ClusterId::new(Uuid::new_v4().to_string()).expect("UUID is non-empty"),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Lifecycle phase of a remote cluster's peering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeeringPhase {
    /// No peering relationship; the terminal state after full teardown.
    #[default]
    Unknown,
    /// The cluster is known but no join has been requested.
    Discovered,
    /// A peering request is in flight to the remote cluster.
    Authenticating,
    /// The handshake succeeded; the tunnel is being established.
    Establishing,
    /// The encrypted tunnel is up and the clusters are peered.
    Peered,
    /// The peering is being unwound: tunnel teardown and remote cleanup.
    Disjoining,
    /// The remote cluster or the tunnel subsystem is unavailable; retried
    /// after a cooldown.
    Unreachable,
}

impl fmt::Display for PeeringPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Discovered => "discovered",
            Self::Authenticating => "authenticating",
            Self::Establishing => "establishing",
            Self::Peered => "peered",
            Self::Disjoining => "disjoining",
            Self::Unreachable => "unreachable",
        };
        write!(f, "{s}")
    }
}

/// Permission scope requested by a peering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeeringScope {
    /// The remote cluster may consume local resources.
    Inbound,
    /// The local cluster consumes remote resources.
    Outbound,
    /// Both directions.
    #[default]
    Bidirectional,
}

/// One cluster's request to peer with another, materialized on the
/// accepting cluster's side.
///
/// At most one active record exists per requesting cluster; a superseding
/// request deletes the old record rather than updating it in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeeringRequestRecord {
    /// The cluster asking to peer.
    pub requestor: ClusterIdentity,
    /// The permission scope requested.
    pub scope: PeeringScope,
    /// Whether the accepting side has approved the request.
    pub accepted: bool,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
}

impl PeeringRequestRecord {
    /// Creates a new, not-yet-accepted request.
    #[must_use]
    pub fn new(requestor: ClusterIdentity, scope: PeeringScope) -> Self {
        Self {
            requestor,
            scope,
            accepted: false,
            created_at: Utc::now(),
        }
    }
}

/// Handle to a peering-request record held on a remote cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeeringRequestRef {
    /// The remote-side record's unique ID.
    pub request_id: Uuid,
    /// The cluster holding the record.
    pub remote_cluster: ClusterId,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl PeeringRequestRef {
    /// Creates a reference to a freshly created remote record.
    #[must_use]
    pub fn new(remote_cluster: ClusterId) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            remote_cluster,
            created_at: Utc::now(),
        }
    }

    /// Returns whether the referenced record is older than `ttl`.
    #[must_use]
    pub fn is_expired(&self, ttl: Duration) -> bool {
        Utc::now() - self.created_at > ttl
    }
}

/// The accepting side's half of the tunnel, carried in the accept reply.
///
/// This is the only data the tunnel fabric needs to complete
/// establishment on the requesting side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcceptResponse {
    /// The accepting cluster's tunnel public key.
    pub public_key: PublicKey,
    /// The accepting cluster's tunnel endpoint.
    pub endpoint: Endpoint,
    /// The pod/service ranges the accepting cluster advertises.
    pub advertised_ranges: Vec<IpNet>,
}

impl AcceptResponse {
    /// Converts the response into the fabric's tunnel-half form.
    #[must_use]
    pub fn tunnel_half(&self) -> PeerTunnelHalf {
        PeerTunnelHalf {
            public_key: self.public_key,
            endpoint: self.endpoint.clone(),
            advertised_ranges: self.advertised_ranges.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== ClusterIdentity Tests ====================

    #[test]
    fn generated_identities_are_unique() {
        let a = ClusterIdentity::generate("a");
        let b = ClusterIdentity::generate("b");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn identity_rejects_empty_id() {
        assert!(ClusterIdentity::new("", "name").is_err());
    }

    #[test]
    fn identity_display_includes_name_and_id() {
        let identity = ClusterIdentity::new("abc-123", "prod-west").expect("valid identity");
        assert_eq!(identity.to_string(), "prod-west (abc-123)");
    }

    // ==================== PeeringPhase Tests ====================

    #[test]
    fn phase_serializes_snake_case() {
        let json = serde_json::to_string(&PeeringPhase::Authenticating).expect("serialize");
        assert_eq!(json, "\"authenticating\"");
    }

    #[test]
    fn phase_default_is_unknown() {
        assert_eq!(PeeringPhase::default(), PeeringPhase::Unknown);
    }

    // ==================== PeeringRequestRef Tests ====================

    #[test]
    fn fresh_reference_is_not_expired() {
        let reference = PeeringRequestRef::new(ClusterId::new("remote").expect("valid id"));
        assert!(!reference.is_expired(Duration::minutes(10)));
    }

    #[test]
    fn old_reference_is_expired() {
        let mut reference = PeeringRequestRef::new(ClusterId::new("remote").expect("valid id"));
        reference.created_at = Utc::now() - Duration::hours(2);
        assert!(reference.is_expired(Duration::minutes(10)));
    }

    // ==================== AcceptResponse Tests ====================

    #[test]
    fn accept_response_converts_to_tunnel_half() {
        let response = AcceptResponse {
            public_key: fed_tunnel::PrivateKey::generate().public_key(),
            endpoint: "203.0.113.10:51820".parse().expect("valid endpoint"),
            advertised_ranges: vec!["10.244.0.0/16".parse().expect("valid cidr")],
        };

        let half = response.tunnel_half();
        assert_eq!(half.public_key, response.public_key);
        assert_eq!(half.advertised_ranges, response.advertised_ranges);
    }
}
