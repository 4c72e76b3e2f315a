//! Peer link metrics registry.
//!
//! The fabric publishes per-peer traffic counters and handshake gauges
//! here; an external collector periodically snapshots them and owns the
//! wire-format exposition. Counter values come straight from the driver
//! and may reset when a link is re-created.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use fed_tunnel::{ClusterId, PeerMetricsSample};

/// Bytes received from a peer (counter).
pub const PEER_RECEIVE_BYTES_TOTAL: &str = "peer_receive_bytes_total";

/// Bytes transmitted to a peer (counter).
pub const PEER_TRANSMIT_BYTES_TOTAL: &str = "peer_transmit_bytes_total";

/// Unix timestamp of the last handshake with a peer (gauge).
pub const PEER_LAST_HANDSHAKE_SECONDS: &str = "peer_last_handshake_seconds";

/// Label set attached to every peer metric.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerLabels {
    /// The tunnel driver name.
    pub driver: String,
    /// The local device the link runs on.
    pub device: String,
    /// The remote cluster's unique ID.
    pub cluster_id: String,
    /// The remote cluster's human-readable name.
    pub cluster_name: String,
}

/// One named metric value with its labels.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricPoint {
    /// Metric name.
    pub name: &'static str,
    /// The value at snapshot time.
    pub value: f64,
    /// Dimensional labels.
    pub labels: PeerLabels,
}

/// Latest sample per peer, keyed by cluster.
#[derive(Debug, Default)]
pub struct PeerMetricsRegistry {
    peers: RwLock<HashMap<ClusterId, (PeerLabels, PeerMetricsSample)>>,
}

impl PeerMetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the latest sample for a peer, replacing any prior one.
    pub fn publish(&self, cluster: &ClusterId, labels: PeerLabels, sample: PeerMetricsSample) {
        self.peers
            .write()
            .insert(cluster.clone(), (labels, sample));
    }

    /// Drops a peer's series, called when the peer is torn down.
    pub fn remove(&self, cluster: &ClusterId) {
        self.peers.write().remove(cluster);
    }

    /// Returns the latest sample for a peer, if any.
    #[must_use]
    pub fn latest(&self, cluster: &ClusterId) -> Option<PeerMetricsSample> {
        self.peers.read().get(cluster).map(|(_, s)| s.clone())
    }

    /// Snapshots every series as flat metric points for the collector.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MetricPoint> {
        let peers = self.peers.read();
        let mut points = Vec::with_capacity(peers.len() * 3);

        for (labels, sample) in peers.values() {
            points.push(MetricPoint {
                name: PEER_RECEIVE_BYTES_TOTAL,
                value: sample.rx_bytes as f64,
                labels: labels.clone(),
            });
            points.push(MetricPoint {
                name: PEER_TRANSMIT_BYTES_TOTAL,
                value: sample.tx_bytes as f64,
                labels: labels.clone(),
            });
            if let Some(handshake) = sample.last_handshake_secs {
                points.push(MetricPoint {
                    name: PEER_LAST_HANDSHAKE_SECONDS,
                    value: handshake as f64,
                    labels: labels.clone(),
                });
            }
        }

        points
    }

    /// Number of peers with published series.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(id: &str) -> ClusterId {
        ClusterId::new(id).expect("valid id")
    }

    fn labels(id: &str) -> PeerLabels {
        PeerLabels {
            driver: "fake".to_string(),
            device: "fake0".to_string(),
            cluster_id: id.to_string(),
            cluster_name: format!("{id}-name"),
        }
    }

    #[test]
    fn publish_and_snapshot() {
        let registry = PeerMetricsRegistry::new();
        let id = cluster("a");
        registry.publish(
            &id,
            labels("a"),
            PeerMetricsSample::now(1000, 500, Some(1_700_000_000)),
        );

        let points = registry.snapshot();
        assert_eq!(points.len(), 3);

        let rx = points
            .iter()
            .find(|p| p.name == PEER_RECEIVE_BYTES_TOTAL)
            .expect("rx point");
        assert!((rx.value - 1000.0).abs() < f64::EPSILON);
        assert_eq!(rx.labels.cluster_id, "a");
    }

    #[test]
    fn missing_handshake_omits_gauge() {
        let registry = PeerMetricsRegistry::new();
        let id = cluster("a");
        registry.publish(&id, labels("a"), PeerMetricsSample::now(0, 0, None));

        let points = registry.snapshot();
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| p.name != PEER_LAST_HANDSHAKE_SECONDS));
    }

    #[test]
    fn publish_replaces_prior_sample() {
        let registry = PeerMetricsRegistry::new();
        let id = cluster("a");
        registry.publish(&id, labels("a"), PeerMetricsSample::now(10, 10, None));
        registry.publish(&id, labels("a"), PeerMetricsSample::now(20, 20, None));

        let latest = registry.latest(&id).expect("sample");
        assert_eq!(latest.rx_bytes, 20);
        assert_eq!(registry.peer_count(), 1);
    }

    #[test]
    fn remove_drops_series() {
        let registry = PeerMetricsRegistry::new();
        let id = cluster("a");
        registry.publish(&id, labels("a"), PeerMetricsSample::now(10, 10, None));

        registry.remove(&id);
        assert!(registry.latest(&id).is_none());
        assert!(registry.snapshot().is_empty());
    }
}
