//! The tunnel fabric: the set of active encrypted peer links.
//!
//! The fabric owns every live [`TunnelPeerConfig`] and is the only writer
//! of that set. Establishing a peer composes the address translation
//! manager and the tunnel driver; tearing one down unwinds both. Metrics
//! collection runs on its own tick, independent of lifecycle transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use fed_nat::NatAllocator;
use fed_tunnel::{
    AllowedRange, ClusterId, KeyPair, PeerMetricsSample, PublicKey, TunnelDriver, TunnelError,
    TunnelPeerConfig,
};

use crate::error::{FabricError, Result};
use crate::metrics::{PeerLabels, PeerMetricsRegistry};

/// The accepting side's half of a tunnel, returned by a successful
/// handshake. This is everything the fabric needs to complete
/// establishment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerTunnelHalf {
    /// The remote side's tunnel public key.
    pub public_key: PublicKey,
    /// The remote tunnel endpoint.
    pub endpoint: fed_tunnel::Endpoint,
    /// The pod/service ranges the remote cluster advertises.
    pub advertised_ranges: Vec<IpNet>,
}

/// Fabric configuration.
#[derive(Clone, Debug)]
pub struct FabricConfig {
    /// Keepalive interval applied to every peer link.
    pub keepalive_secs: u16,
    /// Upper bound on any single driver operation. Driver calls are local
    /// and normally fast, but kernel interface contention can hang them.
    pub driver_timeout: Duration,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: fed_tunnel::DEFAULT_KEEPALIVE_SECS,
            driver_timeout: Duration::from_secs(10),
        }
    }
}

impl FabricConfig {
    /// Sets the keepalive interval.
    #[must_use]
    pub fn with_keepalive(mut self, seconds: u16) -> Self {
        self.keepalive_secs = seconds;
        self
    }

    /// Sets the driver operation timeout.
    #[must_use]
    pub fn with_driver_timeout(mut self, timeout: Duration) -> Self {
        self.driver_timeout = timeout;
        self
    }
}

/// Internal state for one established peer.
#[derive(Clone, Debug)]
struct ActivePeer {
    config: TunnelPeerConfig,
    cluster_name: String,
}

/// Manager of all active encrypted peer links.
pub struct TunnelFabric<D: TunnelDriver> {
    driver: D,
    keypair: KeyPair,
    nat: NatAllocator,
    config: FabricConfig,
    peers: Arc<RwLock<HashMap<ClusterId, ActivePeer>>>,
    metrics: Arc<PeerMetricsRegistry>,
}

impl<D: TunnelDriver> TunnelFabric<D> {
    /// Creates a fabric over the given driver and translation allocator.
    #[must_use]
    pub fn new(driver: D, keypair: KeyPair, nat: NatAllocator, config: FabricConfig) -> Self {
        Self {
            driver,
            keypair,
            nat,
            config,
            peers: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(PeerMetricsRegistry::new()),
        }
    }

    /// The local tunnel public key, shared with remotes during handshakes.
    #[must_use]
    pub fn local_public_key(&self) -> PublicKey {
        *self.keypair.public_key()
    }

    /// The metrics registry the external collector snapshots.
    #[must_use]
    pub fn metrics_registry(&self) -> Arc<PeerMetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Reseeds the translation allocator from persisted mappings.
    pub fn restore_mappings(&self, mappings: impl IntoIterator<Item = fed_nat::AddressMapping>) {
        self.nat.restore(mappings);
    }

    /// Establishes (or refreshes) the encrypted link to a peer.
    ///
    /// Composition: allocate the address mapping, build the peer config
    /// from the mapping plus the remote half, then `ensure` on the driver.
    /// All-or-nothing: on failure no partial config or allocation is
    /// retained.
    ///
    /// # Errors
    ///
    /// Returns `TranslationFailed` if no mapping could be derived, or
    /// `DriverFailed` if the driver rejected the link.
    pub async fn establish(
        &self,
        cluster: &ClusterId,
        cluster_name: &str,
        half: &PeerTunnelHalf,
    ) -> Result<()> {
        let had_mapping = self.nat.mapping(cluster).is_some();

        let mapping = self
            .nat
            .allocate(cluster, &half.advertised_ranges)
            .map_err(FabricError::TranslationFailed)?;

        let allowed_ranges: Vec<AllowedRange> = mapping
            .translated_ranges()
            .into_iter()
            .map(AllowedRange::new)
            .collect();

        let peer_config = TunnelPeerConfig::new(
            cluster.clone(),
            self.keypair.private_key().clone(),
            half.public_key,
            half.endpoint.clone(),
        )
        .with_allowed_ranges(allowed_ranges)
        .with_keepalive(self.config.keepalive_secs);

        let ensure = timeout(self.config.driver_timeout, self.driver.ensure(&peer_config)).await;
        let outcome = match ensure {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(error)) => {
                self.unwind_allocation(cluster, had_mapping);
                return Err(FabricError::DriverFailed(error));
            }
            Err(_) => {
                self.unwind_allocation(cluster, had_mapping);
                return Err(FabricError::DriverFailed(TunnelError::Unreachable(
                    "driver ensure timed out".to_string(),
                )));
            }
        };

        self.peers.write().await.insert(
            cluster.clone(),
            ActivePeer {
                config: peer_config,
                cluster_name: cluster_name.to_string(),
            },
        );

        info!(
            cluster = %cluster,
            translated = !mapping.is_identity(),
            ?outcome,
            "established peer link"
        );
        Ok(())
    }

    /// Tears down the link to a peer.
    ///
    /// Idempotent: a missing link (including a double teardown) is success.
    /// The address mapping is released and the metric series dropped.
    ///
    /// # Errors
    ///
    /// Returns `DriverFailed` only on a transient driver failure, in which
    /// case fabric state is kept so a retry can finish the job.
    pub async fn teardown(&self, cluster: &ClusterId) -> Result<()> {
        let known = self.peers.read().await.contains_key(cluster);

        let removal = timeout(self.config.driver_timeout, self.driver.remove(cluster)).await;
        match removal {
            Ok(Ok(())) | Ok(Err(TunnelError::NotFound(_))) => {}
            Ok(Err(error)) => return Err(FabricError::DriverFailed(error)),
            Err(_) => {
                return Err(FabricError::DriverFailed(TunnelError::Unreachable(
                    "driver remove timed out".to_string(),
                )));
            }
        }

        self.nat.release(cluster);
        self.peers.write().await.remove(cluster);
        self.metrics.remove(cluster);

        if known {
            info!(cluster = %cluster, "tore down peer link");
        } else {
            debug!(cluster = %cluster, "teardown for unknown peer, nothing to do");
        }
        Ok(())
    }

    /// Reads the current traffic sample for a peer.
    ///
    /// # Errors
    ///
    /// Returns `NotEstablished` if the peer has no active link.
    pub async fn metrics(&self, cluster: &ClusterId) -> Result<PeerMetricsSample> {
        if !self.peers.read().await.contains_key(cluster) {
            return Err(FabricError::NotEstablished(cluster.to_string()));
        }

        self.driver.sample(cluster).await.map_err(|error| match error {
            TunnelError::NotFound(_) => FabricError::NotEstablished(cluster.to_string()),
            other => FabricError::DriverFailed(other),
        })
    }

    /// Samples every active peer and publishes to the metrics registry.
    ///
    /// This is the body of the periodic collection tick. Per-peer failures
    /// are logged and skipped; one bad link never blocks the others.
    pub async fn collect_all(&self) {
        let peers: Vec<(ClusterId, String)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(id, peer)| (id.clone(), peer.cluster_name.clone()))
            .collect();

        for (cluster, cluster_name) in peers {
            match self.driver.sample(&cluster).await {
                Ok(sample) => {
                    let labels = PeerLabels {
                        driver: self.driver.driver_name().to_string(),
                        device: self.driver.device_name().to_string(),
                        cluster_id: cluster.to_string(),
                        cluster_name,
                    };
                    self.metrics.publish(&cluster, labels, sample);
                }
                Err(error) => {
                    warn!(cluster = %cluster, %error, "failed to sample peer link");
                }
            }
        }
    }

    /// Runs the metrics collection loop until the task is dropped.
    ///
    /// Callers spawn this with a concrete driver type.
    pub async fn run_collector(&self, period: Duration) {
        let mut tick = tokio::time::interval(period);
        loop {
            tick.tick().await;
            self.collect_all().await;
        }
    }

    /// Returns whether a peer currently has a live link.
    ///
    /// Verified against the driver, not just the config set, so a link
    /// that vanished underneath the fabric reads as not established and
    /// the lifecycle can repair it.
    pub async fn is_established(&self, cluster: &ClusterId) -> bool {
        if !self.peers.read().await.contains_key(cluster) {
            return false;
        }
        match self.driver.sample(cluster).await {
            Ok(_) => true,
            Err(TunnelError::NotFound(_)) => false,
            // Driver outage: link state is unknown, keep the last answer
            // rather than triggering a rebuild.
            Err(_) => true,
        }
    }

    /// Returns the active config for a peer, if any.
    pub async fn peer_config(&self, cluster: &ClusterId) -> Option<TunnelPeerConfig> {
        self.peers
            .read()
            .await
            .get(cluster)
            .map(|peer| peer.config.clone())
    }

    /// Returns the clusters with active links.
    pub async fn active_peers(&self) -> Vec<ClusterId> {
        self.peers.read().await.keys().cloned().collect()
    }

    /// Drops the allocation made for a failed establish, but only if it was
    /// created by that attempt. A pre-existing mapping (re-establish after a
    /// config change) stays in place for the retry.
    fn unwind_allocation(&self, cluster: &ClusterId, had_mapping: bool) {
        if !had_mapping {
            self.nat.release(cluster);
        }
    }
}
