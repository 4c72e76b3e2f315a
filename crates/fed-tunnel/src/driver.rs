//! The tunnel driver contract and its in-memory test implementation.
//!
//! A driver owns the low-level secure-tunnel interface and host routing
//! table for peer links. It is the only component permitted to touch
//! network configuration; everything above it depends solely on this
//! contract and is polymorphic over the concrete transport.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::types::{ClusterId, PeerMetricsSample, TunnelPeerConfig};

/// What `ensure` did to the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A new link was created.
    Created,
    /// The link existed with an identical config; nothing was done.
    Unchanged,
    /// Allowed ranges or keepalive changed; applied in place.
    Updated,
    /// Endpoint or key changed; the link was re-created. Best-effort:
    /// a brief traffic interruption is acceptable.
    Rotated,
}

/// Driver for encrypted point-to-point peer links.
#[allow(async_fn_in_trait)]
pub trait TunnelDriver {
    /// Creates or updates the link described by `config`.
    ///
    /// Idempotent: calling twice with an unchanged config is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable` if the tunnel subsystem is unavailable, or
    /// `InvalidConfig` if the config is malformed.
    async fn ensure(&self, config: &TunnelPeerConfig) -> Result<EnsureOutcome>;

    /// Removes the link for `cluster`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no link exists.
    async fn remove(&self, cluster: &ClusterId) -> Result<()>;

    /// Reads the current traffic counters and handshake time for `cluster`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no link exists.
    async fn sample(&self, cluster: &ClusterId) -> Result<PeerMetricsSample>;

    /// The driver's name, used as a metric label.
    fn driver_name(&self) -> &str;

    /// The local device the driver operates on, used as a metric label.
    fn device_name(&self) -> &str;
}

/// Internal state for one fake link.
#[derive(Clone, Debug)]
struct FakeLink {
    config: TunnelPeerConfig,
    rx_bytes: u64,
    tx_bytes: u64,
    last_handshake_secs: Option<u64>,
}

/// An in-memory tunnel driver for tests.
///
/// Supports failure injection and traffic/handshake simulation so the
/// fabric and lifecycle layers can be exercised without host networking.
#[derive(Clone)]
pub struct FakeTunnelDriver {
    links: Arc<RwLock<HashMap<ClusterId, FakeLink>>>,
    unreachable: Arc<RwLock<bool>>,
    fail_next_ensure: Arc<RwLock<Option<TunnelError>>>,
}

impl FakeTunnelDriver {
    /// Creates a new fake driver with no links.
    #[must_use]
    pub fn new() -> Self {
        Self {
            links: Arc::new(RwLock::new(HashMap::new())),
            unreachable: Arc::new(RwLock::new(false)),
            fail_next_ensure: Arc::new(RwLock::new(None)),
        }
    }

    /// Makes every subsequent operation fail with `Unreachable`.
    pub async fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.write().await = unreachable;
    }

    /// Makes only the next `ensure` call fail with the given error.
    pub async fn fail_next_ensure(&self, error: TunnelError) {
        *self.fail_next_ensure.write().await = Some(error);
    }

    /// Adds received/transmitted bytes to a link's counters.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no link exists for the cluster.
    pub async fn simulate_traffic(
        &self,
        cluster: &ClusterId,
        rx_bytes: u64,
        tx_bytes: u64,
    ) -> Result<()> {
        let mut links = self.links.write().await;
        let link = links
            .get_mut(cluster)
            .ok_or_else(|| TunnelError::NotFound(cluster.to_string()))?;
        link.rx_bytes = link.rx_bytes.saturating_add(rx_bytes);
        link.tx_bytes = link.tx_bytes.saturating_add(tx_bytes);
        Ok(())
    }

    /// Records a successful handshake on a link.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no link exists for the cluster.
    pub async fn simulate_handshake(&self, cluster: &ClusterId, timestamp: u64) -> Result<()> {
        let mut links = self.links.write().await;
        let link = links
            .get_mut(cluster)
            .ok_or_else(|| TunnelError::NotFound(cluster.to_string()))?;
        link.last_handshake_secs = Some(timestamp);
        Ok(())
    }

    /// Returns the number of active links.
    pub async fn link_count(&self) -> usize {
        self.links.read().await.len()
    }

    /// Returns whether a link exists for the cluster.
    pub async fn has_link(&self, cluster: &ClusterId) -> bool {
        self.links.read().await.contains_key(cluster)
    }
}

impl Default for FakeTunnelDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelDriver for FakeTunnelDriver {
    async fn ensure(&self, config: &TunnelPeerConfig) -> Result<EnsureOutcome> {
        if *self.unreachable.read().await {
            return Err(TunnelError::Unreachable("fake driver offline".to_string()));
        }
        if let Some(error) = self.fail_next_ensure.write().await.take() {
            return Err(error);
        }

        config.validate()?;

        let mut links = self.links.write().await;
        let outcome = match links.get(&config.cluster) {
            Some(existing) if existing.config == *config => EnsureOutcome::Unchanged,
            Some(existing) if existing.config.requires_rotation(config) => {
                // Re-created link: counters reset.
                links.insert(
                    config.cluster.clone(),
                    FakeLink {
                        config: config.clone(),
                        rx_bytes: 0,
                        tx_bytes: 0,
                        last_handshake_secs: None,
                    },
                );
                EnsureOutcome::Rotated
            }
            Some(existing) => {
                let mut updated = existing.clone();
                updated.config = config.clone();
                links.insert(config.cluster.clone(), updated);
                EnsureOutcome::Updated
            }
            None => {
                links.insert(
                    config.cluster.clone(),
                    FakeLink {
                        config: config.clone(),
                        rx_bytes: 0,
                        tx_bytes: 0,
                        last_handshake_secs: None,
                    },
                );
                EnsureOutcome::Created
            }
        };

        debug!(cluster = %config.cluster, ?outcome, "ensured fake link");
        Ok(outcome)
    }

    async fn remove(&self, cluster: &ClusterId) -> Result<()> {
        if *self.unreachable.read().await {
            return Err(TunnelError::Unreachable("fake driver offline".to_string()));
        }

        let mut links = self.links.write().await;
        if links.remove(cluster).is_none() {
            return Err(TunnelError::NotFound(cluster.to_string()));
        }
        debug!(cluster = %cluster, "removed fake link");
        Ok(())
    }

    async fn sample(&self, cluster: &ClusterId) -> Result<PeerMetricsSample> {
        if *self.unreachable.read().await {
            return Err(TunnelError::Unreachable("fake driver offline".to_string()));
        }

        let links = self.links.read().await;
        let link = links
            .get(cluster)
            .ok_or_else(|| TunnelError::NotFound(cluster.to_string()))?;
        Ok(PeerMetricsSample::now(
            link.rx_bytes,
            link.tx_bytes,
            link.last_handshake_secs,
        ))
    }

    fn driver_name(&self) -> &str {
        "fake"
    }

    fn device_name(&self) -> &str {
        "fake0"
    }
}
