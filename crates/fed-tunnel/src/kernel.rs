//! Kernel WireGuard tunnel driver using the netlink API.
//!
//! Wraps `defguard_wireguard_rs` with the `Kernel` backend to implement
//! [`TunnelDriver`](crate::driver::TunnelDriver) against a real WireGuard
//! device. All peer links share one device; each peered cluster maps to
//! one WireGuard peer on it. Requires root.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use defguard_wireguard_rs::host::Peer as WgPeer;
use defguard_wireguard_rs::net::IpAddrMask;
use defguard_wireguard_rs::{InterfaceConfiguration, Kernel, WGApi, WireguardInterfaceApi};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::driver::{EnsureOutcome, TunnelDriver};
use crate::error::{Result, TunnelError};
use crate::keys::{PrivateKey, PublicKey};
use crate::types::{ClusterId, PeerMetricsSample, TunnelPeerConfig};

/// Driver name reported in metric labels.
const DRIVER_NAME: &str = "wireguard";

/// Converts a CIDR string to defguard's address form.
fn to_ip_addr_mask(cidr: &str) -> Result<IpAddrMask> {
    IpAddrMask::from_str(cidr).map_err(|e| TunnelError::InvalidCidr(format!("{cidr}: {e}")))
}

/// Converts a public key to defguard's key form.
fn to_wg_key(key: &PublicKey) -> Result<defguard_wireguard_rs::key::Key> {
    defguard_wireguard_rs::key::Key::try_from(key.as_bytes().as_slice())
        .map_err(|e| TunnelError::InvalidKey(format!("key conversion: {e}")))
}

/// Builds a defguard peer from a tunnel peer config.
fn build_wg_peer(config: &TunnelPeerConfig) -> Result<WgPeer> {
    let mut peer = WgPeer::new(to_wg_key(&config.remote_public_key)?);
    peer.endpoint = Some(*config.remote_endpoint.address());
    peer.persistent_keepalive_interval = Some(config.keepalive_secs);
    for range in &config.allowed_ranges {
        peer.allowed_ips.push(to_ip_addr_mask(&range.to_cidr())?);
    }
    Ok(peer)
}

/// Kernel-backed tunnel driver.
///
/// The device is created lazily on the first `ensure`. Every peer config
/// must carry the driver's own private key; the fabric guarantees this by
/// building all configs from its single key pair.
pub struct KernelTunnelDriver {
    device: String,
    listen_port: u16,
    local_key: PrivateKey,
    api: Arc<RwLock<Option<WGApi<Kernel>>>>,
    peers: Arc<RwLock<HashMap<ClusterId, TunnelPeerConfig>>>,
}

impl KernelTunnelDriver {
    /// Creates a kernel driver for the given device and local key.
    #[must_use]
    pub fn new(device: impl Into<String>, listen_port: u16, local_key: PrivateKey) -> Self {
        Self {
            device: device.into(),
            listen_port,
            local_key,
            api: Arc::new(RwLock::new(None)),
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates the WireGuard device if it does not exist yet.
    async fn ensure_device(&self) -> Result<()> {
        let mut api_slot = self.api.write().await;
        if api_slot.is_some() {
            return Ok(());
        }

        info!(device = %self.device, "creating WireGuard device");

        let api = WGApi::<Kernel>::new(self.device.clone())
            .map_err(|e| TunnelError::Unreachable(format!("WGApi::new: {e}")))?;
        api.create_interface()
            .map_err(|e| TunnelError::Unreachable(format!("create_interface: {e}")))?;

        let iface_config = InterfaceConfiguration {
            name: self.device.clone(),
            prvkey: self.local_key.to_base64(),
            addresses: Vec::new(),
            port: u32::from(self.listen_port),
            peers: Vec::new(),
            mtu: None,
        };
        api.configure_interface(&iface_config)
            .map_err(|e| TunnelError::Unreachable(format!("configure_interface: {e}")))?;

        *api_slot = Some(api);
        Ok(())
    }
}

impl TunnelDriver for KernelTunnelDriver {
    async fn ensure(&self, config: &TunnelPeerConfig) -> Result<EnsureOutcome> {
        config.validate()?;
        if config.local_private_key != self.local_key {
            return Err(TunnelError::InvalidConfig(format!(
                "peer config for {} does not use the device key",
                config.cluster
            )));
        }

        self.ensure_device().await?;

        let mut peers = self.peers.write().await;
        let previous = peers.get(&config.cluster).cloned();

        let outcome = match &previous {
            Some(existing) if *existing == *config => return Ok(EnsureOutcome::Unchanged),
            Some(existing) if existing.requires_rotation(config) => EnsureOutcome::Rotated,
            Some(_) => EnsureOutcome::Updated,
            None => EnsureOutcome::Created,
        };

        let api_slot = self.api.read().await;
        let api = api_slot
            .as_ref()
            .ok_or_else(|| TunnelError::Unreachable("device not initialized".to_string()))?;

        // A rotated remote key leaves a stale WireGuard peer behind; drop it
        // before configuring the replacement.
        if outcome == EnsureOutcome::Rotated {
            if let Some(existing) = &previous {
                if existing.remote_public_key != config.remote_public_key {
                    let old_key = to_wg_key(&existing.remote_public_key)?;
                    api.remove_peer(&old_key)
                        .map_err(|e| TunnelError::Unreachable(format!("remove_peer: {e}")))?;
                }
            }
        }

        let peer = build_wg_peer(config)?;
        api.configure_peer(&peer)
            .map_err(|e| TunnelError::Unreachable(format!("configure_peer: {e}")))?;
        api.configure_peer_routing(&[peer])
            .map_err(|e| TunnelError::Unreachable(format!("configure_peer_routing: {e}")))?;

        peers.insert(config.cluster.clone(), config.clone());
        debug!(cluster = %config.cluster, ?outcome, "ensured WireGuard peer");
        Ok(outcome)
    }

    async fn remove(&self, cluster: &ClusterId) -> Result<()> {
        let mut peers = self.peers.write().await;
        let config = peers
            .get(cluster)
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(cluster.to_string()))?;

        let api_slot = self.api.read().await;
        let api = api_slot
            .as_ref()
            .ok_or_else(|| TunnelError::NotFound(cluster.to_string()))?;

        // Drop the tracking entry only once the kernel peer is gone. A
        // transient netlink failure must leave the entry in place so a
        // retried remove still reaches the kernel peer instead of
        // reporting NotFound over a leaked link.
        let key = to_wg_key(&config.remote_public_key)?;
        api.remove_peer(&key)
            .map_err(|e| TunnelError::Unreachable(format!("remove_peer: {e}")))?;
        peers.remove(cluster);

        debug!(cluster = %cluster, "removed WireGuard peer");
        Ok(())
    }

    async fn sample(&self, cluster: &ClusterId) -> Result<PeerMetricsSample> {
        let peers = self.peers.read().await;
        let config = peers
            .get(cluster)
            .ok_or_else(|| TunnelError::NotFound(cluster.to_string()))?;

        let api_slot = self.api.read().await;
        let api = api_slot
            .as_ref()
            .ok_or_else(|| TunnelError::NotFound(cluster.to_string()))?;

        let host = api
            .read_interface_data()
            .map_err(|e| TunnelError::Unreachable(format!("read_interface_data: {e}")))?;

        let key = to_wg_key(&config.remote_public_key)?;
        let peer = host
            .peers
            .get(&key)
            .ok_or_else(|| TunnelError::NotFound(cluster.to_string()))?;

        let last_handshake = peer
            .last_handshake
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs()));

        Ok(PeerMetricsSample::now(
            peer.rx_bytes,
            peer.tx_bytes,
            last_handshake,
        ))
    }

    fn driver_name(&self) -> &str {
        DRIVER_NAME
    }

    fn device_name(&self) -> &str {
        &self.device
    }
}
