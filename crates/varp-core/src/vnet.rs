//! Virtual network registry
//!
//! A descriptor is the top-level object a control-plane caller creates
//! to bring a virtual network into existence: it fixes the device name,
//! whether tunnels to its members are secured, and the header overhead
//! the encapsulation chain costs against the MTU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::info;
use varp_crypto::constants::{CHACHA20_IV_SIZE, HMAC_ICV_SIZE, PAD_ALIGN};
use varp_wire::{encap, EncapMode, VnetId, ENVELOPE_SIZE, SECURE_HEADER_SIZE};

use crate::error::{CoreError, CoreResult};
use crate::tunnel::TunnelRegistry;
use crate::vif::VifTable;

/// Base MTU of the underlying physical network
pub const BASE_MTU: u32 = 1500;

/// One registered virtual network.
pub struct VnetDescriptor {
    vnet: VnetId,
    device: String,
    secured: bool,
    header_overhead: usize,
    mtu: u32,
    tx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    created_at: Instant,
}

impl VnetDescriptor {
    fn new(vnet: VnetId, device: String, secured: bool, mode: EncapMode) -> Self {
        let header_overhead = Self::overhead(secured, mode);
        Self {
            vnet,
            device,
            secured,
            header_overhead,
            mtu: BASE_MTU.saturating_sub(header_overhead as u32),
            tx_bytes: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            rx_packets: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    /// Worst-case per-frame encapsulation cost: envelope + plain header,
    /// plus the security framing (header, IV, padding trailer, ICV) on a
    /// secured vnet.
    fn overhead(secured: bool, mode: EncapMode) -> usize {
        let mut overhead = ENVELOPE_SIZE + encap::plain_header_size(mode);
        if secured {
            overhead += SECURE_HEADER_SIZE + CHACHA20_IV_SIZE + PAD_ALIGN + 2 + HMAC_ICV_SIZE;
        }
        overhead
    }

    /// The network's id
    pub fn vnet(&self) -> VnetId {
        self.vnet
    }

    /// Local device name
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Whether tunnels on this vnet carry the security stage
    pub fn is_secured(&self) -> bool {
        self.secured
    }

    /// Per-frame encapsulation overhead in bytes
    pub fn header_overhead(&self) -> usize {
        self.header_overhead
    }

    /// Usable MTU for frames on this vnet
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Record one transmitted frame
    pub fn record_tx(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one received frame
    pub fn record_rx(&self, bytes: usize) {
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// (tx_bytes, tx_packets, rx_bytes, rx_packets)
    pub fn counters(&self) -> (u64, u64, u64, u64) {
        (
            self.tx_bytes.load(Ordering::Relaxed),
            self.tx_packets.load(Ordering::Relaxed),
            self.rx_bytes.load(Ordering::Relaxed),
            self.rx_packets.load(Ordering::Relaxed),
        )
    }

    /// Time since creation
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

/// Registry of virtual networks.
pub struct VnetRegistry {
    vnets: RwLock<HashMap<VnetId, Arc<VnetDescriptor>>>,
    tunnels: Arc<TunnelRegistry>,
    vifs: Arc<VifTable>,
    mode: EncapMode,
}

impl VnetRegistry {
    /// Create a registry
    pub fn new(mode: EncapMode, tunnels: Arc<TunnelRegistry>, vifs: Arc<VifTable>) -> Self {
        Self {
            vnets: RwLock::new(HashMap::new()),
            tunnels,
            vifs,
            mode,
        }
    }

    /// Register a virtual network
    pub async fn create(
        &self,
        vnet: VnetId,
        device: &str,
        secured: bool,
    ) -> CoreResult<Arc<VnetDescriptor>> {
        let mut vnets = self.vnets.write().await;
        if vnets.contains_key(&vnet) {
            return Err(CoreError::VnetExists(vnet));
        }
        let descriptor = Arc::new(VnetDescriptor::new(
            vnet,
            device.to_string(),
            secured,
            self.mode,
        ));
        vnets.insert(vnet, descriptor.clone());
        info!(
            "created vnet {} (device {}, secured {}, mtu {})",
            vnet, device, secured, descriptor.mtu
        );
        Ok(descriptor)
    }

    /// Remove a virtual network along with its tunnels and local vifs
    pub async fn delete(&self, vnet: VnetId) -> CoreResult<()> {
        self.vnets
            .write()
            .await
            .remove(&vnet)
            .ok_or(CoreError::NotFound)?;
        let tunnels = self.tunnels.remove_vnet(vnet).await;
        let vifs = self.vifs.remove_vnet(vnet).await;
        info!("deleted vnet {} ({} tunnels, {} vifs)", vnet, tunnels, vifs);
        Ok(())
    }

    /// Look up a descriptor
    pub async fn get(&self, vnet: VnetId) -> Option<Arc<VnetDescriptor>> {
        self.vnets.read().await.get(&vnet).cloned()
    }

    /// All registered networks
    pub async fn list(&self) -> Vec<Arc<VnetDescriptor>> {
        self.vnets.read().await.values().cloned().collect()
    }

    /// Number of registered networks
    pub async fn len(&self) -> usize {
        self.vnets.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
