//! Tunnels and the tunnel registry
//!
//! A tunnel is the composed encapsulation chain for one (vnet,
//! destination) pair: the plain header stage, optionally wrapped by a
//! security stage, over the datagram transport. Chains are built once
//! and cached; the registry hands out shared references so a tunnel can
//! never be torn down under an in-flight send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use varp_wire::{
    encode_plain, CareOfAddress, EncapMode, Envelope, MessageKind, VnetId, ENVELOPE_SIZE,
    PROTO_ETHERIP, PROTO_SECURE,
};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult, SendError};
use crate::sa::{SaParams, SaTransforms, SecurityAssociation, SecurityAssociationTable};
use crate::transport::Transport;

/// Encapsulation stage chain of a tunnel. The plain header is always
/// applied first on send; a secured chain wraps it in the security
/// framing before the datagram goes out.
pub enum TunnelStage {
    /// Plain encapsulation over the raw transport
    Plain,
    /// Security stage wrapping the plain stage
    Secured(Arc<SecurityAssociation>),
}

/// One cached encapsulation chain for a (vnet, destination) pair.
pub struct Tunnel {
    vnet: VnetId,
    dst: CareOfAddress,
    mode: EncapMode,
    stage: TunnelStage,
    tx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    tx_failures: AtomicU64,
    created_at: Instant,
}

impl Tunnel {
    /// Virtual network carried by this tunnel
    pub fn vnet(&self) -> VnetId {
        self.vnet
    }

    /// Destination care-of address
    pub fn dst(&self) -> CareOfAddress {
        self.dst
    }

    /// Whether the chain includes a security stage
    pub fn is_secured(&self) -> bool {
        matches!(self.stage, TunnelStage::Secured(_))
    }

    /// The association backing the security stage, if any
    pub fn association(&self) -> Option<Arc<SecurityAssociation>> {
        match &self.stage {
            TunnelStage::Secured(sa) => Some(sa.clone()),
            TunnelStage::Plain => None,
        }
    }

    /// Payload bytes sent through this tunnel
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Frames sent through this tunnel
    pub fn tx_packets(&self) -> u64 {
        self.tx_packets.load(Ordering::Relaxed)
    }

    /// Sends that failed at the transport or security stage
    pub fn tx_failures(&self) -> u64 {
        self.tx_failures.load(Ordering::Relaxed)
    }

    /// Time since the tunnel was built
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Next-protocol number carried in the tunnel-data opcode
    fn next_proto(&self) -> u8 {
        match self.stage {
            TunnelStage::Plain => PROTO_ETHERIP,
            TunnelStage::Secured(_) => PROTO_SECURE,
        }
    }

    /// Run the chain over one Ethernet frame: plain header first, then
    /// the security stage if present.
    fn encode(&self, frame: &[u8]) -> CoreResult<Bytes> {
        let plain = encode_plain(self.mode, &self.vnet, frame);
        match &self.stage {
            TunnelStage::Plain => Ok(plain),
            TunnelStage::Secured(sa) => sa.protect(PROTO_ETHERIP, &plain),
        }
    }
}

/// Registry of tunnels keyed by (vnet, destination).
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<(VnetId, CareOfAddress), Arc<Tunnel>>>,
    transport: Arc<dyn Transport>,
    sas: Arc<SecurityAssociationTable>,
    config: CoreConfig,
}

impl TunnelRegistry {
    /// Create a registry
    pub fn new(
        config: CoreConfig,
        transport: Arc<dyn Transport>,
        sas: Arc<SecurityAssociationTable>,
    ) -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
            transport,
            sas,
            config,
        }
    }

    /// Look up a cached tunnel
    pub async fn lookup(&self, vnet: VnetId, dst: CareOfAddress) -> Option<Arc<Tunnel>> {
        self.tunnels.read().await.get(&(vnet, dst)).cloned()
    }

    /// Get or build the tunnel for (vnet, dst).
    ///
    /// Runs under the table write lock so two concurrent opens for the
    /// same key construct exactly one tunnel. A secured chain reuses a
    /// valid association for the destination or creates one from the
    /// configured pre-shared material.
    pub async fn open(
        &self,
        vnet: VnetId,
        dst: CareOfAddress,
        secured: bool,
    ) -> CoreResult<Arc<Tunnel>> {
        let mut tunnels = self.tunnels.write().await;
        if let Some(tunnel) = tunnels.get(&(vnet, dst)) {
            return Ok(tunnel.clone());
        }

        let stage = if secured {
            TunnelStage::Secured(self.obtain_association(dst).await?)
        } else {
            TunnelStage::Plain
        };

        let tunnel = Arc::new(Tunnel {
            vnet,
            dst,
            mode: self.config.encap_mode,
            stage,
            tx_bytes: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            tx_failures: AtomicU64::new(0),
            created_at: Instant::now(),
        });
        tunnels.insert((vnet, dst), tunnel.clone());
        info!(
            "opened {} tunnel to {} on {}",
            if secured { "secured" } else { "plain" },
            dst,
            vnet
        );
        Ok(tunnel)
    }

    async fn obtain_association(
        &self,
        dst: CareOfAddress,
    ) -> CoreResult<Arc<SecurityAssociation>> {
        if let Some(sa) = self.sas.find_valid(PROTO_SECURE, dst).await {
            return Ok(sa);
        }
        let defaults = match &self.config.sa_defaults {
            Some(defaults) => defaults,
            None => {
                warn!("no association and no pre-shared material for {}", dst);
                return Err(SendError::NoRoute.into());
            }
        };
        let sa = self
            .sas
            .create(SaParams {
                spi: 0,
                protocol: PROTO_SECURE,
                peer: dst,
                transforms: SaTransforms {
                    cipher: defaults.cipher.clone(),
                    cipher_key: defaults.cipher_key.clone(),
                    digest: defaults.digest.clone(),
                    digest_key: defaults.digest_key.clone(),
                    confidentiality: true,
                    authentication: true,
                },
                soft_limit: 0,
                hard_limit: 0,
                replay: self.config.replay_policy,
            })
            .await?;
        Ok(sa)
    }

    /// Send one frame, or a raw pre-encoded datagram when no tunnel is
    /// given.
    pub async fn send(
        &self,
        tunnel: Option<&Arc<Tunnel>>,
        dst: CareOfAddress,
        frame: &[u8],
    ) -> CoreResult<()> {
        let dst_sock = dst.to_socket_addr(self.config.udp_port);
        let tunnel = match tunnel {
            None => {
                // Raw path: the caller built the complete datagram
                self.transport
                    .send_datagram(frame, dst_sock)
                    .await
                    .map_err(CoreError::from)?;
                return Ok(());
            }
            Some(tunnel) => tunnel,
        };

        let result = async {
            let body = tunnel.encode(frame)?;
            let mut datagram = BytesMut::with_capacity(ENVELOPE_SIZE + body.len());
            Envelope {
                kind: MessageKind::Tunnel,
                opcode: tunnel.next_proto() as u16,
            }
            .write(&mut datagram);
            datagram.put_slice(&body);
            self.transport
                .send_datagram(&datagram, dst_sock)
                .await
                .map_err(CoreError::from)
        }
        .await;

        match result {
            Ok(()) => {
                tunnel.tx_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
                tunnel.tx_packets.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                tunnel.tx_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Remove one tunnel
    pub async fn remove(&self, vnet: VnetId, dst: CareOfAddress) -> CoreResult<()> {
        self.tunnels
            .write()
            .await
            .remove(&(vnet, dst))
            .map(|_| debug!("removed tunnel to {} on {}", dst, vnet))
            .ok_or(CoreError::NotFound)
    }

    /// Drop every tunnel of a vnet. Returns the number removed.
    pub async fn remove_vnet(&self, vnet: VnetId) -> usize {
        let mut tunnels = self.tunnels.write().await;
        let before = tunnels.len();
        tunnels.retain(|(v, _), _| *v != vnet);
        before - tunnels.len()
    }

    /// All cached tunnels
    pub async fn list(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.read().await.values().cloned().collect()
    }

    /// Number of cached tunnels
    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SaDefaults;
    use crate::transport::MemoryTransport;
    use std::net::Ipv4Addr;
    use varp_wire::{decode_plain, peek_spi};

    fn vnet(n: u32) -> VnetId {
        VnetId::from_u32(n)
    }

    fn dst(last: u8) -> CareOfAddress {
        CareOfAddress::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn defaults() -> SaDefaults {
        SaDefaults {
            cipher: "chacha20".into(),
            cipher_key: vec![0x11; 32],
            digest: "hmac-sha256".into(),
            digest_key: vec![0x22; 32],
        }
    }

    fn registry(
        sa_defaults: Option<SaDefaults>,
    ) -> (TunnelRegistry, Arc<MemoryTransport>, Arc<SecurityAssociationTable>) {
        let config = CoreConfig {
            sa_defaults,
            ..Default::default()
        };
        let transport = Arc::new(MemoryTransport::new("10.0.0.1:1798".parse().unwrap()));
        let sas = Arc::new(SecurityAssociationTable::new());
        (
            TunnelRegistry::new(config, transport.clone(), sas.clone()),
            transport,
            sas,
        )
    }

    #[tokio::test]
    async fn test_concurrent_open_constructs_once() {
        let (registry, _, _) = registry(None);
        let (a, b) = tokio::join!(
            registry.open(vnet(1), dst(5), false),
            registry.open(vnet(1), dst(5), false),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_open_returns_cached_tunnel() {
        let (registry, _, _) = registry(None);
        let first = registry.open(vnet(1), dst(5), false).await.unwrap();
        let second = registry.open(vnet(1), dst(5), false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(
            &first,
            &registry.lookup(vnet(1), dst(5)).await.unwrap()
        ));
    }

    #[tokio::test]
    async fn test_plain_send_wire_layout() {
        let (registry, transport, _) = registry(None);
        let tunnel = registry.open(vnet(7), dst(5), false).await.unwrap();

        let frame = b"\x02\x00\x00\x00\x00\x01\x02\x00\x00\x00\x00\x02\x08\x00payload";
        registry.send(Some(&tunnel), dst(5), frame).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, dst(5).to_socket_addr(1798));

        let (envelope, body) = Envelope::read(&sent[0].0).unwrap();
        assert_eq!(envelope.kind, MessageKind::Tunnel);
        assert_eq!(envelope.opcode, PROTO_ETHERIP as u16);

        let (v, payload) = decode_plain(EncapMode::Extended, body).unwrap();
        assert_eq!(v, vnet(7));
        assert_eq!(payload, frame);
        assert_eq!(tunnel.tx_packets(), 1);
        assert_eq!(tunnel.tx_bytes(), frame.len() as u64);
    }

    #[tokio::test]
    async fn test_secured_send_unwraps_to_frame() {
        let (registry, transport, sas) = registry(Some(defaults()));
        let tunnel = registry.open(vnet(7), dst(5), true).await.unwrap();
        let sa = tunnel.association().unwrap();

        let frame = b"secured inner frame bytes";
        registry.send(Some(&tunnel), dst(5), frame).await.unwrap();

        let sent = transport.sent();
        let (envelope, body) = Envelope::read(&sent[0].0).unwrap();
        assert_eq!(envelope.opcode, PROTO_SECURE as u16);

        let (spi, seq) = peek_spi(body).unwrap();
        assert_eq!(spi, sa.spi());
        assert_eq!(seq, 1);

        let found = sas.lookup_by_spi(spi, PROTO_SECURE, dst(5)).await.unwrap();
        let packet = found.unprotect(body).await.unwrap();
        assert_eq!(packet.next_proto, PROTO_ETHERIP);
        let (v, payload) = decode_plain(EncapMode::Extended, &packet.payload).unwrap();
        assert_eq!(v, vnet(7));
        assert_eq!(payload, frame);
    }

    #[tokio::test]
    async fn test_secured_open_reuses_installed_association() {
        let (registry, _, sas) = registry(None);
        let installed = sas
            .create(SaParams {
                spi: 0,
                protocol: PROTO_SECURE,
                peer: dst(5),
                transforms: SaTransforms {
                    cipher: "chacha20".into(),
                    cipher_key: vec![0x33; 32],
                    digest: "hmac-sha256".into(),
                    digest_key: vec![0x44; 32],
                    confidentiality: true,
                    authentication: true,
                },
                soft_limit: 0,
                hard_limit: 0,
                replay: crate::sa::ReplayPolicy::Off,
            })
            .await
            .unwrap();

        let tunnel = registry.open(vnet(1), dst(5), true).await.unwrap();
        assert!(Arc::ptr_eq(&tunnel.association().unwrap(), &installed));
    }

    #[tokio::test]
    async fn test_secured_open_without_material_fails() {
        let (registry, _, _) = registry(None);
        let result = registry.open(vnet(1), dst(5), true).await;
        assert!(matches!(result, Err(CoreError::Send(SendError::NoRoute))));
    }

    #[tokio::test]
    async fn test_send_failure_counted_separately() {
        let (registry, transport, _) = registry(None);
        let tunnel = registry.open(vnet(1), dst(9), false).await.unwrap();
        transport.fail_destination(dst(9).to_socket_addr(1798));

        assert!(registry.send(Some(&tunnel), dst(9), b"frame").await.is_err());
        assert_eq!(tunnel.tx_failures(), 1);
        assert_eq!(tunnel.tx_packets(), 0);
    }

    #[tokio::test]
    async fn test_send_without_tunnel_is_raw() {
        let (registry, transport, _) = registry(None);
        registry.send(None, dst(5), b"raw datagram").await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent[0].0, b"raw datagram");
    }

    #[tokio::test]
    async fn test_remove_vnet_drops_only_that_vnet() {
        let (registry, _, _) = registry(None);
        registry.open(vnet(1), dst(5), false).await.unwrap();
        registry.open(vnet(1), dst(6), false).await.unwrap();
        registry.open(vnet(2), dst(5), false).await.unwrap();

        assert_eq!(registry.remove_vnet(vnet(1)).await, 2);
        assert_eq!(registry.len().await, 1);
        assert!(registry.lookup(vnet(2), dst(5)).await.is_some());
    }
}
