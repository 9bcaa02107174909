//! Node wiring and datagram dispatch
//!
//! `VarpNode` composes the tables into one running node: outbound
//! frames enter through `send_frame`, inbound datagrams through
//! `handle_datagram`, and background tasks drive the receive loop and
//! the periodic sweeps. Malformed inbound data is dropped and counted,
//! never fatal.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use varp_wire::{
    decode_plain, encode_plain, ether_dst, ether_src, peek_spi, CareOfAddress, Envelope,
    FormatError, MessageKind, VarpMessage, VarpOp, VnetId, Vmac, ENVELOPE_SIZE, PROTO_ETHERIP,
    PROTO_SECURE,
};

use crate::cache::{AddressCache, CacheStats, EntrySnapshot, Forwarder};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::peers::{Peer, PeerRegistry};
use crate::sa::{SaParams, SecurityAssociation, SecurityAssociationTable};
use crate::transport::{FrameSink, Transport, MAX_DATAGRAM_SIZE};
use crate::tunnel::{Tunnel, TunnelRegistry};
use crate::vif::{VifEntry, VifTable};
use crate::vnet::{VnetDescriptor, VnetRegistry};

/// Node-level receive counters
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub rx_datagrams: u64,
    pub rx_dropped: u64,
}

#[derive(Default)]
struct StatsInner {
    rx_datagrams: AtomicU64,
    rx_dropped: AtomicU64,
}

/// Cache side effects, backed by the tunnel registry and peer overlay.
struct NodeForwarder {
    config: CoreConfig,
    transport: Arc<dyn Transport>,
    peers: Arc<PeerRegistry>,
    tunnels: Arc<TunnelRegistry>,
    vnets: Arc<VnetRegistry>,
}

impl NodeForwarder {
    fn local_care_of(&self) -> CareOfAddress {
        CareOfAddress::from(self.transport.local_addr().ip())
    }

    /// Best-effort broadcast of a complete datagram: the multicast
    /// group when configured, plus the unicast peer overlay.
    async fn broadcast(&self, datagram: &[u8]) {
        if let Some(group) = self.config.multicast_addr {
            if let Err(e) = self.transport.send_datagram(datagram, group).await {
                warn!("multicast send to {} failed: {}", group, e);
            }
        }
        self.peers.forward(datagram).await;
    }

    fn tunnel_datagram(&self, vnet: VnetId, frame: &[u8]) -> Bytes {
        let body = encode_plain(self.config.encap_mode, &vnet, frame);
        let mut datagram = BytesMut::with_capacity(ENVELOPE_SIZE + body.len());
        Envelope::new(MessageKind::Tunnel, PROTO_ETHERIP as u16).write(&mut datagram);
        datagram.put_slice(&body);
        datagram.freeze()
    }
}

#[async_trait]
impl Forwarder for NodeForwarder {
    async fn send_unicast(
        &self,
        vnet: VnetId,
        care_of: CareOfAddress,
        frame: Bytes,
    ) -> CoreResult<()> {
        let descriptor = self.vnets.get(vnet).await;
        let secured = descriptor.as_ref().map(|d| d.is_secured()).unwrap_or(false);
        let tunnel = self.tunnels.open(vnet, care_of, secured).await?;
        self.tunnels.send(Some(&tunnel), care_of, &frame).await?;
        if let Some(descriptor) = descriptor {
            descriptor.record_tx(frame.len());
        }
        Ok(())
    }

    async fn flood(&self, vnet: VnetId, frame: Bytes) -> CoreResult<()> {
        let datagram = self.tunnel_datagram(vnet, &frame);
        self.broadcast(&datagram).await;
        if let Some(descriptor) = self.vnets.get(vnet).await {
            descriptor.record_tx(frame.len());
        }
        Ok(())
    }

    async fn send_probe(&self, vnet: VnetId, vmac: Vmac) -> CoreResult<()> {
        let request = VarpMessage::request(vnet, vmac, self.local_care_of());
        self.broadcast(&request.encode()).await;
        Ok(())
    }
}

/// A running VARP node.
pub struct VarpNode {
    config: CoreConfig,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn FrameSink>,
    vifs: Arc<VifTable>,
    peers: Arc<PeerRegistry>,
    sas: Arc<SecurityAssociationTable>,
    tunnels: Arc<TunnelRegistry>,
    vnets: Arc<VnetRegistry>,
    cache: Arc<AddressCache>,
    stats: StatsInner,
    stop: AtomicBool,
    stopped: Notify,
}

impl VarpNode {
    /// Build a node over the given transport and local delivery sink.
    pub fn new(
        config: CoreConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn FrameSink>,
    ) -> CoreResult<Arc<Self>> {
        config.validate().map_err(CoreError::Config)?;

        let vifs = Arc::new(VifTable::new());
        let peers = Arc::new(PeerRegistry::new(transport.clone()));
        let sas = Arc::new(SecurityAssociationTable::new());
        let tunnels = Arc::new(TunnelRegistry::new(
            config.clone(),
            transport.clone(),
            sas.clone(),
        ));
        let vnets = Arc::new(VnetRegistry::new(
            config.encap_mode,
            tunnels.clone(),
            vifs.clone(),
        ));
        let forwarder = Arc::new(NodeForwarder {
            config: config.clone(),
            transport: transport.clone(),
            peers: peers.clone(),
            tunnels: tunnels.clone(),
            vnets: vnets.clone(),
        });
        let cache = Arc::new(AddressCache::new(config.clone(), vifs.clone(), forwarder));

        Ok(Arc::new(Self {
            config,
            transport,
            sink,
            vifs,
            peers,
            sas,
            tunnels,
            vnets,
            cache,
            stats: StatsInner::default(),
            stop: AtomicBool::new(false),
            stopped: Notify::new(),
        }))
    }

    /// Spawn the receive loop and the periodic maintenance task.
    pub fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                if node.stop.load(Ordering::Relaxed) {
                    break;
                }
                tokio::select! {
                    _ = node.stopped.notified() => break,
                    received = node.transport.recv_datagram(&mut buf) => match received {
                        Ok((len, from)) => {
                            if let Err(e) = node.handle_datagram(from, &buf[..len]).await {
                                node.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
                                debug!("dropped datagram from {}: {}", from, e);
                            }
                        }
                        Err(e) => {
                            if node.stop.load(Ordering::Relaxed) {
                                break;
                            }
                            warn!("receive failed: {}", e);
                        }
                    }
                }
            }
            debug!("receive loop stopped");
        });

        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = node.stopped.notified() => break,
                    _ = ticker.tick() => {
                        if node.stop.load(Ordering::Relaxed) {
                            break;
                        }
                        let now = Instant::now();
                        node.cache.sweep(now).await;
                        node.vifs.sweep(now, node.config.vif_ttl).await;
                    }
                }
            }
            debug!("maintenance loop stopped");
        });
        info!("node started on {}", self.transport.local_addr());
    }

    /// Stop the background tasks.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.stopped.notify_waiters();
        info!("node shutting down");
    }

    fn local_care_of(&self) -> CareOfAddress {
        CareOfAddress::from(self.transport.local_addr().ip())
    }

    /// Route one outbound Ethernet frame from a local interface.
    ///
    /// The source MAC is learned as a local vif so the node can answer
    /// resolution requests for it.
    pub async fn send_frame(&self, vnet: VnetId, frame: Bytes) -> CoreResult<()> {
        self.vnets.get(vnet).await.ok_or(CoreError::NotFound)?;
        let dst = ether_dst(&frame)?;
        let src = ether_src(&frame)?;

        if !src.is_multicast() {
            self.vifs.register(vnet, src, false).await;
        }

        let entry = self.cache.lookup_or_create(vnet, dst).await;
        self.cache.output(&entry, frame).await
    }

    /// Dispatch one inbound datagram.
    pub async fn handle_datagram(&self, from: SocketAddr, data: &[u8]) -> CoreResult<()> {
        self.stats.rx_datagrams.fetch_add(1, Ordering::Relaxed);
        let (envelope, body) = Envelope::read(data)?;
        self.dispatch(from, envelope, body).await
    }

    async fn dispatch(&self, from: SocketAddr, envelope: Envelope, body: &[u8]) -> CoreResult<()> {
        match envelope.kind {
            MessageKind::Varp => self.handle_varp(envelope.opcode, body).await,
            MessageKind::Tunnel => self.handle_tunnel(from, envelope.opcode, body).await,
            MessageKind::Forward => {
                let inner = self
                    .peers
                    .receive(CareOfAddress::from(from.ip()), body)
                    .await
                    .ok_or(CoreError::NotFound)?;
                let (inner_envelope, inner_body) = Envelope::read(&inner)?;
                match inner_envelope.kind {
                    MessageKind::Varp => self.handle_varp(inner_envelope.opcode, inner_body).await,
                    MessageKind::Tunnel => {
                        self.handle_tunnel(from, inner_envelope.opcode, inner_body).await
                    }
                    MessageKind::Forward => {
                        // One hop only
                        warn!("dropping nested forward envelope from {}", from);
                        Ok(())
                    }
                }
            }
        }
    }

    async fn handle_varp(&self, opcode: u16, body: &[u8]) -> CoreResult<()> {
        let message = VarpMessage::decode(opcode, body)?;
        match message.op {
            VarpOp::Request => {
                let reply = self
                    .cache
                    .handle_request(message.vnet, message.vmac, self.local_care_of())
                    .await;
                if let Some(reply) = reply {
                    let dst = message.care_of.to_socket_addr(self.config.udp_port);
                    self.transport
                        .send_datagram(&reply.encode(), dst)
                        .await
                        .map_err(CoreError::from)?;
                }
                Ok(())
            }
            VarpOp::Announce => {
                self.cache
                    .handle_announce(message.vnet, message.vmac, message.care_of)
                    .await
            }
        }
    }

    async fn handle_tunnel(&self, from: SocketAddr, opcode: u16, body: &[u8]) -> CoreResult<()> {
        if opcode == PROTO_ETHERIP as u16 {
            let (vnet, frame) = decode_plain(self.config.encap_mode, body)?;
            return self.deliver(vnet, frame).await;
        }
        if opcode == PROTO_SECURE as u16 {
            let from_care = CareOfAddress::from(from.ip());
            let (spi, _) = peek_spi(body)?;
            let sa = self
                .sas
                .lookup_by_spi(spi, PROTO_SECURE, from_care)
                .await
                .ok_or(CoreError::NotFound)?;
            let packet = sa.unprotect(body).await?;
            if packet.next_proto != PROTO_ETHERIP {
                return Err(FormatError::UnknownOpcode(packet.next_proto as u16).into());
            }
            let (vnet, frame) = decode_plain(self.config.encap_mode, &packet.payload)?;
            return self.deliver(vnet, frame).await;
        }
        Err(FormatError::UnknownOpcode(opcode).into())
    }

    /// Hand one decoded frame to the local interface.
    async fn deliver(&self, vnet: VnetId, frame: &[u8]) -> CoreResult<()> {
        let descriptor = self.vnets.get(vnet).await.ok_or(CoreError::NotFound)?;
        descriptor.record_rx(frame.len());
        self.sink.deliver(vnet, Bytes::copy_from_slice(frame)).await;
        Ok(())
    }

    // --- control plane ---

    /// Register a virtual network
    pub async fn create_vnet(
        &self,
        vnet: VnetId,
        device: &str,
        secured: bool,
    ) -> CoreResult<Arc<VnetDescriptor>> {
        self.vnets.create(vnet, device, secured).await
    }

    /// Remove a virtual network, its tunnels, and its local vifs
    pub async fn delete_vnet(&self, vnet: VnetId) -> CoreResult<()> {
        self.vnets.delete(vnet).await
    }

    /// Register a persistent local vif
    pub async fn add_vif(&self, vnet: VnetId, vmac: Vmac) -> Arc<VifEntry> {
        self.vifs.register(vnet, vmac, true).await
    }

    /// Remove a local vif
    pub async fn remove_vif(&self, vnet: VnetId, vmac: Vmac) -> CoreResult<()> {
        self.vifs.unregister(vnet, vmac).await
    }

    /// Add an overlay peer
    pub async fn add_peer(&self, addr: CareOfAddress, port: u16) -> Arc<Peer> {
        self.peers.add(addr, port).await
    }

    /// Remove an overlay peer
    pub async fn remove_peer(&self, addr: CareOfAddress) -> CoreResult<()> {
        self.peers.remove(addr).await
    }

    /// Pin a (vnet, vmac) to a fixed care-of address
    pub async fn add_static_entry(
        &self,
        vnet: VnetId,
        vmac: Vmac,
        care_of: CareOfAddress,
    ) {
        let entry = self.cache.lookup_or_create(vnet, vmac).await;
        entry.set_permanent(care_of).await;
    }

    /// Remove one cache entry
    pub async fn remove_cache_entry(&self, vnet: VnetId, vmac: Vmac) -> CoreResult<()> {
        self.cache.remove(vnet, vmac).await
    }

    /// Administrative cache reset; returns entries removed
    pub async fn flush_cache(&self) -> usize {
        self.cache.flush().await
    }

    /// Install a security association
    pub async fn install_sa(&self, params: SaParams) -> CoreResult<Arc<SecurityAssociation>> {
        self.sas.create(params).await
    }

    /// Create an acquire placeholder association
    pub async fn acquire_sa(
        &self,
        protocol: u8,
        peer: CareOfAddress,
    ) -> Arc<SecurityAssociation> {
        self.sas.acquire(protocol, peer).await
    }

    /// Key an acquire placeholder
    pub async fn replace_sa(
        &self,
        id: u64,
        params: SaParams,
    ) -> CoreResult<Arc<SecurityAssociation>> {
        self.sas.replace(id, params).await
    }

    /// Delete an association by id
    pub async fn delete_sa(&self, id: u64) -> CoreResult<()> {
        self.sas.delete(id).await
    }

    /// Cache entry snapshots
    pub async fn list_cache(&self) -> Vec<EntrySnapshot> {
        self.cache.list().await
    }

    /// Registered virtual networks
    pub async fn list_vnets(&self) -> Vec<Arc<VnetDescriptor>> {
        self.vnets.list().await
    }

    /// Configured peers
    pub async fn list_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.list().await
    }

    /// Cached tunnels
    pub async fn list_tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.list().await
    }

    /// Installed associations
    pub async fn list_sas(&self) -> Vec<Arc<SecurityAssociation>> {
        self.sas.list().await
    }

    /// Resolution cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Receive counters
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            rx_datagrams: self.stats.rx_datagrams.load(Ordering::Relaxed),
            rx_dropped: self.stats.rx_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntryState;
    use crate::config::SaDefaults;
    use crate::sa::{ReplayPolicy, SaTransforms};
    use crate::transport::{ChannelSink, MemoryTransport};
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;
    use varp_wire::{encode_forward, EncapMode};

    fn vnet() -> VnetId {
        VnetId::from_u32(42)
    }

    fn vmac(last: u8) -> Vmac {
        Vmac::from_bytes([2, 0, 0, 0, 0, last])
    }

    fn care(last: u8) -> CareOfAddress {
        CareOfAddress::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn sock(last: u8) -> SocketAddr {
        care(last).to_socket_addr(1798)
    }

    fn frame(dst: Vmac, src: Vmac, tag: u8) -> Bytes {
        let mut f = Vec::with_capacity(20);
        f.extend_from_slice(dst.as_bytes());
        f.extend_from_slice(src.as_bytes());
        f.extend_from_slice(&[0x08, 0x00]);
        f.extend_from_slice(&[tag; 6]);
        Bytes::from(f)
    }

    fn node() -> (
        Arc<VarpNode>,
        Arc<MemoryTransport>,
        mpsc::UnboundedReceiver<(VnetId, Bytes)>,
    ) {
        let transport = Arc::new(MemoryTransport::new(sock(1)));
        let (sink, rx) = ChannelSink::new();
        let node = VarpNode::new(CoreConfig::default(), transport.clone(), sink).unwrap();
        (node, transport, rx)
    }

    fn varp_sends(transport: &MemoryTransport) -> Vec<(VarpMessage, SocketAddr)> {
        transport
            .sent()
            .into_iter()
            .filter_map(|(data, dst)| {
                let (envelope, body) = Envelope::read(&data).ok()?;
                if envelope.kind != MessageKind::Varp {
                    return None;
                }
                Some((VarpMessage::decode(envelope.opcode, body).ok()?, dst))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_request_for_local_vif_answered() {
        let (node, transport, _rx) = node();
        node.create_vnet(vnet(), "varp0", false).await.unwrap();
        node.add_vif(vnet(), vmac(7)).await;

        let request = VarpMessage::request(vnet(), vmac(7), care(2));
        node.handle_datagram(sock(2), &request.encode()).await.unwrap();

        let sends = varp_sends(&transport);
        assert_eq!(sends.len(), 1);
        let (reply, dst) = &sends[0];
        assert_eq!(*dst, sock(2));
        assert_eq!(reply.op, VarpOp::Announce);
        assert_eq!(reply.vmac, vmac(7));
        assert_eq!(reply.care_of, care(1));
    }

    #[tokio::test]
    async fn test_request_for_foreign_vmac_ignored() {
        let (node, transport, _rx) = node();
        node.create_vnet(vnet(), "varp0", false).await.unwrap();

        let request = VarpMessage::request(vnet(), vmac(9), care(2));
        node.handle_datagram(sock(2), &request.encode()).await.unwrap();
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_then_drain_over_tunnel() {
        let (node, transport, _rx) = node();
        node.create_vnet(vnet(), "varp0", false).await.unwrap();

        // Unresolved unicast destination: frame queues, probe goes out
        node.send_frame(vnet(), frame(vmac(9), vmac(1), 0xaa))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let probes = varp_sends(&transport);
        assert!(probes.iter().any(|(m, _)| m.op == VarpOp::Request && m.vmac == vmac(9)));
        transport.clear_sent();

        // Announce arrives: queue drains through a plain tunnel
        let announce = VarpMessage::announce(vnet(), vmac(9), care(5));
        node.handle_datagram(sock(5), &announce.encode()).await.unwrap();

        let sent = transport.sent();
        let (data, dst) = &sent[0];
        assert_eq!(*dst, sock(5));
        let (envelope, body) = Envelope::read(data).unwrap();
        assert_eq!(envelope.kind, MessageKind::Tunnel);
        assert_eq!(envelope.opcode, PROTO_ETHERIP as u16);
        let (v, payload) = decode_plain(EncapMode::Extended, body).unwrap();
        assert_eq!(v, vnet());
        assert_eq!(payload[14], 0xaa);
    }

    #[tokio::test]
    async fn test_broadcast_frame_floods_overlay() {
        let (node, transport, _rx) = node();
        node.create_vnet(vnet(), "varp0", false).await.unwrap();
        node.add_peer(care(20), 1798).await;

        let broadcast = Vmac::from_bytes([0xff; 6]);
        node.send_frame(vnet(), frame(broadcast, vmac(1), 0x55))
            .await
            .unwrap();

        let sent = transport.sent();
        let multicast = CoreConfig::default().multicast_addr.unwrap();
        assert!(sent.iter().any(|(_, dst)| *dst == multicast));

        let to_peer = sent.iter().find(|(_, dst)| *dst == sock(20)).unwrap();
        let (envelope, _) = Envelope::read(&to_peer.0).unwrap();
        assert_eq!(envelope.kind, MessageKind::Forward);
    }

    #[tokio::test]
    async fn test_inbound_plain_delivered_to_sink() {
        let (node, _, mut rx) = node();
        node.create_vnet(vnet(), "varp0", false).await.unwrap();

        let payload = frame(vmac(1), vmac(2), 0x33);
        let body = encode_plain(EncapMode::Extended, &vnet(), &payload);
        let mut datagram = BytesMut::new();
        Envelope::new(MessageKind::Tunnel, PROTO_ETHERIP as u16).write(&mut datagram);
        datagram.put_slice(&body);

        node.handle_datagram(sock(5), &datagram).await.unwrap();

        let (v, delivered) = rx.recv().await.unwrap();
        assert_eq!(v, vnet());
        assert_eq!(delivered, payload);

        let (_, _, rx_bytes, rx_packets) = node.list_vnets().await[0].counters();
        assert_eq!((rx_bytes, rx_packets), (payload.len() as u64, 1));
    }

    #[tokio::test]
    async fn test_inbound_unknown_vnet_dropped() {
        let (node, _, mut rx) = node();

        let body = encode_plain(EncapMode::Extended, &vnet(), b"frame");
        let mut datagram = BytesMut::new();
        Envelope::new(MessageKind::Tunnel, PROTO_ETHERIP as u16).write(&mut datagram);
        datagram.put_slice(&body);

        assert!(node.handle_datagram(sock(5), &datagram).await.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_inbound_secured_delivered() {
        let (node, _, mut rx) = node();
        node.create_vnet(vnet(), "varp0", true).await.unwrap();

        let sa = node
            .install_sa(SaParams {
                spi: 0,
                protocol: PROTO_SECURE,
                peer: care(5),
                transforms: SaTransforms {
                    cipher: "chacha20".into(),
                    cipher_key: vec![0x51; 32],
                    digest: "hmac-sha256".into(),
                    digest_key: vec![0x52; 32],
                    confidentiality: true,
                    authentication: true,
                },
                soft_limit: 0,
                hard_limit: 0,
                replay: ReplayPolicy::Off,
            })
            .await
            .unwrap();

        let payload = frame(vmac(1), vmac(2), 0x77);
        let inner = encode_plain(EncapMode::Extended, &vnet(), &payload);
        let protected = sa.protect(PROTO_ETHERIP, &inner).unwrap();
        let mut datagram = BytesMut::new();
        Envelope::new(MessageKind::Tunnel, PROTO_SECURE as u16).write(&mut datagram);
        datagram.put_slice(&protected);

        node.handle_datagram(sock(5), &datagram).await.unwrap();
        let (v, delivered) = rx.recv().await.unwrap();
        assert_eq!(v, vnet());
        assert_eq!(delivered, payload);
    }

    #[tokio::test]
    async fn test_secured_send_round_trip_between_nodes() {
        // Node A sends over a secured vnet; node B holds the same keys
        // and decodes what A's transport emitted.
        let transport_a = Arc::new(MemoryTransport::new(sock(1)));
        let (sink_a, _rx_a) = ChannelSink::new();
        let config_a = CoreConfig {
            sa_defaults: Some(SaDefaults {
                cipher: "chacha20".into(),
                cipher_key: vec![0x61; 32],
                digest: "hmac-sha256".into(),
                digest_key: vec![0x62; 32],
            }),
            ..Default::default()
        };
        let node_a = VarpNode::new(config_a, transport_a.clone(), sink_a).unwrap();
        node_a.create_vnet(vnet(), "varp0", true).await.unwrap();
        node_a.add_static_entry(vnet(), vmac(9), care(2)).await;

        let transport_b = Arc::new(MemoryTransport::new(sock(2)));
        let (sink_b, mut rx_b) = ChannelSink::new();
        let node_b = VarpNode::new(CoreConfig::default(), transport_b, sink_b).unwrap();
        node_b.create_vnet(vnet(), "varp0", true).await.unwrap();

        let payload = frame(vmac(9), vmac(1), 0x99);
        node_a.send_frame(vnet(), payload.clone()).await.unwrap();

        // B installs the association under the SPI A derived, keyed to
        // A's address, then receives A's datagram.
        let spi = node_a.list_sas().await[0].spi();
        node_b
            .install_sa(SaParams {
                spi,
                protocol: PROTO_SECURE,
                peer: care(1),
                transforms: SaTransforms {
                    cipher: "chacha20".into(),
                    cipher_key: vec![0x61; 32],
                    digest: "hmac-sha256".into(),
                    digest_key: vec![0x62; 32],
                    confidentiality: true,
                    authentication: true,
                },
                soft_limit: 0,
                hard_limit: 0,
                replay: ReplayPolicy::Window(32),
            })
            .await
            .unwrap();

        let (data, dst) = transport_a.sent().pop().unwrap();
        assert_eq!(dst, sock(2));
        node_b.handle_datagram(sock(1), &data).await.unwrap();

        let (v, delivered) = rx_b.recv().await.unwrap();
        assert_eq!(v, vnet());
        assert_eq!(delivered, payload);

        // Replaying the same datagram is rejected by B's window
        assert!(matches!(
            node_b.handle_datagram(sock(1), &data).await,
            Err(CoreError::ReplayRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_forwarded_datagram_admission() {
        let (node, _, _rx) = node();
        node.create_vnet(vnet(), "varp0", false).await.unwrap();

        let announce = VarpMessage::announce(vnet(), vmac(9), care(5));
        let wrapped = encode_forward(&announce.encode());

        // Unknown sender: dropped
        assert!(node.handle_datagram(sock(30), &wrapped).await.is_err());
        assert!(node.list_cache().await.is_empty());

        // Known peer: inner announce processed
        node.add_peer(care(30), 1798).await;
        node.handle_datagram(sock(30), &wrapped).await.unwrap();
        let entries = node.list_cache().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, EntryState::Reachable);
        assert_eq!(entries[0].care_of, Some(care(5)));
    }

    #[tokio::test]
    async fn test_nested_forward_dropped() {
        let (node, _, _rx) = node();
        node.add_peer(care(30), 1798).await;

        let announce = VarpMessage::announce(vnet(), vmac(9), care(5));
        let double = encode_forward(&encode_forward(&announce.encode()));

        node.handle_datagram(sock(30), &double).await.unwrap();
        assert!(node.list_cache().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_an_error_not_a_panic() {
        let (node, _, _rx) = node();
        assert!(node.handle_datagram(sock(5), &[0x00]).await.is_err());
        assert!(node.handle_datagram(sock(5), &[0x00, 0x09, 0x00, 0x00]).await.is_err());
        assert_eq!(node.stats().rx_datagrams, 2);
    }

    #[tokio::test]
    async fn test_source_mac_learned_as_vif() {
        let (node, transport, _rx) = node();
        node.create_vnet(vnet(), "varp0", false).await.unwrap();

        let broadcast = Vmac::from_bytes([0xff; 6]);
        node.send_frame(vnet(), frame(broadcast, vmac(4), 0x01))
            .await
            .unwrap();
        transport.clear_sent();

        // A request for the learned source is now answered
        let request = VarpMessage::request(vnet(), vmac(4), care(2));
        node.handle_datagram(sock(2), &request.encode()).await.unwrap();
        assert_eq!(varp_sends(&transport).len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (node, transport, mut rx) = node();
        node.create_vnet(vnet(), "varp0", false).await.unwrap();
        node.start();

        // Injected datagrams flow through the receive loop
        let payload = frame(vmac(1), vmac(2), 0x42);
        let body = encode_plain(EncapMode::Extended, &vnet(), &payload);
        let mut datagram = BytesMut::new();
        Envelope::new(MessageKind::Tunnel, PROTO_ETHERIP as u16).write(&mut datagram);
        datagram.put_slice(&body);
        transport.inject(datagram.to_vec(), sock(5));

        let (v, delivered) = rx.recv().await.unwrap();
        assert_eq!(v, vnet());
        assert_eq!(delivered, payload);

        node.shutdown();
    }
}
