//! Peer overlay registry
//!
//! When true IP multicast is unavailable, broadcast traffic is fanned
//! out to a configured set of unicast peers inside the forwarding
//! envelope. Forwarding is best-effort per peer: one peer's transport
//! failure never aborts the fan-out. Inbound forwarded datagrams are
//! only accepted from known peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use varp_wire::{encode_forward, CareOfAddress};

use crate::error::{CoreError, CoreResult};
use crate::transport::Transport;

/// One configured overlay peer.
pub struct Peer {
    addr: CareOfAddress,
    port: u16,
    tx_packets: AtomicU64,
    tx_failures: AtomicU64,
    rx_packets: AtomicU64,
    added_at: Instant,
}

impl Peer {
    /// The peer's care-of address
    pub fn addr(&self) -> CareOfAddress {
        self.addr
    }

    /// The peer's UDP port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Datagrams forwarded to this peer
    pub fn tx_packets(&self) -> u64 {
        self.tx_packets.load(Ordering::Relaxed)
    }

    /// Forward attempts that failed at the transport
    pub fn tx_failures(&self) -> u64 {
        self.tx_failures.load(Ordering::Relaxed)
    }

    /// Forwarded datagrams accepted from this peer
    pub fn rx_packets(&self) -> u64 {
        self.rx_packets.load(Ordering::Relaxed)
    }

    /// Time since the peer was added
    pub fn age(&self) -> std::time::Duration {
        self.added_at.elapsed()
    }
}

/// Registry of overlay peers keyed by care-of address.
pub struct PeerRegistry {
    peers: RwLock<HashMap<CareOfAddress, Arc<Peer>>>,
    transport: Arc<dyn Transport>,
}

impl PeerRegistry {
    /// Create a registry sending through the given transport
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            transport,
        }
    }

    /// Add a peer. Re-adding an existing address updates its port and
    /// resets its counters.
    pub async fn add(&self, addr: CareOfAddress, port: u16) -> Arc<Peer> {
        let peer = Arc::new(Peer {
            addr,
            port,
            tx_packets: AtomicU64::new(0),
            tx_failures: AtomicU64::new(0),
            rx_packets: AtomicU64::new(0),
            added_at: Instant::now(),
        });
        self.peers.write().await.insert(addr, peer.clone());
        info!("added peer {}:{}", addr, port);
        peer
    }

    /// Remove a peer
    pub async fn remove(&self, addr: CareOfAddress) -> CoreResult<()> {
        self.peers
            .write()
            .await
            .remove(&addr)
            .map(|_| info!("removed peer {}", addr))
            .ok_or(CoreError::NotFound)
    }

    /// Whether an address belongs to a known peer
    pub async fn is_known(&self, addr: CareOfAddress) -> bool {
        self.peers.read().await.contains_key(&addr)
    }

    /// Fan a datagram out to every peer inside the forwarding envelope.
    ///
    /// Returns the number of peers reached. Individual failures are
    /// logged and counted on the peer, and the fan-out continues.
    pub async fn forward(&self, datagram: &[u8]) -> usize {
        let peers: Vec<Arc<Peer>> = self.peers.read().await.values().cloned().collect();
        if peers.is_empty() {
            return 0;
        }

        let wrapped = encode_forward(datagram);
        let mut reached = 0;
        for peer in peers {
            let dst = peer.addr.to_socket_addr(peer.port);
            match self.transport.send_datagram(&wrapped, dst).await {
                Ok(()) => {
                    peer.tx_packets.fetch_add(1, Ordering::Relaxed);
                    reached += 1;
                }
                Err(e) => {
                    peer.tx_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("forward to peer {} failed: {}", dst, e);
                }
            }
        }
        reached
    }

    /// Accept one forwarded datagram body if the sender is a known peer.
    ///
    /// Unknown senders are dropped with a warning; the caller re-injects
    /// the returned inner datagram into normal receive processing.
    pub async fn receive(&self, from: CareOfAddress, body: &[u8]) -> Option<Bytes> {
        let peer = self.peers.read().await.get(&from).cloned();
        match peer {
            Some(peer) => {
                peer.rx_packets.fetch_add(1, Ordering::Relaxed);
                debug!("accepted forwarded datagram from {}", from);
                Some(Bytes::copy_from_slice(body))
            }
            None => {
                warn!("dropping forwarded datagram from unknown peer {}", from);
                None
            }
        }
    }

    /// All configured peers
    pub async fn list(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Number of configured peers
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::net::Ipv4Addr;
    use varp_wire::{Envelope, MessageKind};

    fn addr(last: u8) -> CareOfAddress {
        CareOfAddress::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn registry() -> (PeerRegistry, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new("10.0.0.1:1798".parse().unwrap()));
        (PeerRegistry::new(transport.clone()), transport)
    }

    #[tokio::test]
    async fn test_add_remove_list() {
        let (registry, _) = registry();
        registry.add(addr(10), 1798).await;
        registry.add(addr(11), 2000).await;

        assert!(registry.is_known(addr(10)).await);
        assert_eq!(registry.len().await, 2);

        registry.remove(addr(10)).await.unwrap();
        assert!(!registry.is_known(addr(10)).await);
        assert!(matches!(
            registry.remove(addr(10)).await,
            Err(CoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_forward_wraps_in_envelope() {
        let (registry, transport) = registry();
        registry.add(addr(10), 1798).await;

        assert_eq!(registry.forward(b"inner datagram").await, 1);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, addr(10).to_socket_addr(1798));

        let (envelope, body) = Envelope::read(&sent[0].0).unwrap();
        assert_eq!(envelope.kind, MessageKind::Forward);
        assert_eq!(body, b"inner datagram");
    }

    #[tokio::test]
    async fn test_forward_failure_isolated_per_peer() {
        let (registry, transport) = registry();
        let dead = registry.add(addr(10), 1798).await;
        let live = registry.add(addr(11), 1798).await;
        transport.fail_destination(addr(10).to_socket_addr(1798));

        assert_eq!(registry.forward(b"payload").await, 1);
        assert_eq!(dead.tx_failures(), 1);
        assert_eq!(dead.tx_packets(), 0);
        assert_eq!(live.tx_packets(), 1);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_receive_from_unknown_peer_dropped() {
        let (registry, _) = registry();
        registry.add(addr(10), 1798).await;

        assert!(registry.receive(addr(99), b"spoofed").await.is_none());

        let inner = registry.receive(addr(10), b"legit").await.unwrap();
        assert_eq!(&inner[..], b"legit");
        assert_eq!(registry.list().await[0].rx_packets(), 1);
    }
}
