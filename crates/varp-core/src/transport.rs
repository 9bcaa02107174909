//! Transport and delivery seams
//!
//! The core never talks to a platform directly: datagrams go through the
//! `Transport` trait and decoded Ethernet frames are handed to a
//! `FrameSink`. `UdpTransport` is the standard implementation;
//! `MemoryTransport` backs tests and in-process wiring.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use varp_wire::VnetId;

use crate::error::SendError;

/// Maximum datagram size we send or receive
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Datagram transport used by the tunnel and resolution paths.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to the destination
    async fn send_datagram(&self, buf: &[u8], dst: SocketAddr) -> Result<(), SendError>;

    /// Receive one datagram into `buf`, returning length and source
    async fn recv_datagram(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SendError>;

    /// Local bound address
    fn local_addr(&self) -> SocketAddr;
}

/// Sink for Ethernet frames decoded off the wire, bound for the local
/// virtual interface.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn deliver(&self, vnet: VnetId, frame: Bytes);
}

/// UDP transport over a shared tokio socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to the given address
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        debug!("transport bound to {}", local_addr);
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Join a multicast group for resolution traffic
    pub fn join_multicast_v4(
        &self,
        group: std::net::Ipv4Addr,
        interface: std::net::Ipv4Addr,
    ) -> std::io::Result<()> {
        self.socket.join_multicast_v4(group, interface)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_datagram(&self, buf: &[u8], dst: SocketAddr) -> Result<(), SendError> {
        self.socket
            .send_to(buf, dst)
            .await
            .map_err(|e| SendError::TransportFailure(e.to_string()))?;
        Ok(())
    }

    async fn recv_datagram(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SendError> {
        self.socket
            .recv_from(buf)
            .await
            .map_err(|e| SendError::TransportFailure(e.to_string()))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// In-memory transport recording outbound datagrams and replaying
/// injected inbound ones. Destinations can be marked as failing to
/// exercise error paths.
pub struct MemoryTransport {
    local_addr: SocketAddr,
    sent: std::sync::Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    failing: std::sync::Mutex<HashSet<SocketAddr>>,
    inbound_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

impl MemoryTransport {
    /// Create a transport claiming the given local address
    pub fn new(local_addr: SocketAddr) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            local_addr,
            sent: std::sync::Mutex::new(Vec::new()),
            failing: std::sync::Mutex::new(HashSet::new()),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
        }
    }

    /// Mark a destination as unreachable
    pub fn fail_destination(&self, dst: SocketAddr) {
        self.failing.lock().unwrap().insert(dst);
    }

    /// Queue an inbound datagram for `recv_datagram`
    pub fn inject(&self, buf: Vec<u8>, from: SocketAddr) {
        let _ = self.inbound_tx.send((buf, from));
    }

    /// Snapshot of datagrams sent so far
    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().unwrap().clone()
    }

    /// Drop the send record
    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_datagram(&self, buf: &[u8], dst: SocketAddr) -> Result<(), SendError> {
        if self.failing.lock().unwrap().contains(&dst) {
            return Err(SendError::TransportFailure(format!("{} unreachable", dst)));
        }
        self.sent.lock().unwrap().push((buf.to_vec(), dst));
        Ok(())
    }

    async fn recv_datagram(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SendError> {
        let mut rx = self.inbound_rx.lock().await;
        let (data, from) = rx
            .recv()
            .await
            .ok_or_else(|| SendError::TransportFailure("transport closed".into()))?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Frame sink forwarding into an mpsc channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(VnetId, Bytes)>,
}

impl ChannelSink {
    /// Create a sink and its receiving end
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(VnetId, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn deliver(&self, vnet: VnetId, frame: Bytes) {
        let _ = self.tx.send((vnet, frame));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    #[tokio::test]
    async fn test_memory_transport_send_and_fail() {
        let transport = MemoryTransport::new(addr(1, 1798));
        transport.fail_destination(addr(9, 1798));

        transport.send_datagram(b"hello", addr(2, 1798)).await.unwrap();
        assert!(transport.send_datagram(b"oops", addr(9, 1798)).await.is_err());

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b"hello");
    }

    #[tokio::test]
    async fn test_memory_transport_inject_recv() {
        let transport = MemoryTransport::new(addr(1, 1798));
        transport.inject(b"datagram".to_vec(), addr(2, 1798));

        let mut buf = [0u8; 64];
        let (len, from) = transport.recv_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"datagram");
        assert_eq!(from, addr(2, 1798));
    }

    #[tokio::test]
    async fn test_udp_transport_round_trip() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        a.send_datagram(b"ping", b.local_addr()).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = b.recv_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr());
    }
}
