//! Wire-level value types
//!
//! Virtual network ids, virtual MAC addresses, and care-of (physical)
//! addresses. All are immutable value types compared bitwise.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Virtual network id size in bytes
pub const VNET_ID_SIZE: usize = 16;

/// Virtual MAC size in bytes
pub const VMAC_SIZE: usize = 6;

/// A 128-bit virtual network identifier.
///
/// Carried in full in extended encapsulation mode; only the low 12 bits
/// fit on the wire in compact mode.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VnetId {
    bytes: [u8; VNET_ID_SIZE],
}

impl VnetId {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; VNET_ID_SIZE]) -> Self {
        Self { bytes }
    }

    /// Create from a small integer (low bytes), convenient for tests
    /// and compact-mode deployments
    pub fn from_u32(value: u32) -> Self {
        let mut bytes = [0u8; VNET_ID_SIZE];
        bytes[VNET_ID_SIZE - 4..].copy_from_slice(&value.to_be_bytes());
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; VNET_ID_SIZE] {
        &self.bytes
    }

    /// Low 12 bits, as packed into the compact-mode header
    pub fn compact_bits(&self) -> u16 {
        let low = u16::from_be_bytes([self.bytes[14], self.bytes[15]]);
        low & 0x0fff
    }

    /// Reconstruct an id from compact-mode bits (high 116 bits zero)
    pub fn from_compact_bits(bits: u16) -> Self {
        Self::from_u32((bits & 0x0fff) as u32)
    }
}

impl fmt::Display for VnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.bytes.chunks(2).enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}{:02x}", chunk[0], chunk[1])?;
        }
        Ok(())
    }
}

impl fmt::Debug for VnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A 6-byte virtual Ethernet MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vmac {
    bytes: [u8; VMAC_SIZE],
}

impl Vmac {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; VMAC_SIZE]) -> Self {
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; VMAC_SIZE] {
        &self.bytes
    }

    /// Group (multicast/broadcast) bit of the first octet
    pub fn is_multicast(&self) -> bool {
        self.bytes[0] & 0x01 != 0
    }

    /// All-ones broadcast address
    pub fn is_broadcast(&self) -> bool {
        self.bytes == [0xff; VMAC_SIZE]
    }
}

impl fmt::Display for Vmac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3], self.bytes[4], self.bytes[5]
        )
    }
}

impl fmt::Debug for Vmac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Care-of (physical, routable) address for a virtual destination.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum CareOfAddress {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl CareOfAddress {
    /// Wire address-family byte (4 or 6)
    pub fn family(&self) -> u8 {
        match self {
            Self::V4(_) => 4,
            Self::V6(_) => 6,
        }
    }

    /// Raw address bytes in network order
    pub fn addr_bytes(&self) -> Vec<u8> {
        match self {
            Self::V4(addr) => addr.octets().to_vec(),
            Self::V6(addr) => addr.octets().to_vec(),
        }
    }

    /// Pair with a UDP port
    pub fn to_socket_addr(&self, port: u16) -> SocketAddr {
        match self {
            Self::V4(addr) => SocketAddr::new(IpAddr::V4(*addr), port),
            Self::V6(addr) => SocketAddr::new(IpAddr::V6(*addr), port),
        }
    }
}

impl From<IpAddr> for CareOfAddress {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::V4(v4),
            IpAddr::V6(v6) => Self::V6(v6),
        }
    }
}

impl From<Ipv4Addr> for CareOfAddress {
    fn from(addr: Ipv4Addr) -> Self {
        Self::V4(addr)
    }
}

impl fmt::Display for CareOfAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(addr) => write!(f, "{}", addr),
            Self::V6(addr) => write!(f, "{}", addr),
        }
    }
}

/// Virtual network id encoding mode on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum EncapMode {
    /// 12-bit vnet id packed into the header word
    Compact,
    /// Full 128-bit vnet id follows the header word
    Extended,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vnet_id_compact_bits() {
        let vnet = VnetId::from_u32(0x0abc);
        assert_eq!(vnet.compact_bits(), 0x0abc);

        // High bits beyond 12 are masked off
        let vnet = VnetId::from_u32(0xf123);
        assert_eq!(vnet.compact_bits(), 0x0123);
    }

    #[test]
    fn test_vnet_id_display() {
        let vnet = VnetId::from_u32(1);
        assert_eq!(
            vnet.to_string(),
            "0000:0000:0000:0000:0000:0000:0000:0001"
        );
    }

    #[test]
    fn test_vmac_multicast() {
        assert!(Vmac::from_bytes([0xff; 6]).is_broadcast());
        assert!(Vmac::from_bytes([0xff; 6]).is_multicast());
        assert!(Vmac::from_bytes([0x01, 0, 0x5e, 1, 2, 3]).is_multicast());
        assert!(!Vmac::from_bytes([0x02, 0, 0, 1, 2, 3]).is_multicast());
    }

    #[test]
    fn test_care_of_family() {
        let v4 = CareOfAddress::V4(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(v4.family(), 4);
        assert_eq!(v4.addr_bytes(), vec![10, 0, 0, 5]);

        let v6 = CareOfAddress::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(v6.family(), 6);
        assert_eq!(v6.addr_bytes().len(), 16);
    }
}
