//! Ethernet frame helpers
//!
//! Just enough header access for the resolution path: destination and
//! source MACs off the front of an encapsulated frame.

use crate::error::{FormatError, WireResult};
use crate::types::{Vmac, VMAC_SIZE};

/// Ethernet header size: dst(6) + src(6) + ethertype(2)
pub const ETH_HEADER_SIZE: usize = 14;

/// Destination MAC of a frame
pub fn ether_dst(frame: &[u8]) -> WireResult<Vmac> {
    if frame.len() < ETH_HEADER_SIZE {
        return Err(FormatError::Truncated {
            needed: ETH_HEADER_SIZE,
            actual: frame.len(),
        });
    }
    let mut mac = [0u8; VMAC_SIZE];
    mac.copy_from_slice(&frame[..VMAC_SIZE]);
    Ok(Vmac::from_bytes(mac))
}

/// Source MAC of a frame
pub fn ether_src(frame: &[u8]) -> WireResult<Vmac> {
    if frame.len() < ETH_HEADER_SIZE {
        return Err(FormatError::Truncated {
            needed: ETH_HEADER_SIZE,
            actual: frame.len(),
        });
    }
    let mut mac = [0u8; VMAC_SIZE];
    mac.copy_from_slice(&frame[VMAC_SIZE..2 * VMAC_SIZE]);
    Ok(Vmac::from_bytes(mac))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(dst: [u8; 6], src: [u8; 6]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&dst);
        f.extend_from_slice(&src);
        f.extend_from_slice(&[0x08, 0x00]);
        f.extend_from_slice(&[0u8; 46]);
        f
    }

    #[test]
    fn test_ether_addresses() {
        let f = frame([0xff; 6], [2, 0, 0, 0, 0, 1]);
        assert!(ether_dst(&f).unwrap().is_broadcast());
        assert_eq!(ether_src(&f).unwrap(), Vmac::from_bytes([2, 0, 0, 0, 0, 1]));
    }

    #[test]
    fn test_short_frame() {
        assert!(matches!(
            ether_dst(&[0u8; 10]),
            Err(FormatError::Truncated { .. })
        ));
    }
}
