//! Plain tunnel header
//!
//! The header word is a 4-bit version nibble plus 12 reserved bits. In
//! compact mode the reserved bits carry the low 12 bits of the vnet id;
//! in extended mode they are zero and the full 16-byte id follows.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FormatError, WireResult};
use crate::types::{EncapMode, VnetId, VNET_ID_SIZE};

/// Version nibble for the plain tunnel header
pub const ENCAP_VERSION: u8 = 1;

/// Compact-mode header size
pub const PLAIN_HEADER_COMPACT: usize = 2;

/// Extended-mode header size
pub const PLAIN_HEADER_EXTENDED: usize = 2 + VNET_ID_SIZE;

/// Header size for a given mode
pub fn plain_header_size(mode: EncapMode) -> usize {
    match mode {
        EncapMode::Compact => PLAIN_HEADER_COMPACT,
        EncapMode::Extended => PLAIN_HEADER_EXTENDED,
    }
}

/// Encode the plain tunnel header ahead of an Ethernet frame
pub fn encode_plain(mode: EncapMode, vnet: &VnetId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(plain_header_size(mode) + payload.len());
    match mode {
        EncapMode::Compact => {
            let word = ((ENCAP_VERSION as u16) << 12) | vnet.compact_bits();
            buf.put_u16(word);
        }
        EncapMode::Extended => {
            buf.put_u16((ENCAP_VERSION as u16) << 12);
            buf.put_slice(vnet.as_bytes());
        }
    }
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode the plain tunnel header, returning the vnet id and payload
pub fn decode_plain(mode: EncapMode, bytes: &[u8]) -> WireResult<(VnetId, &[u8])> {
    let header = plain_header_size(mode);
    if bytes.len() < header {
        return Err(FormatError::Truncated {
            needed: header,
            actual: bytes.len(),
        });
    }

    let word = u16::from_be_bytes([bytes[0], bytes[1]]);
    let version = (word >> 12) as u8;
    if version != ENCAP_VERSION {
        return Err(FormatError::BadVersion(version));
    }

    match mode {
        EncapMode::Compact => {
            let vnet = VnetId::from_compact_bits(word & 0x0fff);
            Ok((vnet, &bytes[PLAIN_HEADER_COMPACT..]))
        }
        EncapMode::Extended => {
            let mut id = [0u8; VNET_ID_SIZE];
            id.copy_from_slice(&bytes[2..2 + VNET_ID_SIZE]);
            Ok((VnetId::from_bytes(id), &bytes[PLAIN_HEADER_EXTENDED..]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Payload sizes from empty up to a full Ethernet frame
    const PAYLOAD_SIZES: [usize; 4] = [5, 20, 64, 1500];

    #[test]
    fn test_extended_round_trip() {
        let vnet = VnetId::from_bytes([0xab; VNET_ID_SIZE]);
        for len in PAYLOAD_SIZES {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();

            let encoded = encode_plain(EncapMode::Extended, &vnet, &payload);
            assert_eq!(encoded.len(), PLAIN_HEADER_EXTENDED + len);

            let (decoded, rest) = decode_plain(EncapMode::Extended, &encoded).unwrap();
            assert_eq!(decoded, vnet);
            assert_eq!(rest, &payload[..], "length {}", len);
        }
    }

    #[test]
    fn test_compact_round_trip() {
        let vnet = VnetId::from_u32(0x0123);
        for len in PAYLOAD_SIZES {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();

            let encoded = encode_plain(EncapMode::Compact, &vnet, &payload);
            assert_eq!(encoded.len(), PLAIN_HEADER_COMPACT + len);

            let (decoded, rest) = decode_plain(EncapMode::Compact, &encoded).unwrap();
            assert_eq!(decoded, vnet);
            assert_eq!(rest, &payload[..], "length {}", len);
        }
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let vnet = VnetId::from_u32(7);
        let encoded = encode_plain(EncapMode::Extended, &vnet, &[]);
        let (decoded, rest) = decode_plain(EncapMode::Extended, &encoded).unwrap();
        assert_eq!(decoded, vnet);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_bad_version() {
        let mut encoded = encode_plain(EncapMode::Extended, &VnetId::from_u32(1), b"x").to_vec();
        encoded[0] = 0x20; // version 2
        assert!(matches!(
            decode_plain(EncapMode::Extended, &encoded),
            Err(FormatError::BadVersion(2))
        ));
    }

    #[test]
    fn test_truncated() {
        let vnet = VnetId::from_u32(1);
        let encoded = encode_plain(EncapMode::Extended, &vnet, b"frame");
        assert!(matches!(
            decode_plain(EncapMode::Extended, &encoded[..10]),
            Err(FormatError::Truncated { .. })
        ));
        assert!(matches!(
            decode_plain(EncapMode::Compact, &encoded[..1]),
            Err(FormatError::Truncated { .. })
        ));
    }
}
