//! Resolution protocol messages
//!
//! A VARP message asks "who has (vnet, vmac)?" (request) or answers
//! "(vnet, vmac) is at this care-of address" (announce). On the wire:
//! envelope + 16-byte vnet id + 6-byte vmac + 1-byte address family +
//! address bytes.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::envelope::{Envelope, MessageKind, ENVELOPE_SIZE};
use crate::error::{FormatError, WireResult};
use crate::types::{CareOfAddress, VnetId, Vmac, VMAC_SIZE, VNET_ID_SIZE};

/// Resolution opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum VarpOp {
    Request = 1,
    Announce = 2,
}

impl TryFrom<u16> for VarpOp {
    type Error = FormatError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Announce),
            other => Err(FormatError::UnknownOpcode(other)),
        }
    }
}

/// A resolution protocol message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarpMessage {
    pub op: VarpOp,
    pub vnet: VnetId,
    pub vmac: Vmac,
    /// Sender's care-of address (request) or resolved address (announce)
    pub care_of: CareOfAddress,
}

/// Fixed part after the envelope: vnet + vmac + family byte
const VARP_FIXED: usize = VNET_ID_SIZE + VMAC_SIZE + 1;

impl VarpMessage {
    /// Build a resolution request
    pub fn request(vnet: VnetId, vmac: Vmac, from: CareOfAddress) -> Self {
        Self {
            op: VarpOp::Request,
            vnet,
            vmac,
            care_of: from,
        }
    }

    /// Build an announce
    pub fn announce(vnet: VnetId, vmac: Vmac, care_of: CareOfAddress) -> Self {
        Self {
            op: VarpOp::Announce,
            vnet,
            vmac,
            care_of,
        }
    }

    /// Encode with the leading envelope
    pub fn encode(&self) -> Bytes {
        let addr = self.care_of.addr_bytes();
        let mut buf = BytesMut::with_capacity(ENVELOPE_SIZE + VARP_FIXED + addr.len());
        Envelope::new(MessageKind::Varp, self.op as u16).write(&mut buf);
        buf.put_slice(self.vnet.as_bytes());
        buf.put_slice(self.vmac.as_bytes());
        buf.put_u8(self.care_of.family());
        buf.put_slice(&addr);
        buf.freeze()
    }

    /// Decode the body following an already-read envelope
    pub fn decode(opcode: u16, body: &[u8]) -> WireResult<Self> {
        let op = VarpOp::try_from(opcode)?;

        if body.len() < VARP_FIXED {
            return Err(FormatError::Truncated {
                needed: VARP_FIXED,
                actual: body.len(),
            });
        }

        let mut vnet = [0u8; VNET_ID_SIZE];
        vnet.copy_from_slice(&body[..VNET_ID_SIZE]);
        let mut vmac = [0u8; VMAC_SIZE];
        vmac.copy_from_slice(&body[VNET_ID_SIZE..VNET_ID_SIZE + VMAC_SIZE]);

        let family = body[VNET_ID_SIZE + VMAC_SIZE];
        let addr = &body[VARP_FIXED..];
        let care_of = match family {
            4 => {
                if addr.len() < 4 {
                    return Err(FormatError::Truncated {
                        needed: VARP_FIXED + 4,
                        actual: body.len(),
                    });
                }
                CareOfAddress::V4(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]))
            }
            6 => {
                if addr.len() < 16 {
                    return Err(FormatError::Truncated {
                        needed: VARP_FIXED + 16,
                        actual: body.len(),
                    });
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&addr[..16]);
                CareOfAddress::V6(Ipv6Addr::from(octets))
            }
            other => return Err(FormatError::UnknownFamily(other)),
        };

        Ok(Self {
            op,
            vnet: VnetId::from_bytes(vnet),
            vmac: Vmac::from_bytes(vmac),
            care_of,
        })
    }
}
