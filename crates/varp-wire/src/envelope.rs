//! Discriminator envelope
//!
//! When VARP traffic is carried over UDP, every datagram starts with a
//! 4-byte envelope (2-byte message kind, 2-byte opcode) so resolution
//! messages, tunnel data, and inter-peer forwarded packets share one
//! port.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FormatError, WireResult};

/// Envelope size in bytes
pub const ENVELOPE_SIZE: usize = 4;

/// Message kind carried in the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageKind {
    /// Resolution protocol message (request/announce)
    Varp = 0x0001,

    /// Tunnel-in-UDP data (opcode carries the next-protocol number)
    Tunnel = 0x0002,

    /// Inter-peer forwarded packet
    Forward = 0x0003,
}

impl TryFrom<u16> for MessageKind {
    type Error = FormatError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::Varp),
            0x0002 => Ok(Self::Tunnel),
            0x0003 => Ok(Self::Forward),
            other => Err(FormatError::UnknownKind(other)),
        }
    }
}

/// The 4-byte discriminator header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub opcode: u16,
}

impl Envelope {
    /// Create an envelope
    pub fn new(kind: MessageKind, opcode: u16) -> Self {
        Self { kind, opcode }
    }

    /// Append the envelope to a buffer
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.kind as u16);
        buf.put_u16(self.opcode);
    }

    /// Split the envelope off the front of a datagram
    pub fn read(buf: &[u8]) -> WireResult<(Envelope, &[u8])> {
        if buf.len() < ENVELOPE_SIZE {
            return Err(FormatError::Truncated {
                needed: ENVELOPE_SIZE,
                actual: buf.len(),
            });
        }
        let kind = MessageKind::try_from(u16::from_be_bytes([buf[0], buf[1]]))?;
        let opcode = u16::from_be_bytes([buf[2], buf[3]]);
        Ok((Envelope { kind, opcode }, &buf[ENVELOPE_SIZE..]))
    }
}

/// Wrap a complete datagram in a peer-forwarding envelope
pub fn encode_forward(datagram: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ENVELOPE_SIZE + datagram.len());
    Envelope::new(MessageKind::Forward, 0).write(&mut buf);
    buf.put_slice(datagram);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let mut buf = BytesMut::new();
        Envelope::new(MessageKind::Tunnel, 97).write(&mut buf);
        buf.put_slice(b"payload");

        let (envelope, rest) = Envelope::read(&buf).unwrap();
        assert_eq!(envelope.kind, MessageKind::Tunnel);
        assert_eq!(envelope.opcode, 97);
        assert_eq!(rest, b"payload");
    }

    #[test]
    fn test_envelope_unknown_kind() {
        let buf = [0x00, 0x7f, 0x00, 0x00];
        assert!(matches!(
            Envelope::read(&buf),
            Err(FormatError::UnknownKind(0x007f))
        ));
    }

    #[test]
    fn test_envelope_truncated() {
        assert!(matches!(
            Envelope::read(&[0x00, 0x01]),
            Err(FormatError::Truncated { needed: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_forward_envelope() {
        let wrapped = encode_forward(b"inner datagram");
        let (envelope, inner) = Envelope::read(&wrapped).unwrap();
        assert_eq!(envelope.kind, MessageKind::Forward);
        assert_eq!(inner, b"inner datagram");
    }
}
