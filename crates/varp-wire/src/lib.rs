//! VARP Wire Formats
//!
//! Bit-exact framing for everything VARP puts on the wire:
//! - The 4-byte discriminator envelope multiplexing message kinds on one
//!   UDP port
//! - The plain tunnel header carrying a version nibble and a virtual
//!   network id (compact 12-bit or extended 128-bit mode)
//! - Resolution protocol (request/announce) messages
//! - Security-association framing (SPI, sequence, IV, padded ciphertext,
//!   trailing ICV)
//! - The peer-forwarding envelope
//!
//! All multi-byte integers are big-endian. This crate is pure data
//! layout: no sockets, no tables, no timers.

pub mod encap;
pub mod envelope;
pub mod error;
pub mod ether;
pub mod secure;
pub mod types;
pub mod varp;

pub use encap::{decode_plain, encode_plain, ENCAP_VERSION};
pub use envelope::{encode_forward, Envelope, MessageKind, ENVELOPE_SIZE};
pub use error::{FormatError, WireResult};
pub use ether::{ether_dst, ether_src, ETH_HEADER_SIZE};
pub use secure::{decode_secure, encode_secure, peek_spi, SecurePacket, SECURE_HEADER_SIZE};
pub use types::{CareOfAddress, EncapMode, VnetId, Vmac, VMAC_SIZE, VNET_ID_SIZE};
pub use varp::{VarpMessage, VarpOp};

/// Next-protocol number for plain Ethernet-in-IP tunnel data
pub const PROTO_ETHERIP: u8 = 97;

/// Next-protocol number for secured tunnel data
pub const PROTO_SECURE: u8 = 50;
