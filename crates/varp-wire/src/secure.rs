//! Security-association framing
//!
//! Wire layout: 4-byte SPI, 4-byte sequence number, cipher-dependent IV,
//! ciphertext of payload + incrementing padding + pad-length byte +
//! next-protocol byte, then the ICV over everything before it.
//!
//! This module is pure layout; the cipher and digest are injected as
//! capabilities and the caller owns sequence-number assignment and
//! failure counting.

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use varp_crypto::{CipherTransform, DigestTransform};

use crate::error::{FormatError, WireResult};

/// Fixed header size: SPI + sequence number
pub const SECURE_HEADER_SIZE: usize = 8;

/// A decoded secured packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurePacket {
    pub spi: u32,
    pub seq: u32,
    pub next_proto: u8,
    pub payload: Vec<u8>,
}

fn roundup(value: usize, multiple: usize) -> usize {
    if multiple <= 1 {
        value
    } else {
        value.div_ceil(multiple) * multiple
    }
}

/// Padded trailer length (payload + pad + pad_len + next_proto) for a cipher
fn trailer_len(payload_len: usize, cipher: &dyn CipherTransform) -> usize {
    let mut padded = roundup(payload_len + 2, cipher.block_size().max(1));
    if let Some(multiple) = cipher.pad_multiple() {
        padded = roundup(padded, multiple);
    }
    padded
}

/// Encode a secured packet around `payload`.
///
/// The IV is freshly generated; padding bytes count up from 1 so the
/// receiver can validate them after decryption.
pub fn encode_secure(
    spi: u32,
    seq: u32,
    next_proto: u8,
    payload: &[u8],
    cipher: &dyn CipherTransform,
    digest: &dyn DigestTransform,
) -> WireResult<Bytes> {
    let iv_size = cipher.iv_size();
    let padded = trailer_len(payload.len(), cipher);
    let pad_len = padded - 2 - payload.len();
    if pad_len > 255 {
        // The pad-length field is a single byte
        return Err(FormatError::BadPadding);
    }

    let mut buf =
        BytesMut::with_capacity(SECURE_HEADER_SIZE + iv_size + padded + digest.icv_len());
    buf.put_u32(spi);
    buf.put_u32(seq);

    let mut iv = vec![0u8; iv_size];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    buf.put_slice(&iv);

    let body_start = buf.len();
    buf.put_slice(payload);
    for i in 0..pad_len {
        buf.put_u8((i + 1) as u8);
    }
    buf.put_u8(pad_len as u8);
    buf.put_u8(next_proto);

    cipher.encrypt(&iv, &mut buf[body_start..])?;

    let icv = digest.compute(&buf);
    buf.put_slice(&icv);

    Ok(buf.freeze())
}

/// Read the SPI and sequence number without decrypting.
///
/// Used by the receive path to select the association before the full
/// decode.
pub fn peek_spi(bytes: &[u8]) -> WireResult<(u32, u32)> {
    if bytes.len() < SECURE_HEADER_SIZE {
        return Err(FormatError::Truncated {
            needed: SECURE_HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    let spi = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let seq = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Ok((spi, seq))
}

/// Verify, decrypt, and strip the trailer of a secured packet.
///
/// Integrity is checked before any decryption; a mismatch fails closed
/// without touching the rest of the packet.
pub fn decode_secure(
    bytes: &[u8],
    cipher: &dyn CipherTransform,
    digest: &dyn DigestTransform,
) -> WireResult<SecurePacket> {
    let (spi, seq) = peek_spi(bytes)?;

    let iv_size = cipher.iv_size();
    let icv_len = digest.icv_len();
    let min_len = SECURE_HEADER_SIZE + iv_size + 2 + icv_len;
    if bytes.len() < min_len {
        return Err(FormatError::Truncated {
            needed: min_len,
            actual: bytes.len(),
        });
    }

    let (covered, icv) = bytes.split_at(bytes.len() - icv_len);
    if !digest.verify(covered, icv) {
        return Err(FormatError::IntegrityCheckFailed);
    }

    let iv = &covered[SECURE_HEADER_SIZE..SECURE_HEADER_SIZE + iv_size];
    let mut body = covered[SECURE_HEADER_SIZE + iv_size..].to_vec();
    cipher.decrypt(iv, &mut body)?;

    let next_proto = body[body.len() - 1];
    let pad_len = body[body.len() - 2] as usize;
    if pad_len + 2 > body.len() {
        return Err(FormatError::BadPadding);
    }

    let payload_len = body.len() - 2 - pad_len;
    for (i, &byte) in body[payload_len..payload_len + pad_len].iter().enumerate() {
        if byte != (i + 1) as u8 {
            return Err(FormatError::BadPadding);
        }
    }

    body.truncate(payload_len);
    Ok(SecurePacket {
        spi,
        seq,
        next_proto,
        payload: body,
    })
}
