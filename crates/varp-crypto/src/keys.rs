//! Key material handling and SPI derivation

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Negotiated key bytes for one transform.
///
/// Wiped on drop; cloned only when installing an association.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    /// Wrap existing key bytes
    pub fn from_slice(slice: &[u8]) -> Self {
        Self {
            bytes: slice.to_vec(),
        }
    }

    /// Generate random key material of the given length
    pub fn random(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Empty key material (null transforms)
    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Key length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the material is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key bytes
        write!(f, "KeyMaterial({} bytes)", self.bytes.len())
    }
}

/// Deterministic SPI derivation.
///
/// Mangles (key, offset, protocol, address) into a 32-bit value. The
/// association table retries with incrementing offsets when the derived
/// SPI collides with an existing one.
pub fn spi_mangle(key: &[u8], offset: u32, protocol: u8, addr: &[u8]) -> u32 {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&offset.to_be_bytes());
    mac.update(&[protocol]);
    mac.update(addr);

    let out = mac.finalize().into_bytes();
    u32::from_be_bytes([out[0], out[1], out[2], out[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spi_mangle_deterministic() {
        let key = b"some negotiated key";
        let addr = [10, 0, 0, 5];

        let a = spi_mangle(key, 0, 50, &addr);
        let b = spi_mangle(key, 0, 50, &addr);
        assert_eq!(a, b);
    }

    #[test]
    fn test_spi_mangle_varies_with_inputs() {
        let key = b"some negotiated key";
        let addr = [10, 0, 0, 5];

        let base = spi_mangle(key, 0, 50, &addr);
        assert_ne!(base, spi_mangle(key, 1, 50, &addr));
        assert_ne!(base, spi_mangle(key, 0, 97, &addr));
        assert_ne!(base, spi_mangle(b"other key", 0, 50, &addr));
    }

    #[test]
    fn test_key_material_random_distinct() {
        let a = KeyMaterial::random(32);
        let b = KeyMaterial::random(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
