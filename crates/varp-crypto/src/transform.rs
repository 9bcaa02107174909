//! Cipher and digest transforms
//!
//! A cipher declares its block size, IV size, and trailer alignment;
//! a digest declares its ICV length and performs constant-time
//! verification. The security codec drives both through trait objects.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::constants::{CHACHA20_IV_SIZE, CHACHA20_KEY_SIZE, HMAC_ICV_SIZE, PAD_ALIGN};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::KeyMaterial;

type HmacSha256 = Hmac<Sha256>;

/// Confidentiality transform applied in place over the trailer-padded payload.
pub trait CipherTransform: Send + Sync {
    /// Registered transform name
    fn name(&self) -> &'static str;

    /// Cipher block size (1 for stream ciphers)
    fn block_size(&self) -> usize;

    /// Additional trailer alignment, if the framing requires one
    fn pad_multiple(&self) -> Option<usize>;

    /// IV length carried on the wire ahead of the ciphertext
    fn iv_size(&self) -> usize;

    /// Encrypt `buf` in place
    fn encrypt(&self, iv: &[u8], buf: &mut [u8]) -> CryptoResult<()>;

    /// Decrypt `buf` in place
    fn decrypt(&self, iv: &[u8], buf: &mut [u8]) -> CryptoResult<()>;
}

/// Integrity transform computed over header + IV + ciphertext.
pub trait DigestTransform: Send + Sync {
    /// Registered transform name
    fn name(&self) -> &'static str;

    /// ICV length appended to the packet
    fn icv_len(&self) -> usize;

    /// Compute the ICV over `data`
    fn compute(&self, data: &[u8]) -> Vec<u8>;

    /// Verify `icv` against `data` in constant time
    fn verify(&self, data: &[u8], icv: &[u8]) -> bool;
}

/// Identity cipher for associations without confidentiality.
pub struct NullCipher;

impl CipherTransform for NullCipher {
    fn name(&self) -> &'static str {
        "null"
    }

    fn block_size(&self) -> usize {
        1
    }

    fn pad_multiple(&self) -> Option<usize> {
        Some(PAD_ALIGN)
    }

    fn iv_size(&self) -> usize {
        0
    }

    fn encrypt(&self, _iv: &[u8], _buf: &mut [u8]) -> CryptoResult<()> {
        Ok(())
    }

    fn decrypt(&self, _iv: &[u8], _buf: &mut [u8]) -> CryptoResult<()> {
        Ok(())
    }
}

/// ChaCha20 stream cipher transform (256-bit key, 96-bit IV).
pub struct ChaCha20Cipher {
    key: KeyMaterial,
}

impl ChaCha20Cipher {
    /// Initialize from key material
    pub fn new(key: &[u8]) -> CryptoResult<Self> {
        if key.len() != CHACHA20_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: CHACHA20_KEY_SIZE,
                actual: key.len(),
            });
        }
        Ok(Self {
            key: KeyMaterial::from_slice(key),
        })
    }

    fn apply(&self, iv: &[u8], buf: &mut [u8]) -> CryptoResult<()> {
        if iv.len() != CHACHA20_IV_SIZE {
            return Err(CryptoError::InvalidIvLength {
                expected: CHACHA20_IV_SIZE,
                actual: iv.len(),
            });
        }
        let mut cipher = ChaCha20::new_from_slices(self.key.as_bytes(), iv).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: CHACHA20_KEY_SIZE,
                actual: self.key.len(),
            }
        })?;
        cipher.apply_keystream(buf);
        Ok(())
    }
}

impl CipherTransform for ChaCha20Cipher {
    fn name(&self) -> &'static str {
        "chacha20"
    }

    fn block_size(&self) -> usize {
        1
    }

    fn pad_multiple(&self) -> Option<usize> {
        Some(PAD_ALIGN)
    }

    fn iv_size(&self) -> usize {
        CHACHA20_IV_SIZE
    }

    fn encrypt(&self, iv: &[u8], buf: &mut [u8]) -> CryptoResult<()> {
        self.apply(iv, buf)
    }

    fn decrypt(&self, iv: &[u8], buf: &mut [u8]) -> CryptoResult<()> {
        // Stream cipher: decryption is the same keystream application
        self.apply(iv, buf)
    }
}

/// Empty digest for associations without authentication.
pub struct NullDigest;

impl DigestTransform for NullDigest {
    fn name(&self) -> &'static str {
        "null"
    }

    fn icv_len(&self) -> usize {
        0
    }

    fn compute(&self, _data: &[u8]) -> Vec<u8> {
        Vec::new()
    }

    fn verify(&self, _data: &[u8], icv: &[u8]) -> bool {
        icv.is_empty()
    }
}

/// HMAC-SHA256 digest truncated to 96 bits.
pub struct HmacSha256Digest {
    key: KeyMaterial,
}

impl HmacSha256Digest {
    /// Initialize from key material (any length)
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: KeyMaterial::from_slice(key),
        }
    }
}

impl DigestTransform for HmacSha256Digest {
    fn name(&self) -> &'static str {
        "hmac-sha256"
    }

    fn icv_len(&self) -> usize {
        HMAC_ICV_SIZE
    }

    fn compute(&self, data: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(self.key.as_bytes()).expect("HMAC accepts any key length");
        mac.update(data);
        let out = mac.finalize().into_bytes();
        out[..HMAC_ICV_SIZE].to_vec()
    }

    fn verify(&self, data: &[u8], icv: &[u8]) -> bool {
        if icv.len() != HMAC_ICV_SIZE {
            return false;
        }
        let expected = self.compute(data);
        expected.ct_eq(icv).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chacha20_round_trip() {
        let key = KeyMaterial::random(CHACHA20_KEY_SIZE);
        let cipher = ChaCha20Cipher::new(key.as_bytes()).unwrap();
        let iv = [9u8; CHACHA20_IV_SIZE];

        let mut buf = b"frame bytes go here".to_vec();
        let original = buf.clone();

        cipher.encrypt(&iv, &mut buf).unwrap();
        assert_ne!(buf, original);
        cipher.decrypt(&iv, &mut buf).unwrap();
        assert_eq!(buf, original);
    }

    #[test]
    fn test_chacha20_rejects_bad_key() {
        assert!(matches!(
            ChaCha20Cipher::new(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength { expected: 32, .. })
        ));
    }

    #[test]
    fn test_chacha20_rejects_bad_iv() {
        let cipher = ChaCha20Cipher::new(&[0u8; CHACHA20_KEY_SIZE]).unwrap();
        let mut buf = [0u8; 8];
        assert!(cipher.encrypt(&[0u8; 8], &mut buf).is_err());
    }

    #[test]
    fn test_hmac_truncated_icv() {
        let digest = HmacSha256Digest::new(b"auth key");
        let icv = digest.compute(b"payload");
        assert_eq!(icv.len(), HMAC_ICV_SIZE);
        assert!(digest.verify(b"payload", &icv));
    }

    #[test]
    fn test_hmac_rejects_wrong_length_icv() {
        let digest = HmacSha256Digest::new(b"auth key");
        let icv = digest.compute(b"payload");
        assert!(!digest.verify(b"payload", &icv[..8]));
    }

    #[test]
    fn test_null_transforms() {
        let cipher = NullCipher;
        let mut buf = b"unchanged".to_vec();
        cipher.encrypt(&[], &mut buf).unwrap();
        assert_eq!(buf, b"unchanged");

        let digest = NullDigest;
        assert!(digest.compute(b"x").is_empty());
        assert!(digest.verify(b"x", &[]));
        assert!(!digest.verify(b"x", &[1]));
    }
}
