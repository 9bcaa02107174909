//! VARP Cryptographic Transform Provider
//!
//! The tunnel layer consumes ciphers and digests as named capabilities:
//! - Block/stream ciphers with declared IV and padding requirements
//! - Keyed digests producing a truncated integrity check value (ICV)
//! - A registry resolving transform names to initialized instances
//!
//! The security codec in `varp-wire` and the association table in
//! `varp-core` only see the `CipherTransform`/`DigestTransform` traits;
//! the primitives themselves live here.

pub mod error;
pub mod keys;
pub mod registry;
pub mod transform;

pub use error::{CryptoError, CryptoResult};
pub use keys::{spi_mangle, KeyMaterial};
pub use registry::TransformRegistry;
pub use transform::{
    ChaCha20Cipher, CipherTransform, DigestTransform, HmacSha256Digest, NullCipher, NullDigest,
};

/// Transform constants
pub mod constants {
    /// ChaCha20 key size in bytes
    pub const CHACHA20_KEY_SIZE: usize = 32;

    /// ChaCha20 IV (nonce) size
    pub const CHACHA20_IV_SIZE: usize = 12;

    /// Truncated ICV length (ESP-96 style)
    pub const HMAC_ICV_SIZE: usize = 12;

    /// Trailer alignment required by the security framing
    pub const PAD_ALIGN: usize = 4;
}
