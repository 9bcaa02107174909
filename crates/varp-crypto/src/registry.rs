//! Named transform registry
//!
//! The control plane installs associations by transform name; the
//! registry resolves those names to initialized cipher/digest instances.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CryptoError, CryptoResult};
use crate::transform::{
    ChaCha20Cipher, CipherTransform, DigestTransform, HmacSha256Digest, NullCipher, NullDigest,
};

type CipherFactory = fn(&[u8]) -> CryptoResult<Arc<dyn CipherTransform>>;
type DigestFactory = fn(&[u8]) -> CryptoResult<Arc<dyn DigestTransform>>;

/// Capability table mapping transform names to factories.
pub struct TransformRegistry {
    ciphers: HashMap<&'static str, CipherFactory>,
    digests: HashMap<&'static str, DigestFactory>,
}

impl TransformRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            ciphers: HashMap::new(),
            digests: HashMap::new(),
        }
    }

    /// Registry with all built-in transforms
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_cipher("null", |_key| Ok(Arc::new(NullCipher)));
        registry.register_cipher("chacha20", |key| {
            Ok(Arc::new(ChaCha20Cipher::new(key)?) as Arc<dyn CipherTransform>)
        });
        registry.register_digest("null", |_key| Ok(Arc::new(NullDigest)));
        registry.register_digest("hmac-sha256", |key| {
            Ok(Arc::new(HmacSha256Digest::new(key)) as Arc<dyn DigestTransform>)
        });
        registry
    }

    /// Register a cipher factory under a name
    pub fn register_cipher(&mut self, name: &'static str, factory: CipherFactory) {
        self.ciphers.insert(name, factory);
    }

    /// Register a digest factory under a name
    pub fn register_digest(&mut self, name: &'static str, factory: DigestFactory) {
        self.digests.insert(name, factory);
    }

    /// Whether a cipher name is registered
    pub fn has_cipher(&self, name: &str) -> bool {
        self.ciphers.contains_key(name)
    }

    /// Whether a digest name is registered
    pub fn has_digest(&self, name: &str) -> bool {
        self.digests.contains_key(name)
    }

    /// Instantiate a cipher by name
    pub fn cipher(&self, name: &str, key: &[u8]) -> CryptoResult<Arc<dyn CipherTransform>> {
        let factory = self
            .ciphers
            .get(name)
            .ok_or_else(|| CryptoError::TransformUnavailable(name.to_string()))?;
        factory(key)
    }

    /// Instantiate a digest by name
    pub fn digest(&self, name: &str, key: &[u8]) -> CryptoResult<Arc<dyn DigestTransform>> {
        let factory = self
            .digests
            .get(name)
            .ok_or_else(|| CryptoError::TransformUnavailable(name.to_string()))?;
        factory(key)
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_transform() {
        let registry = TransformRegistry::with_defaults();
        let result = registry.cipher("blowfish", &[0u8; 16]);
        assert!(matches!(
            result,
            Err(CryptoError::TransformUnavailable(name)) if name == "blowfish"
        ));
    }

    #[test]
    fn test_defaults_registered() {
        let registry = TransformRegistry::with_defaults();
        assert!(registry.has_cipher("null"));
        assert!(registry.has_cipher("chacha20"));
        assert!(registry.has_digest("null"));
        assert!(registry.has_digest("hmac-sha256"));
    }

    #[test]
    fn test_bad_key_surfaces() {
        let registry = TransformRegistry::with_defaults();
        assert!(registry.cipher("chacha20", &[0u8; 7]).is_err());
    }
}
