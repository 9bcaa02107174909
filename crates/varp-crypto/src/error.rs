//! Crypto error types

use thiserror::Error;

/// Transform provider errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Requested transform name is not registered
    #[error("transform not available: {0}")]
    TransformUnavailable(String),

    /// Key length does not match the transform's requirement
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// IV length does not match the transform's requirement
    #[error("invalid IV length: expected {expected}, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },
}

/// Result type for transform operations
pub type CryptoResult<T> = Result<T, CryptoError>;
