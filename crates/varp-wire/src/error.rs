//! Wire format errors

use thiserror::Error;

/// Errors decoding or encoding wire data.
///
/// Receive paths treat all of these as drop-and-count; none is fatal.
#[derive(Debug, Error)]
pub enum FormatError {
    /// Buffer shorter than the fixed header it must contain
    #[error("truncated: need at least {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// Version nibble does not match the configured encapsulation mode
    #[error("bad version nibble: {0:#x}")]
    BadVersion(u8),

    /// Trailer padding is inconsistent with the decrypted length
    #[error("bad trailer padding")]
    BadPadding,

    /// Integrity check value mismatch
    #[error("integrity check failed")]
    IntegrityCheckFailed,

    /// Discriminator kind is not one we speak
    #[error("unknown message kind: {0:#06x}")]
    UnknownKind(u16),

    /// Resolution protocol opcode is not request/announce
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u16),

    /// Address family byte is not IPv4/IPv6
    #[error("unknown address family: {0}")]
    UnknownFamily(u8),

    /// Transform failure while applying the security framing
    #[error("crypto: {0}")]
    Crypto(#[from] varp_crypto::CryptoError),
}

/// Result type for codec operations
pub type WireResult<T> = Result<T, FormatError>;
