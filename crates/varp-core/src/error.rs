//! Core error types

use thiserror::Error;
use varp_wire::VnetId;

/// Errors creating a security association
#[derive(Debug, Error)]
pub enum CreateError {
    /// Allocation failed
    #[error("out of memory")]
    OutOfMemory,

    /// Requested cipher/digest name is not registered
    #[error("transform not available: {0}")]
    TransformUnavailable(String),

    /// No collision-free SPI found within the retry budget
    #[error("no free spi after {0} attempts")]
    SpiExhausted(u32),

    /// Caller-supplied SPI already taken
    #[error("spi {0:#010x} already in use")]
    SpiInUse(u32),
}

/// Errors replacing a security association on rekey
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplaceError {
    /// Only acquire-state associations may be replaced
    #[error("association is not in acquire state")]
    InvalidState,
}

/// Errors on the tunnel send path
#[derive(Debug, Error)]
pub enum SendError {
    /// No usable route/tunnel/association for the destination
    #[error("no route to destination")]
    NoRoute,

    /// The underlying transport failed
    #[error("transport failure: {0}")]
    TransportFailure(String),
}

/// Core errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Lookup miss where existence was required
    #[error("not found")]
    NotFound,

    /// Association creation failed
    #[error(transparent)]
    Create(#[from] CreateError),

    /// Association replacement failed
    #[error(transparent)]
    Replace(#[from] ReplaceError),

    /// Send failed
    #[error(transparent)]
    Send(#[from] SendError),

    /// Malformed wire data
    #[error("wire format: {0}")]
    Format(#[from] varp_wire::FormatError),

    /// Transform provider failure
    #[error("crypto: {0}")]
    Crypto(#[from] varp_crypto::CryptoError),

    /// Virtual network already registered
    #[error("vnet already exists: {0}")]
    VnetExists(VnetId),

    /// Inbound sequence number rejected by the replay window
    #[error("replay window rejected sequence {0}")]
    ReplayRejected(u32),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
