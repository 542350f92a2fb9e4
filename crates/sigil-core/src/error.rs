//! Error types for ceremony primitives and services

use thiserror::Error;

/// Result type alias for ceremony operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a ceremony primitive
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid participant or ceremony configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Message received from a participant outside the ceremony
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Conversion between wire and curve-native representations failed
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Malformed primitive message
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// A share or commitment failed verification
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// The primitive reached its failed terminal state
    #[error("TSS process failed")]
    TssProcessFailed,

    /// The combined signature did not verify against the wallet key
    #[error("Invalid signature")]
    InvalidSignature,

    /// The supplied shares do not reconstruct the wallet key
    #[error("Invalid shares")]
    InvalidShares,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Deserialization(e.to_string())
    }
}
