//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown frame type
    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// A fixed-size body was shorter or longer than its layout
    #[error("Malformed {what}: expected {expected} bytes, got {actual}")]
    Malformed {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Bytes do not form a valid secp256k1 public key
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Bytes do not form a valid secp256k1 secret key
    #[error("Invalid secret key")]
    InvalidSecretKey,

    /// Signature failed to parse or verify
    #[error("Invalid signature")]
    InvalidSignature,

    /// Hex decoding error
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
