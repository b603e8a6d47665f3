//! Error types for the VEIL cryptographic primitives.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// OS random source failed
    #[error("system random source failed")]
    RandomFailed,

    /// Record sealing failed
    #[error("record sealing failed")]
    SealFailed,

    /// Record could not be opened (wrong key or tampered)
    #[error("record could not be opened")]
    OpenFailed,

    /// Low-order point rejected during key exchange
    #[error("low-order public key rejected")]
    LowOrderPoint,

    /// Input has the wrong length
    #[error("bad length: expected {expected}, got {actual}")]
    BadLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length received
        actual: usize,
    },

    /// Payload length is not a multiple of the cipher block size
    #[error("payload not block-aligned: {0} bytes")]
    NotBlockAligned(usize),
}
