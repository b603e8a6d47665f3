//! Error types for the VEIL tunnel subsystem.

use thiserror::Error;

/// Tunnel-level errors. These are caught at the per-tick boundary and
/// converted into a failed outcome for the tunnel; they never propagate
/// out of the scheduler loop.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Build record error
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// Fragmentation or reassembly error
    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] veil_crypto::CryptoError),

    /// A hop declined the build request
    #[error("build rejected by hop {0}")]
    BuildRejected(usize),

    /// No usable build reply arrived within the establishment deadline
    #[error("build timed out")]
    BuildTimeout,

    /// Operation requires an established tunnel
    #[error("tunnel not established")]
    NotEstablished,

    /// Operation is not valid for this tunnel role
    #[error("operation not supported by {0} tunnels")]
    WrongRole(&'static str),

    /// Outbound build attempted without a reply tunnel to route through
    #[error("outbound build requires a reply gateway")]
    MissingReplyGateway,

    /// The tunnel has been terminated
    #[error("tunnel terminated")]
    Terminated,

    /// The reassembly buffer grew past its hard ceiling
    #[error("fragment buffer exceeded ceiling ({0} fragments)")]
    BufferExhausted(usize),

    /// Relayed traffic exceeded the transit bandwidth allowance
    #[error("transit bandwidth limit exceeded")]
    BandwidthExceeded,
}

/// Errors in build-record handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Record has the wrong length
    #[error("record has wrong length: expected {expected}, got {actual}")]
    WrongLength {
        /// Expected record size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// No record in the build message matches this router
    #[error("no record matches this router")]
    NoMatchingRecord,

    /// More than one role classification applies; protocol violation
    #[error("ambiguous role flags in build record")]
    AmbiguousRole,

    /// The record's integrity hash does not verify
    #[error("record integrity hash mismatch for hop {0}")]
    IntegrityFailure(usize),

    /// Reply material for a hop was already consumed
    #[error("reply material already consumed for hop {0}")]
    ReplyConsumed(usize),

    /// Build message carries an invalid record count
    #[error("invalid record count: {0}")]
    BadRecordCount(usize),

    /// A tunnel ID field was zero
    #[error("zero tunnel id in record")]
    ZeroTunnelId,
}

/// Errors in fragmentation and reassembly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// Truncated checksum did not match the decrypted fragment area
    #[error("tunnel data checksum mismatch")]
    ChecksumMismatch,

    /// Fragment area could not be parsed
    #[error("malformed fragment area at offset {0}")]
    Malformed(usize),

    /// A logical message does not fit the fragment-count limit
    #[error("message needs {needed} fragments, limit is {limit}")]
    TooManyFragments {
        /// Fragments the message would need
        needed: usize,
        /// Maximum fragments per message
        limit: usize,
    },

    /// Payload too large for a single fragment slot
    #[error("fragment payload of {0} bytes exceeds window")]
    PayloadTooLarge(usize),

    /// Unknown delivery-instruction type byte
    #[error("unknown delivery type: 0x{0:02X}")]
    UnknownDeliveryType(u8),

    /// Wire message window has the wrong size
    #[error("window has wrong length: expected {expected}, got {actual}")]
    WrongWindowLength {
        /// Expected window size
        expected: usize,
        /// Actual size received
        actual: usize,
    },
}

/// Errors in wire-message encoding and decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Message too short to parse
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Invalid message type byte
    #[error("invalid message type: 0x{0:02X}")]
    InvalidType(u8),

    /// Declared body length disagrees with the buffer
    #[error("length mismatch")]
    LengthMismatch,
}
