//! # VEIL Crypto
//!
//! Cryptographic primitives for the VEIL tunnel layer.
//!
//! This crate provides:
//! - Sealed build records (X25519 + `XChaCha20-Poly1305`, ECIES-style)
//! - AES-256-CBC layer cipher with per-hop IV keying (onion layering)
//! - SHA-256 hashing, truncated checksums and record-matching prefixes
//! - Secure random number generation
//! - Take-once reply key material with zeroization on drop
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Record Sealing | X25519 + XChaCha20-Poly1305 | 128-bit |
//! | Layer Cipher | AES-256-CBC (IV keyed per hop) | 256-bit key |
//! | Hash / Checksum | SHA-256 | 128-bit collision |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod hash;
pub mod layer;
pub mod random;
pub mod record;
pub mod reply;

pub use error::CryptoError;
pub use hash::{HashOutput, checksum4, sha256, sha256_parts, trunc16};
pub use layer::{IvKey, LayerCipher, LayerKey, record_decrypt, record_encrypt};
pub use record::{RecordKeypair, RecordPublicKey, SEAL_OVERHEAD, open_record, seal_record};
pub use reply::{ReplyMaterial, ReplyOnce};

/// X25519 public key size
pub const RECORD_KEY_SIZE: usize = 32;

/// AES layer key size
pub const LAYER_KEY_SIZE: usize = 32;

/// AES-CBC initialization vector size
pub const LAYER_IV_SIZE: usize = 16;

/// SHA-256 output size
pub const SHA256_OUTPUT_SIZE: usize = 32;

/// Truncated checksum size carried by tunnel-data messages
pub const CHECKSUM_SIZE: usize = 4;

/// Truncated identity-hash prefix used for record matching
pub const TRUNC_HASH_SIZE: usize = 16;
