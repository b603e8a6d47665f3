//! Sealed build records: X25519 + `XChaCha20-Poly1305`.
//!
//! Build request records are asymmetrically encrypted to a hop's public
//! record key so only that hop can read its slot of the build message.
//! Sealing is ECIES-style: an ephemeral X25519 exchange derives a one-use
//! AEAD key, and the record is encrypted with `XChaCha20-Poly1305`.
//!
//! Sealed layout (fixed overhead, so sealed records stay block-aligned
//! for the symmetric onion layering applied on top of them):
//!
//! ```text
//! ephemeral public key (32) | nonce (24) | ciphertext + tag (plaintext + 16)
//! ```

use crate::error::CryptoError;
use crate::hash::sha256_parts;
use crate::random::fill_random;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Ephemeral-key + nonce + tag bytes added by sealing.
pub const SEAL_OVERHEAD: usize = 32 + 24 + 16;

/// X25519 public key a build record is sealed to.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecordPublicKey([u8; 32]);

impl RecordPublicKey {
    /// Import from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for RecordPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordPublicKey({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// A router's long-lived record keypair.
pub struct RecordKeypair {
    secret: SecretBytes,
    public: RecordPublicKey,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SecretBytes([u8; 32]);

impl RecordKeypair {
    /// Generate a fresh keypair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut secret = [0u8; 32];
        fill_random(&mut secret)?;
        Ok(Self::from_secret_bytes(secret))
    }

    /// Build a keypair from raw secret bytes (clamped per RFC 7748).
    #[must_use]
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let static_secret = x25519_dalek::StaticSecret::from(secret);
        let public = x25519_dalek::PublicKey::from(&static_secret);
        Self {
            secret: SecretBytes(static_secret.to_bytes()),
            public: RecordPublicKey(*public.as_bytes()),
        }
    }

    /// Public half of the keypair.
    #[must_use]
    pub fn public_key(&self) -> RecordPublicKey {
        self.public
    }

    fn exchange(&self, peer: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        let secret = x25519_dalek::StaticSecret::from(self.secret.0);
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(*peer));
        if shared.as_bytes() == &[0u8; 32] {
            return Err(CryptoError::LowOrderPoint);
        }
        Ok(*shared.as_bytes())
    }
}

/// Derive the one-use AEAD key for a sealed record.
fn derive_seal_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    sha256_parts(&[shared, ephemeral, recipient])
}

/// Seal a plaintext record to a hop's public record key.
///
/// Output length is `plaintext.len() + SEAL_OVERHEAD`.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the CSPRNG fails,
/// [`CryptoError::LowOrderPoint`] for a degenerate recipient key, or
/// [`CryptoError::SealFailed`] if AEAD encryption fails.
pub fn seal_record(to: &RecordPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut eph_secret = [0u8; 32];
    fill_random(&mut eph_secret)?;
    let ephemeral = x25519_dalek::StaticSecret::from(eph_secret);
    eph_secret.zeroize();

    let eph_public = x25519_dalek::PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&x25519_dalek::PublicKey::from(*to.as_bytes()));
    if shared.as_bytes() == &[0u8; 32] {
        return Err(CryptoError::LowOrderPoint);
    }

    let key = derive_seal_key(shared.as_bytes(), eph_public.as_bytes(), to.as_bytes());
    let mut nonce = [0u8; 24];
    fill_random(&mut nonce)?;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::SealFailed)?;

    let mut sealed = Vec::with_capacity(plaintext.len() + SEAL_OVERHEAD);
    sealed.extend_from_slice(eph_public.as_bytes());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed record with the recipient's keypair.
///
/// # Errors
///
/// Returns [`CryptoError::BadLength`] if the input is shorter than the seal
/// overhead, [`CryptoError::LowOrderPoint`] for a degenerate ephemeral key,
/// or [`CryptoError::OpenFailed`] if authentication fails (wrong recipient
/// or tampered record).
pub fn open_record(keypair: &RecordKeypair, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(CryptoError::BadLength {
            expected: SEAL_OVERHEAD,
            actual: sealed.len(),
        });
    }

    let mut eph_public = [0u8; 32];
    eph_public.copy_from_slice(&sealed[..32]);
    let nonce = &sealed[32..56];
    let ciphertext = &sealed[56..];

    let shared = keypair.exchange(&eph_public)?;
    let key = derive_seal_key(&shared, &eph_public, keypair.public.as_bytes());

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::OpenFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let keypair = RecordKeypair::generate().unwrap();
        let sealed = seal_record(&keypair.public_key(), b"request record").unwrap();
        assert_eq!(sealed.len(), b"request record".len() + SEAL_OVERHEAD);

        let opened = open_record(&keypair, &sealed).unwrap();
        assert_eq!(opened, b"request record");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let keypair = RecordKeypair::generate().unwrap();
        let other = RecordKeypair::generate().unwrap();
        let sealed = seal_record(&keypair.public_key(), b"request record").unwrap();
        assert_eq!(open_record(&other, &sealed), Err(CryptoError::OpenFailed));
    }

    #[test]
    fn test_tampered_record_fails() {
        let keypair = RecordKeypair::generate().unwrap();
        let mut sealed = seal_record(&keypair.public_key(), b"request record").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(open_record(&keypair, &sealed), Err(CryptoError::OpenFailed));
    }

    #[test]
    fn test_short_input_rejected() {
        let keypair = RecordKeypair::generate().unwrap();
        assert!(matches!(
            open_record(&keypair, &[0u8; 10]),
            Err(CryptoError::BadLength { .. })
        ));
    }
}
