//! AES-256-CBC layer cipher with per-hop IV keying.
//!
//! Each tunnel hop holds two symmetric keys: a layer key for the CBC pass
//! over the payload window and an IV key that transforms the 16-byte IV
//! with a single AES block operation both before and after the payload
//! pass. Keying the IV prevents colluding non-adjacent hops from
//! correlating a message by its IV as it moves through the tunnel.
//!
//! The same CBC primitive layers build-reply records; there the IV travels
//! inside the record's reply material instead of on the wire, so
//! [`record_encrypt`]/[`record_decrypt`] take key and IV explicitly and
//! skip the IV transformation.

use crate::error::CryptoError;
use crate::random::random_32;
use aes::Aes256;
use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{
    BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Symmetric layer-encryption key (32 bytes), zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct LayerKey([u8; 32]);

impl LayerKey {
    /// Generate a fresh random layer key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self(random_32()?))
    }

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

/// Symmetric IV-obfuscation key (32 bytes), zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IvKey([u8; 32]);

impl IvKey {
    /// Generate a fresh random IV key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self(random_32()?))
    }

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

/// One hop's layer cipher: the pair of layer and IV keys.
pub struct LayerCipher {
    layer_key: LayerKey,
    iv_cipher: Aes256,
}

impl LayerCipher {
    /// Build a cipher from a hop's key pair.
    #[must_use]
    pub fn new(layer_key: &LayerKey, iv_key: &IvKey) -> Self {
        Self {
            layer_key: layer_key.clone(),
            iv_cipher: Aes256::new(GenericArray::from_slice(iv_key.as_bytes())),
        }
    }

    /// Apply this hop's encryption layer in place.
    ///
    /// The IV is transformed with the IV key, the payload is CBC-encrypted
    /// under the transformed IV, and the IV is transformed once more before
    /// it goes back on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NotBlockAligned`] if the payload length is not
    /// a multiple of the AES block size.
    pub fn encrypt(&self, iv: &mut [u8; 16], payload: &mut [u8]) -> Result<(), CryptoError> {
        self.iv_cipher.encrypt_block(GenericArray::from_mut_slice(iv));
        record_encrypt(self.layer_key.as_bytes(), iv, payload)?;
        self.iv_cipher.encrypt_block(GenericArray::from_mut_slice(iv));
        Ok(())
    }

    /// Remove this hop's encryption layer in place. Exact inverse of
    /// [`LayerCipher::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NotBlockAligned`] if the payload length is not
    /// a multiple of the AES block size.
    pub fn decrypt(&self, iv: &mut [u8; 16], payload: &mut [u8]) -> Result<(), CryptoError> {
        self.iv_cipher.decrypt_block(GenericArray::from_mut_slice(iv));
        record_decrypt(self.layer_key.as_bytes(), iv, payload)?;
        self.iv_cipher.decrypt_block(GenericArray::from_mut_slice(iv));
        Ok(())
    }
}

/// CBC-encrypt a single fixed-size record under an explicit key and IV.
/// Used for build-reply record layering.
///
/// # Errors
///
/// Returns [`CryptoError::NotBlockAligned`] if the record length is not a
/// multiple of the AES block size.
pub fn record_encrypt(key: &[u8; 32], iv: &[u8; 16], record: &mut [u8]) -> Result<(), CryptoError> {
    if record.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::NotBlockAligned(record.len()));
    }
    let len = record.len();
    let enc = Aes256CbcEnc::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
    enc.encrypt_padded_mut::<NoPadding>(record, len)
        .map_err(|_| CryptoError::NotBlockAligned(len))?;
    Ok(())
}

/// Inverse of [`record_encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::NotBlockAligned`] if the record length is not a
/// multiple of the AES block size.
pub fn record_decrypt(key: &[u8; 32], iv: &[u8; 16], record: &mut [u8]) -> Result<(), CryptoError> {
    if record.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::NotBlockAligned(record.len()));
    }
    let record_len = record.len();
    let dec = Aes256CbcDec::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
    dec.decrypt_padded_mut::<NoPadding>(record)
        .map_err(|_| CryptoError::NotBlockAligned(record_len))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> LayerCipher {
        LayerCipher::new(
            &LayerKey::from_bytes([7u8; 32]),
            &IvKey::from_bytes([11u8; 32]),
        )
    }

    #[test]
    fn test_layer_roundtrip() {
        let cipher = test_cipher();
        let mut iv = [3u8; 16];
        let mut payload = vec![0x42u8; 64];
        let original = payload.clone();

        cipher.encrypt(&mut iv, &mut payload).unwrap();
        assert_ne!(payload, original);

        cipher.decrypt(&mut iv, &mut payload).unwrap();
        assert_eq!(payload, original);
        assert_eq!(iv, [3u8; 16]);
    }

    #[test]
    fn test_layer_iv_transformed() {
        let cipher = test_cipher();
        let mut iv = [3u8; 16];
        let mut payload = vec![0u8; 16];
        cipher.encrypt(&mut iv, &mut payload).unwrap();
        assert_ne!(iv, [3u8; 16]);
    }

    #[test]
    fn test_nested_layers_peel_in_reverse() {
        let a = test_cipher();
        let b = LayerCipher::new(
            &LayerKey::from_bytes([21u8; 32]),
            &IvKey::from_bytes([22u8; 32]),
        );
        let mut iv = [0u8; 16];
        let mut payload = vec![9u8; 32];
        let original = payload.clone();

        a.encrypt(&mut iv, &mut payload).unwrap();
        b.encrypt(&mut iv, &mut payload).unwrap();
        b.decrypt(&mut iv, &mut payload).unwrap();
        a.decrypt(&mut iv, &mut payload).unwrap();
        assert_eq!(payload, original);
    }

    #[test]
    fn test_unaligned_payload_rejected() {
        let cipher = test_cipher();
        let mut iv = [0u8; 16];
        let mut payload = vec![0u8; 17];
        assert!(matches!(
            cipher.encrypt(&mut iv, &mut payload),
            Err(CryptoError::NotBlockAligned(17))
        ));
    }

    #[test]
    fn test_record_encrypt_roundtrip() {
        let key = [5u8; 32];
        let iv = [6u8; 16];
        let mut record = vec![1u8; 256];
        let original = record.clone();
        record_encrypt(&key, &iv, &mut record).unwrap();
        assert_ne!(record, original);
        record_decrypt(&key, &iv, &mut record).unwrap();
        assert_eq!(record, original);
    }
}
