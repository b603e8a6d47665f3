//! Take-once reply key material for build-reply processing.
//!
//! The creator of a tunnel assigns each hop a reply key and IV, used
//! exactly once to unwind that hop's layer of the build reply. Reuse of
//! reply material is a correctness and security violation, so the
//! material lives behind [`ReplyOnce`]: it can be taken a single time and
//! is zeroed when the taken value is dropped.

use std::sync::Mutex;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::random::{fill_random, random_16};

/// One hop's reply key and IV, zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ReplyMaterial {
    /// AES-256 key the hop layers the build reply with.
    pub key: [u8; 32],
    /// CBC IV paired with the key.
    pub iv: [u8; 16],
}

impl ReplyMaterial {
    /// Generate fresh reply material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut key = [0u8; 32];
        fill_random(&mut key)?;
        Ok(Self {
            key,
            iv: random_16()?,
        })
    }
}

/// Write-once, take-once holder for [`ReplyMaterial`].
///
/// Taking consumes the slot; a second take returns `None`, which makes
/// accidental reuse an observable error instead of a silent key reuse.
pub struct ReplyOnce(Mutex<Option<ReplyMaterial>>);

impl ReplyOnce {
    /// Wrap freshly generated material.
    #[must_use]
    pub fn new(material: ReplyMaterial) -> Self {
        Self(Mutex::new(Some(material)))
    }

    /// Take the material out, leaving the slot empty.
    pub fn take(&self) -> Option<ReplyMaterial> {
        self.0.lock().ok()?.take()
    }

    /// Run a closure against the material without consuming it.
    ///
    /// This is the build-time read path: the creator writes the key and IV
    /// into the hop's request record and pre-layers the build message with
    /// them. Returns `None` once the material has been taken.
    pub fn with_material<T>(&self, f: impl FnOnce(&ReplyMaterial) -> T) -> Option<T> {
        let guard = self.0.lock().ok()?;
        guard.as_ref().map(f)
    }

    /// Whether the material has already been consumed.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.0.lock().map(|guard| guard.is_none()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_once() {
        let slot = ReplyOnce::new(ReplyMaterial::generate().unwrap());
        assert!(!slot.is_consumed());
        assert!(slot.take().is_some());
        assert!(slot.is_consumed());
        assert!(slot.take().is_none());
    }
}
