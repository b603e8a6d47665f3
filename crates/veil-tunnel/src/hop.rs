//! One member of a tunnel chain.

use veil_crypto::reply::{ReplyMaterial, ReplyOnce};
use veil_crypto::{IvKey, LayerCipher, LayerKey};

use crate::error::RecordError;
use crate::identity::{PeerIdentity, TunnelId};

/// One hop of a tunnel: the peer, its assigned tunnel ID for this chain,
/// and the symmetric layer keys established during the build.
///
/// Hops are created once at tunnel-config time and immutable thereafter,
/// except the reply-processing material, which is taken exactly once when
/// the build reply is unwound.
pub struct Hop {
    /// The peer relaying at this position.
    pub peer: PeerIdentity,
    /// Tunnel ID the hop listens on for this chain.
    pub tunnel_id: TunnelId,
    /// Layer-encryption key assigned to the hop.
    pub layer_key: LayerKey,
    /// IV-obfuscation key assigned to the hop.
    pub iv_key: IvKey,
    reply: Option<ReplyOnce>,
    reply_record_index: Option<usize>,
}

impl Hop {
    /// Create a hop with freshly generated tunnel ID and layer keys, and
    /// reply material for build-reply unwinding.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if the OS CSPRNG fails.
    pub fn new(peer: PeerIdentity) -> Result<Self, veil_crypto::CryptoError> {
        Ok(Self {
            peer,
            tunnel_id: TunnelId::generate()?,
            layer_key: LayerKey::generate()?,
            iv_key: IvKey::generate()?,
            reply: Some(ReplyOnce::new(ReplyMaterial::generate()?)),
            reply_record_index: None,
        })
    }

    /// Create a hop without reply material. Used for the self entry at
    /// the end of an inbound chain and for zero-hop tunnels.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if the OS CSPRNG fails.
    pub fn new_terminal(peer: PeerIdentity) -> Result<Self, veil_crypto::CryptoError> {
        Ok(Self {
            peer,
            tunnel_id: TunnelId::generate()?,
            layer_key: LayerKey::generate()?,
            iv_key: IvKey::generate()?,
            reply: None,
            reply_record_index: None,
        })
    }

    /// The layer cipher for this hop's keys.
    #[must_use]
    pub fn cipher(&self) -> LayerCipher {
        LayerCipher::new(&self.layer_key, &self.iv_key)
    }

    /// Run a closure against the reply material without consuming it.
    /// Used while preparing the outgoing build request; returns `None`
    /// once the material has been taken.
    pub fn with_reply<T>(&self, f: impl FnOnce(&ReplyMaterial) -> T) -> Option<T> {
        self.reply.as_ref().and_then(|slot| slot.with_material(f))
    }

    /// Take the reply material for unwinding the build reply. Second and
    /// later calls fail: reuse of reply material is a protocol violation.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::ReplyConsumed`] if the material was already
    /// taken or never assigned.
    pub fn take_reply(&self, index: usize) -> Result<ReplyMaterial, RecordError> {
        self.reply
            .as_ref()
            .and_then(ReplyOnce::take)
            .ok_or(RecordError::ReplyConsumed(index))
    }

    /// Record which slot of the build message carries this hop's record.
    pub fn set_record_index(&mut self, index: usize) {
        self.reply_record_index = Some(index);
    }

    /// Slot of the build message carrying this hop's record.
    #[must_use]
    pub fn record_index(&self) -> Option<usize> {
        self.reply_record_index
    }
}
