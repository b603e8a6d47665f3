//! Router identities and tunnel identifiers.

use veil_crypto::record::{RecordKeypair, RecordPublicKey};
use veil_crypto::{random, sha256, trunc16};

/// SHA-256 hash identifying a router (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentHash([u8; 32]);

impl IdentHash {
    /// Import from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw hash bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Truncated 16-byte prefix used for build-record matching.
    #[must_use]
    pub fn trunc(&self) -> [u8; 16] {
        trunc16(&self.0)
    }
}

impl std::fmt::Debug for IdentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentHash({})", hex::encode(&self.0[..6]))
    }
}

impl std::fmt::Display for IdentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

/// Identifier a hop assigns to its slot of a tunnel. Nonzero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(u32);

impl TunnelId {
    /// Wrap a raw ID. Zero is reserved and never assigned.
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Generate a random nonzero tunnel ID.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, veil_crypto::CryptoError> {
        Ok(Self(random::random_nonzero_u32()?))
    }

    /// Raw ID value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Debug for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TunnelId({})", self.0)
    }
}

impl std::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Another router as seen by the tunnel layer: its identity hash and the
/// public key build records are sealed to.
#[derive(Clone, Debug)]
pub struct PeerIdentity {
    /// Identity hash of the peer.
    pub hash: IdentHash,
    /// Public record key of the peer.
    pub record_key: RecordPublicKey,
}

/// This router's own identity: record keypair plus derived hash.
pub struct RouterIdentity {
    keypair: RecordKeypair,
    hash: IdentHash,
}

impl RouterIdentity {
    /// Generate a fresh router identity.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, veil_crypto::CryptoError> {
        let keypair = RecordKeypair::generate()?;
        let hash = IdentHash::from_bytes(sha256(keypair.public_key().as_bytes()));
        Ok(Self { keypair, hash })
    }

    /// Identity hash derived from the public record key.
    #[must_use]
    pub fn hash(&self) -> IdentHash {
        self.hash
    }

    /// Record keypair for opening build records sealed to this router.
    #[must_use]
    pub fn keypair(&self) -> &RecordKeypair {
        &self.keypair
    }

    /// The public view other routers hold of this one.
    #[must_use]
    pub fn as_peer(&self) -> PeerIdentity {
        PeerIdentity {
            hash: self.hash,
            record_key: self.keypair.public_key(),
        }
    }
}
