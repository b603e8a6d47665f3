//! Tunnel configuration: direction, pool and the ordered hop chain.

use veil_crypto::CryptoError;

use crate::hop::Hop;
use crate::identity::{IdentHash, PeerIdentity, RouterIdentity};

/// Direction of a tunnel relative to this router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelDirection {
    /// Traffic flows toward this router.
    Inbound,
    /// Traffic flows away from this router.
    Outbound,
}

/// Pool classification of a tunnel's purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelPool {
    /// Per-destination client traffic.
    Client,
    /// Router-wide discovery and reply tunnels.
    Exploratory,
    /// Relaying for other routers.
    Transit,
}

/// Immutable configuration a tunnel is constructed from.
///
/// Hops are stored in data-flow order: the first element is the hop a
/// message reaches first. For inbound tunnels the final element is this
/// router itself.
pub struct TunnelConfig {
    /// Direction of the chain.
    pub direction: TunnelDirection,
    /// Pool the tunnel belongs to.
    pub pool: TunnelPool,
    /// Ordered hop chain in data-flow order.
    pub hops: Vec<Hop>,
    /// Destination this tunnel serves, for client-pool grouping.
    pub destination: Option<IdentHash>,
}

impl TunnelConfig {
    /// Configuration for an outbound tunnel through the given peers.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if key generation fails.
    pub fn outbound(
        pool: TunnelPool,
        peers: Vec<PeerIdentity>,
        destination: Option<IdentHash>,
    ) -> Result<Self, CryptoError> {
        let hops = peers.into_iter().map(Hop::new).collect::<Result<_, _>>()?;
        Ok(Self {
            direction: TunnelDirection::Outbound,
            pool,
            hops,
            destination,
        })
    }

    /// Configuration for an inbound tunnel through the given peers.
    /// Appends this router as the terminal hop of the chain.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if key generation fails.
    pub fn inbound(
        pool: TunnelPool,
        peers: Vec<PeerIdentity>,
        local: &RouterIdentity,
        destination: Option<IdentHash>,
    ) -> Result<Self, CryptoError> {
        let mut hops: Vec<Hop> = peers.into_iter().map(Hop::new).collect::<Result<_, _>>()?;
        hops.push(Hop::new_terminal(local.as_peer())?);
        Ok(Self {
            direction: TunnelDirection::Inbound,
            pool,
            hops,
            destination,
        })
    }

    /// Number of relay hops, excluding this router's own terminal entry
    /// on inbound chains.
    #[must_use]
    pub fn relay_hop_count(&self) -> usize {
        match self.direction {
            TunnelDirection::Outbound => self.hops.len(),
            TunnelDirection::Inbound => self.hops.len().saturating_sub(1),
        }
    }
}
