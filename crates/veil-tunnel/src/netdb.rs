//! Interface to the network-database collaborator.
//!
//! Peer discovery, storage and reputation live outside this subsystem.
//! The tunnel layer consumes them through this narrow trait: candidate
//! peers for builds, identity lookup, and reputation signals recorded
//! against peers as build and test outcomes arrive.

use std::collections::HashSet;

use crate::identity::{IdentHash, PeerIdentity};

/// Role a candidate peer is being selected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSelectionRole {
    /// Any position of a client tunnel.
    Client,
    /// Any position of an exploratory tunnel.
    Exploratory,
}

/// The network database as seen by the tunnel layer.
pub trait NetworkDatabase: Send + Sync {
    /// Select candidate peers for a tunnel build, excluding the given set.
    /// May return fewer than `count` peers.
    fn select_peers_for_tunnel_build(
        &self,
        exclude: &HashSet<IdentHash>,
        count: usize,
        role: PeerSelectionRole,
    ) -> Vec<PeerIdentity>;

    /// Look up a peer's identity by hash.
    fn peer_info(&self, hash: &IdentHash) -> Option<PeerIdentity>;

    /// A peer accepted a tunnel build.
    fn record_tunnel_member_success(&self, hash: &IdentHash);

    /// A peer declined a tunnel build.
    fn record_tunnel_member_declined(&self, hash: &IdentHash);

    /// Per-hop build time observed through a peer, in milliseconds.
    fn record_build_time_per_hop(&self, hash: &IdentHash, ms: u64);

    /// A peer's record failed an integrity check; its information is
    /// suspect.
    fn record_information_faulty(&self, hash: &IdentHash);
}
