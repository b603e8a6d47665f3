//! Exploratory pool owner: router-wide discovery and reply tunnels.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::config::{TunnelConfig, TunnelDirection, TunnelPool};
use crate::identity::IdentHash;
use crate::netdb::PeerSelectionRole;
use crate::owners::TunnelOwner;
use crate::provider::TunnelProvider;
use crate::tunnel::Tunnel;

/// Owner maintaining the router-wide exploratory pool. Same policy shape
/// as the client owner, without per-destination grouping.
pub struct ExploratoryOwner {
    inbound: Mutex<Vec<u64>>,
    outbound: Mutex<Vec<u64>>,
}

impl ExploratoryOwner {
    /// Create the exploratory owner.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(Vec::new()),
            outbound: Mutex::new(Vec::new()),
        }
    }

    fn set(&self, direction: TunnelDirection) -> &Mutex<Vec<u64>> {
        match direction {
            TunnelDirection::Inbound => &self.inbound,
            TunnelDirection::Outbound => &self.outbound,
        }
    }

    /// Current tunnel count for a direction, pending builds included.
    #[must_use]
    pub fn tunnel_count(&self, direction: TunnelDirection) -> usize {
        self.set(direction).lock().map(|set| set.len()).unwrap_or(0)
    }

    fn forget(&self, tunnel: &Arc<Tunnel>) {
        let sequence = tunnel.core().sequence;
        if let Ok(mut set) = self.set(tunnel.direction()).lock() {
            set.retain(|&s| s != sequence);
        }
    }

    fn build(
        &self,
        provider: &TunnelProvider,
        me: &Arc<dyn TunnelOwner>,
        direction: TunnelDirection,
        deficit: usize,
    ) {
        let settings = provider.settings();
        let builds = deficit * settings.overbuild_factor.max(1);
        for _ in 0..builds {
            let mut exclude: HashSet<IdentHash> = HashSet::new();
            exclude.insert(provider.local_hash());
            let peers = provider.netdb().select_peers_for_tunnel_build(
                &exclude,
                settings.exploratory_hops,
                PeerSelectionRole::Exploratory,
            );
            if peers.len() < settings.exploratory_hops {
                tracing::debug!("not enough peers for an exploratory tunnel build");
                return;
            }
            let config = match direction {
                TunnelDirection::Outbound => {
                    TunnelConfig::outbound(TunnelPool::Exploratory, peers, None)
                }
                TunnelDirection::Inbound => TunnelConfig::inbound(
                    TunnelPool::Exploratory,
                    peers,
                    provider.local_identity(),
                    None,
                ),
            };
            let Ok(config) = config else { return };
            if let Some(tunnel) = provider.create_tunnel(me, config) {
                if let Ok(mut set) = self.set(direction).lock() {
                    set.push(tunnel.core().sequence);
                }
            }
        }
    }
}

impl Default for ExploratoryOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelOwner for ExploratoryOwner {
    fn name(&self) -> &'static str {
        "exploratory"
    }

    fn tunnel_established(&self, tunnel: &Arc<Tunnel>) {
        tracing::debug!(
            tunnel = tunnel.core().sequence,
            "exploratory tunnel established"
        );
    }

    fn tunnel_build_failed(&self, tunnel: &Arc<Tunnel>, was_timeout: bool) {
        tracing::debug!(
            tunnel = tunnel.core().sequence,
            was_timeout,
            "exploratory tunnel build failed"
        );
        self.forget(tunnel);
    }

    fn tunnel_failed(&self, tunnel: &Arc<Tunnel>) {
        tracing::debug!(tunnel = tunnel.core().sequence, "exploratory tunnel failed");
        self.forget(tunnel);
    }

    fn tunnel_expired(&self, tunnel: &Arc<Tunnel>) {
        tracing::debug!(tunnel = tunnel.core().sequence, "exploratory tunnel expired");
        self.forget(tunnel);
    }

    fn maintain(&self, provider: &TunnelProvider, me: &Arc<dyn TunnelOwner>) {
        let settings = provider.settings();
        let target = settings.exploratory_count;
        for direction in [TunnelDirection::Inbound, TunnelDirection::Outbound] {
            let live = self.tunnel_count(direction);
            if live < target {
                self.build(provider, me, direction, target - live);
            }
        }
    }
}
