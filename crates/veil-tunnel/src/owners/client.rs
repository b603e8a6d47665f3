//! Client pool owner: per-destination tunnel targets.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::config::{TunnelConfig, TunnelDirection, TunnelPool};
use crate::identity::IdentHash;
use crate::netdb::PeerSelectionRole;
use crate::owners::TunnelOwner;
use crate::provider::TunnelProvider;
use crate::tunnel::Tunnel;

#[derive(Default)]
struct DestinationTunnels {
    inbound: Mutex<Vec<u64>>,
    outbound: Mutex<Vec<u64>>,
}

impl DestinationTunnels {
    fn set(&self, direction: TunnelDirection) -> &Mutex<Vec<u64>> {
        match direction {
            TunnelDirection::Inbound => &self.inbound,
            TunnelDirection::Outbound => &self.outbound,
        }
    }

    fn add(&self, direction: TunnelDirection, sequence: u64) {
        if let Ok(mut set) = self.set(direction).lock() {
            if !set.contains(&sequence) {
                set.push(sequence);
            }
        }
    }

    fn remove(&self, direction: TunnelDirection, sequence: u64) {
        if let Ok(mut set) = self.set(direction).lock() {
            set.retain(|&s| s != sequence);
        }
    }

    fn count(&self, direction: TunnelDirection) -> usize {
        self.set(direction).lock().map(|set| set.len()).unwrap_or(0)
    }
}

/// Owner maintaining per-destination counts of client tunnels.
///
/// Deficits are over-built by the configured factor so that the expected
/// number of builds surviving rejection still meets the target.
pub struct ClientOwner {
    destinations: DashMap<IdentHash, DestinationTunnels>,
}

impl ClientOwner {
    /// Create an owner with no destinations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            destinations: DashMap::new(),
        }
    }

    /// Start maintaining tunnels for a destination.
    pub fn register_destination(&self, destination: IdentHash) {
        self.destinations
            .entry(destination)
            .or_insert_with(DestinationTunnels::default);
    }

    /// Stop maintaining tunnels for a destination.
    pub fn unregister_destination(&self, destination: &IdentHash) {
        self.destinations.remove(destination);
    }

    /// Current tunnel count for a destination and direction, pending
    /// builds included.
    #[must_use]
    pub fn tunnel_count(&self, destination: &IdentHash, direction: TunnelDirection) -> usize {
        self.destinations
            .get(destination)
            .map(|entry| entry.count(direction))
            .unwrap_or(0)
    }

    fn forget(&self, tunnel: &Arc<Tunnel>) {
        if let Some(destination) = tunnel.core().config.destination {
            if let Some(entry) = self.destinations.get(&destination) {
                entry.remove(tunnel.direction(), tunnel.core().sequence);
            }
        }
    }

    fn build_for(
        &self,
        provider: &TunnelProvider,
        me: &Arc<dyn TunnelOwner>,
        destination: IdentHash,
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
                settings.client_hops,
                PeerSelectionRole::Client,
            );
            if peers.len() < settings.client_hops {
                tracing::debug!(
                    destination = %destination,
                    "not enough peers for a client tunnel build"
                );
                return;
            }
            let config = match direction {
                TunnelDirection::Outbound => {
                    TunnelConfig::outbound(TunnelPool::Client, peers, Some(destination))
                }
                TunnelDirection::Inbound => TunnelConfig::inbound(
                    TunnelPool::Client,
                    peers,
                    provider.local_identity(),
                    Some(destination),
                ),
            };
            let Ok(config) = config else { return };
            if let Some(tunnel) = provider.create_tunnel(me, config) {
                if let Some(entry) = self.destinations.get(&destination) {
                    entry.add(direction, tunnel.core().sequence);
                }
            }
        }
    }
}

impl Default for ClientOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelOwner for ClientOwner {
    fn name(&self) -> &'static str {
        "client"
    }

    fn tunnel_established(&self, tunnel: &Arc<Tunnel>) {
        tracing::debug!(tunnel = tunnel.core().sequence, "client tunnel established");
    }

    fn tunnel_build_failed(&self, tunnel: &Arc<Tunnel>, was_timeout: bool) {
        tracing::debug!(
            tunnel = tunnel.core().sequence,
            was_timeout,
            "client tunnel build failed"
        );
        self.forget(tunnel);
    }

    fn tunnel_failed(&self, tunnel: &Arc<Tunnel>) {
        tracing::debug!(tunnel = tunnel.core().sequence, "client tunnel failed");
        self.forget(tunnel);
    }

    fn tunnel_expired(&self, tunnel: &Arc<Tunnel>) {
        tracing::debug!(tunnel = tunnel.core().sequence, "client tunnel expired");
        self.forget(tunnel);
    }

    fn maintain(&self, provider: &TunnelProvider, me: &Arc<dyn TunnelOwner>) {
        let settings = provider.settings();
        for entry in self.destinations.iter() {
            let destination = *entry.key();
            let inbound = entry.value().count(TunnelDirection::Inbound);
            let outbound = entry.value().count(TunnelDirection::Outbound);
            drop(entry);

            if inbound < settings.client_inbound_count {
                self.build_for(
                    provider,
                    me,
                    destination,
                    TunnelDirection::Inbound,
                    settings.client_inbound_count - inbound,
                );
            }
            if outbound < settings.client_outbound_count {
                self.build_for(
                    provider,
                    me,
                    destination,
                    TunnelDirection::Outbound,
                    settings.client_outbound_count - outbound,
                );
            }
        }
    }
}
