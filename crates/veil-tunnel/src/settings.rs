//! Tunnel subsystem settings.
//!
//! Plain scalar settings injected at construction. Loading them from a
//! configuration file or CLI is the host router's concern.

use std::time::Duration;

/// Settings for the tunnel subsystem.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Target number of inbound client tunnels per destination.
    pub client_inbound_count: usize,

    /// Target number of outbound client tunnels per destination.
    pub client_outbound_count: usize,

    /// Hops per client tunnel.
    pub client_hops: usize,

    /// Target number of exploratory tunnels per direction, router-wide.
    pub exploratory_count: usize,

    /// Hops per exploratory tunnel.
    pub exploratory_hops: usize,

    /// Over-build factor applied to build deficits to absorb failures.
    pub overbuild_factor: usize,

    /// Maximum transit tunnels this router will relay for others.
    pub max_transit_tunnels: usize,

    /// Bytes per second each transit tunnel may relay.
    pub transit_bandwidth_per_tunnel: u64,

    /// Nominal tunnel lifetime.
    pub lifetime: Duration,

    /// Per-hop margin before expiry at which a replacement should exist.
    pub recreation_margin_per_hop: Duration,

    /// Per-hop build-time allowance for the establishment timeout.
    pub per_hop_build_timeout: Duration,

    /// Whether this router believes it is firewalled; firewalled routers
    /// get a doubled per-hop build allowance.
    pub firewalled: bool,

    /// Per-hop round-trip budget for liveness probes.
    pub per_hop_test_budget: Duration,

    /// Partner results collected per liveness test run.
    pub test_partner_count: usize,

    /// Outstanding probes older than this count as failures.
    pub max_test_run_time: Duration,

    /// Idle window after which a partial fragment buffer is evicted.
    pub fragment_eviction_window: Duration,

    /// Hard ceiling on buffered fragments per tunnel before teardown.
    pub max_buffered_fragments: usize,

    /// Window a transit build request's reduced hash is remembered for
    /// replay rejection.
    pub transit_replay_window: Duration,

    /// Fixed lifetime of the zero-hop fallback tunnel.
    pub zero_hop_lifetime: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            client_inbound_count: 2,
            client_outbound_count: 2,
            client_hops: 3,
            exploratory_count: 2,
            exploratory_hops: 2,
            overbuild_factor: 2,
            max_transit_tunnels: 500,
            transit_bandwidth_per_tunnel: 64 * 1024,
            lifetime: Duration::from_secs(600),
            recreation_margin_per_hop: Duration::from_secs(15),
            per_hop_build_timeout: Duration::from_secs(10),
            firewalled: false,
            per_hop_test_budget: Duration::from_secs(2),
            test_partner_count: 5,
            max_test_run_time: Duration::from_secs(30),
            fragment_eviction_window: Duration::from_secs(600),
            max_buffered_fragments: 512,
            transit_replay_window: Duration::from_secs(120),
            zero_hop_lifetime: Duration::from_secs(120),
        }
    }
}

impl TunnelSettings {
    /// Establishment timeout for a tunnel with the given hop count.
    #[must_use]
    pub fn establishment_timeout(&self, hops: usize) -> Duration {
        let per_hop = if self.firewalled {
            self.per_hop_build_timeout * 2
        } else {
            self.per_hop_build_timeout
        };
        per_hop * hops.max(1) as u32
    }

    /// Recreation margin for a tunnel with the given hop count.
    #[must_use]
    pub fn recreation_margin(&self, hops: usize) -> Duration {
        self.recreation_margin_per_hop * hops.max(1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firewalled_doubles_timeout() {
        let open = TunnelSettings::default();
        let firewalled = TunnelSettings {
            firewalled: true,
            ..Default::default()
        };
        assert_eq!(
            firewalled.establishment_timeout(3),
            open.establishment_timeout(3) * 2
        );
    }

    #[test]
    fn test_margin_scales_with_hops() {
        let settings = TunnelSettings::default();
        assert!(settings.recreation_margin(3) > settings.recreation_margin(1));
    }
}
