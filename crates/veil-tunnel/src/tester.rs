//! Background liveness testing of established tunnels.
//!
//! A test run pairs the tunnel under test with up to N partner tunnels of
//! the opposite direction and sends a delivery-status probe through each
//! pair. A probe passes when the round trip completes within the per-hop
//! budget times the pair's total hop count. The run concludes after N
//! results: the tunnel is marked live if it collected at least one pass
//! and no more failures than passes; otherwise it is forcibly retired,
//! whatever its nominal expiry. Partner tunnels tally every run they take
//! part in, amortizing test cost across the whole pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use veil_crypto::random::random_nonzero_u32;

use crate::config::TunnelDirection;
use crate::frag::DeliveryInstruction;
use crate::messages::{MessageEnvelope, WireMessage, default_expiration, now_ms};
use crate::provider::TunnelProvider;
use crate::tunnel::Tunnel;

/// One outstanding liveness probe.
pub struct TestProbe {
    /// Delivery-status ID the reply must carry.
    pub status_id: u32,
    /// Sequence of the tunnel under test.
    pub tunnel_seq: u64,
    /// Sequence of the partner tunnel.
    pub partner_seq: u64,
    /// Combined relay hop count of the pair.
    pub total_hops: usize,
    /// When the probe was sent.
    pub sent_at: Instant,
}

struct TestRun {
    target: usize,
    passes: u32,
    failures: u32,
}

/// Liveness prober for established client and exploratory tunnels.
pub struct TunnelTester {
    probes: DashMap<u32, TestProbe>,
    runs: DashMap<u64, TestRun>,
    last_tested: DashMap<u64, Instant>,
}

impl TunnelTester {
    /// Create an idle tester.
    #[must_use]
    pub fn new() -> Self {
        Self {
            probes: DashMap::new(),
            runs: DashMap::new(),
            last_tested: DashMap::new(),
        }
    }

    /// Outstanding probe count.
    #[must_use]
    pub fn outstanding_probes(&self) -> usize {
        self.probes.len()
    }

    /// Whether a run is in flight for the given tunnel.
    #[must_use]
    pub fn run_in_flight(&self, tunnel_seq: u64) -> bool {
        self.runs.contains_key(&tunnel_seq)
    }

    /// Start a test run for the tunnel, pairing it with up to the
    /// configured number of opposite-direction partners. Returns the
    /// number of probes sent; zero if no partners are available or a run
    /// is already in flight.
    pub fn start_run(&self, provider: &TunnelProvider, tunnel: &Arc<Tunnel>) -> usize {
        let sequence = tunnel.core().sequence;
        if self.runs.contains_key(&sequence) {
            return 0;
        }
        let partner_direction = match tunnel.direction() {
            TunnelDirection::Outbound => TunnelDirection::Inbound,
            TunnelDirection::Inbound => TunnelDirection::Outbound,
        };
        let partners = provider.test_partner_candidates(partner_direction, sequence);
        if partners.is_empty() {
            return 0;
        }

        let mut sent = 0;
        for partner in partners
            .iter()
            .take(provider.settings().test_partner_count)
        {
            if self.send_probe(tunnel, partner).is_some() {
                sent += 1;
            }
        }
        if sent > 0 {
            self.runs.insert(
                sequence,
                TestRun {
                    target: sent,
                    passes: 0,
                    failures: 0,
                },
            );
            self.last_tested.insert(sequence, Instant::now());
        }
        sent
    }

    fn send_probe(&self, tunnel: &Arc<Tunnel>, partner: &Arc<Tunnel>) -> Option<u32> {
        // The probe always flows out through the outbound half of the
        // pair and back in through the inbound half's gateway.
        let (outbound, inbound) = match tunnel.direction() {
            TunnelDirection::Outbound => (tunnel, partner),
            TunnelDirection::Inbound => (partner, tunnel),
        };
        let (gateway, gateway_tunnel) = inbound.gateway()?;
        let status_id = random_nonzero_u32().ok()?;
        let envelope = MessageEnvelope {
            id: status_id,
            expiration_ms: default_expiration(),
            body: WireMessage::DeliveryStatus {
                status_id,
                created_ms: now_ms(),
            },
        };
        outbound
            .send_message(
                DeliveryInstruction::Tunnel(gateway, gateway_tunnel),
                envelope.encode(),
            )
            .ok()?;

        self.probes.insert(
            status_id,
            TestProbe {
                status_id,
                tunnel_seq: tunnel.core().sequence,
                partner_seq: partner.core().sequence,
                total_hops: outbound.hop_count() + inbound.hop_count(),
                sent_at: Instant::now(),
            },
        );
        Some(status_id)
    }

    /// Consume a delivery-status reply matching an outstanding probe.
    pub fn handle_status(&self, provider: &TunnelProvider, status_id: u32) {
        let Some((_, probe)) = self.probes.remove(&status_id) else {
            return;
        };
        let rtt = probe.sent_at.elapsed();
        let budget = provider.settings().per_hop_test_budget * probe.total_hops.max(1) as u32;
        let passed = rtt <= budget;
        tracing::debug!(
            tunnel = probe.tunnel_seq,
            partner = probe.partner_seq,
            rtt_ms = rtt.as_millis() as u64,
            passed,
            "liveness probe completed"
        );
        self.record_result(provider, &probe, passed, Some(rtt.as_millis() as u64));
    }

    /// Fail every outstanding probe older than the given age. Timed-out
    /// probes count as failures, never silently disappear.
    pub fn sweep_timeouts(&self, provider: &TunnelProvider, older_than: Duration) {
        let expired: Vec<u32> = self
            .probes
            .iter()
            .filter(|entry| entry.sent_at.elapsed() >= older_than)
            .map(|entry| *entry.key())
            .collect();
        for status_id in expired {
            if let Some((_, probe)) = self.probes.remove(&status_id) {
                tracing::debug!(
                    tunnel = probe.tunnel_seq,
                    partner = probe.partner_seq,
                    "liveness probe timed out"
                );
                self.record_result(provider, &probe, false, None);
            }
        }
    }

    /// Pick the established tunnel longest overdue for testing.
    #[must_use]
    pub fn pick_next(&self, provider: &TunnelProvider) -> Option<Arc<Tunnel>> {
        let candidates = provider.testable_tunnels();
        candidates
            .into_iter()
            .filter(|tunnel| !self.runs.contains_key(&tunnel.core().sequence))
            .min_by_key(|tunnel| {
                // Never-tested sorts first, then longest-ago.
                self.last_tested
                    .get(&tunnel.core().sequence)
                    .map(|at| at.elapsed())
                    .map_or(0, |elapsed| u64::MAX - elapsed.as_millis() as u64)
            })
    }

    fn record_result(
        &self,
        provider: &TunnelProvider,
        probe: &TestProbe,
        passed: bool,
        rtt_ms: Option<u64>,
    ) {
        // Partner tunnels tally every run they participate in.
        if let Some(partner) = provider.tunnel_by_sequence(probe.partner_seq) {
            partner.core().quality.tally_test(passed);
            if passed {
                partner.core().quality.mark_passed_test();
                if let Some(ms) = rtt_ms {
                    partner.core().quality.record_latency(ms);
                }
            }
        }

        let concluded = {
            let Some(mut run) = self.runs.get_mut(&probe.tunnel_seq) else {
                return;
            };
            if passed {
                run.passes += 1;
            } else {
                run.failures += 1;
            }
            (run.passes + run.failures) as usize >= run.target
        };

        let tunnel = provider.tunnel_by_sequence(probe.tunnel_seq);
        if let (Some(tunnel), Some(ms), true) = (&tunnel, rtt_ms, passed) {
            tunnel.core().quality.record_latency(ms);
            tunnel.core().quality.tally_test(true);
        } else if let (Some(tunnel), false) = (&tunnel, passed) {
            tunnel.core().quality.tally_test(false);
        }

        if concluded {
            let Some((_, run)) = self.runs.remove(&probe.tunnel_seq) else {
                return;
            };
            let Some(tunnel) = tunnel else { return };
            if run.passes > 0 && run.passes >= run.failures {
                tunnel.core().quality.mark_passed_test();
                tracing::debug!(
                    tunnel = probe.tunnel_seq,
                    passes = run.passes,
                    failures = run.failures,
                    "tunnel passed liveness testing"
                );
            } else {
                tracing::info!(
                    tunnel = probe.tunnel_seq,
                    passes = run.passes,
                    failures = run.failures,
                    "retiring tunnel after failed liveness run"
                );
                provider.fail_tunnel(&tunnel);
            }
        }
    }
}

impl Default for TunnelTester {
    fn default() -> Self {
        Self::new()
    }
}
