//! Weighted-random tunnel selection.
//!
//! Callers ask the provider for "an established inbound/outbound tunnel".
//! Each candidate gets a penalty (lower is better) combining measured
//! latency, build time, age and state; the draw is weighted toward low
//! penalties but deliberately not an arg-min, so the same best tunnel is
//! not hot-pathed indefinitely — spreading load across tunnels resists
//! traffic correlation.

use std::sync::Arc;

use rand::distributions::{Distribution, WeightedIndex};

use crate::config::TunnelPool;
use crate::tunnel::{Tunnel, TunnelState};

/// Latency assumed for tunnels with no completed probe, in milliseconds.
const UNKNOWN_LATENCY_PENALTY: f64 = 1_000.0;

/// Penalty for tunnels inside their recreation margin.
const NEEDS_RECREATION_PENALTY: f64 = 2_000.0;

/// Penalty for exploratory-pool tunnels when a client tunnel would do.
const EXPLORATORY_PENALTY: f64 = 1_000.0;

/// Penalty for tunnels that never passed a liveness test.
const UNTESTED_PENALTY: f64 = 500.0;

/// Penalty for expired tunnels awaiting removal.
const EXPIRED_PENALTY: f64 = 100_000.0;

/// Penalty for zero-hop tunnels; they carry no privacy.
const ZERO_HOP_PENALTY: f64 = 1_000_000.0;

/// Penalty for terminated tunnels. Effectively exclusionary.
const TERMINATED_PENALTY: f64 = 1_000_000_000.0;

/// Compute the selection penalty for a tunnel. Lower is better.
#[must_use]
pub fn penalty(tunnel: &Tunnel) -> f64 {
    let core = tunnel.core();
    let mut penalty = core
        .quality
        .min_latency_ms()
        .map_or(UNKNOWN_LATENCY_PENALTY, |ms| ms as f64);
    penalty += core.quality.build_time_per_hop_ms() as f64;
    penalty += core.created_at.elapsed().as_secs_f64();

    match tunnel.state() {
        TunnelState::Active => {}
        TunnelState::Pending => penalty += EXPIRED_PENALTY,
        TunnelState::NeedsRecreation => penalty += NEEDS_RECREATION_PENALTY,
        TunnelState::Expired => penalty += EXPIRED_PENALTY,
        TunnelState::Terminated => penalty += TERMINATED_PENALTY,
    }
    if core.config.pool == TunnelPool::Exploratory {
        penalty += EXPLORATORY_PENALTY;
    }
    if !core.quality.passed_test() {
        penalty += UNTESTED_PENALTY;
    }
    if tunnel.hop_count() == 0 {
        penalty += ZERO_HOP_PENALTY;
    }
    penalty
}

/// Draw one tunnel from the candidates, weighted by inverse penalty.
/// Returns `None` for an empty candidate set.
#[must_use]
pub fn select_weighted(candidates: &[Arc<Tunnel>]) -> Option<Arc<Tunnel>> {
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(Arc::clone(&candidates[0]));
    }
    let weights: Vec<f64> = candidates
        .iter()
        .map(|tunnel| 1.0 / (1.0 + penalty(tunnel)))
        .collect();
    let index = match WeightedIndex::new(&weights) {
        Ok(dist) => dist.sample(&mut rand::thread_rng()),
        Err(_) => 0,
    };
    Some(Arc::clone(&candidates[index]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TunnelConfig, TunnelDirection, TunnelPool};
    use crate::error::TunnelError;
    use crate::identity::RouterIdentity;
    use crate::settings::TunnelSettings;
    use crate::tunnel::{TickContext, TunnelCore, TunnelRole};

    struct IdleRole;

    impl TunnelRole for IdleRole {
        fn name(&self) -> &'static str {
            "idle"
        }

        fn direction(&self) -> TunnelDirection {
            TunnelDirection::Outbound
        }

        fn execute_tick(&self, _: &TunnelCore, _: &TickContext<'_>) -> Result<(), TunnelError> {
            Ok(())
        }
    }

    fn make_tunnel(sequence: u64) -> Arc<Tunnel> {
        let peer = RouterIdentity::generate().unwrap().as_peer();
        let config = TunnelConfig::outbound(TunnelPool::Client, vec![peer], None).unwrap();
        let settings = TunnelSettings::default();
        Arc::new(Tunnel::new(sequence, config, &settings, Box::new(IdleRole)))
    }

    #[test]
    fn test_empty_candidates() {
        assert!(select_weighted(&[]).is_none());
    }

    #[test]
    fn test_terminated_penalty_dominates() {
        let good = make_tunnel(1);
        good.core().mark_established();
        good.core().quality.mark_passed_test();
        good.core().quality.record_latency(50);

        let dead = make_tunnel(2);
        dead.core().mark_established();
        dead.core().terminate();

        assert!(penalty(&dead) > penalty(&good) * 1_000.0);
    }

    #[test]
    fn test_active_tested_tunnel_wins_overwhelmingly() {
        let good = make_tunnel(1);
        good.core().mark_established();
        good.core().quality.mark_passed_test();
        good.core().quality.record_latency(50);

        let dead = make_tunnel(2);
        dead.core().mark_established();
        dead.core().terminate();

        let candidates = vec![Arc::clone(&dead), Arc::clone(&good)];
        let mut good_draws = 0;
        for _ in 0..1000 {
            let chosen = select_weighted(&candidates).unwrap();
            if chosen.core().sequence == 1 {
                good_draws += 1;
            }
        }
        assert!(
            good_draws >= 950,
            "active tunnel drawn only {good_draws}/1000 times"
        );
    }

    #[test]
    fn test_spreads_between_comparable_tunnels() {
        let a = make_tunnel(1);
        let b = make_tunnel(2);
        for tunnel in [&a, &b] {
            tunnel.core().mark_established();
            tunnel.core().quality.mark_passed_test();
            tunnel.core().quality.record_latency(40);
        }
        let candidates = vec![Arc::clone(&a), Arc::clone(&b)];
        let mut a_draws = 0;
        for _ in 0..1000 {
            if select_weighted(&candidates).unwrap().core().sequence == 1 {
                a_draws += 1;
            }
        }
        // Neither comparable tunnel should monopolize the draw.
        assert!((200..=800).contains(&a_draws), "a drawn {a_draws}/1000 times");
    }
}
