//! End-to-end integration tests for the VEIL tunnel subsystem, driven
//! over the deterministic in-process network.

use std::sync::Arc;
use std::time::Duration;

use veil_integration_tests::{RecordingOwner, TestNet, TestRouter};
use veil_tunnel::records::{BuildPlan, create_build_message};
use veil_tunnel::{
    BuildReply, DeliveryInstruction, ExploratoryOwner, IdentHash, MessageEnvelope, TunnelConfig,
    TunnelDirection, TunnelId, TunnelOwner, TunnelPool, TunnelSettings, TunnelState, WireMessage,
};

fn recording_owner() -> (Arc<RecordingOwner>, Arc<dyn TunnelOwner>) {
    let recording = Arc::new(RecordingOwner::default());
    let owner: Arc<dyn TunnelOwner> = recording.clone();
    (recording, owner)
}

fn garlic_envelope(payload: &[u8]) -> MessageEnvelope {
    MessageEnvelope {
        id: 42,
        expiration_ms: veil_tunnel::messages::default_expiration(),
        body: WireMessage::Garlic(payload.to_vec()),
    }
}

fn build_outbound(
    net: &TestNet,
    creator: &TestRouter,
    owner: &Arc<dyn TunnelOwner>,
    hops: &[&TestRouter],
) -> Arc<veil_tunnel::Tunnel> {
    let peers = hops.iter().map(|router| router.peer()).collect();
    let config = TunnelConfig::outbound(TunnelPool::Client, peers, None).unwrap();
    let tunnel = creator
        .provider
        .create_tunnel(owner, config)
        .expect("outbound creation");
    net.pump();
    assert!(
        tunnel.core().is_established(),
        "outbound tunnel failed to establish"
    );
    tunnel
}

fn build_inbound(
    net: &TestNet,
    creator: &TestRouter,
    owner: &Arc<dyn TunnelOwner>,
    hops: &[&TestRouter],
) -> Arc<veil_tunnel::Tunnel> {
    let peers = hops.iter().map(|router| router.peer()).collect();
    let config = TunnelConfig::inbound(
        TunnelPool::Client,
        peers,
        creator.provider.local_identity(),
        None,
    )
    .unwrap();
    let tunnel = creator
        .provider
        .create_tunnel(owner, config)
        .expect("inbound creation");
    // The build request rides the outbound tunnel's send queue.
    net.tick_all();
    assert!(
        tunnel.core().is_established(),
        "inbound tunnel failed to establish"
    );
    tunnel
}

/// Scenario A: a 2-hop outbound and a 2-hop inbound tunnel between the
/// same test peers; a message sent out through the outbound tunnel and
/// addressed to the inbound gateway arrives back at the creator intact.
#[test]
fn test_scenario_a_end_to_end_roundtrip() {
    veil_integration_tests::init_tracing();
    let net = TestNet::new();
    let creator = net.add_router();
    let b = net.add_router();
    let c = net.add_router();
    let d = net.add_router();
    let e = net.add_router();
    let (recording, owner) = recording_owner();

    let outbound = build_outbound(&net, &creator, &owner, &[&b, &c]);
    let inbound = build_inbound(&net, &creator, &owner, &[&d, &e]);
    assert_eq!(recording.established.lock().unwrap().len(), 2);

    let payload = b"onions within onions".to_vec();
    let (gateway, gateway_tunnel) = inbound.gateway().unwrap();
    assert_eq!(gateway, d.hash());
    outbound
        .send_message(
            DeliveryInstruction::Tunnel(gateway, gateway_tunnel),
            garlic_envelope(&payload).encode(),
        )
        .unwrap();
    net.tick_all();

    let delivered = creator.handler.garlic.lock().unwrap();
    assert_eq!(*delivered, vec![payload]);

    // The inbound tunnel's receive queue saw the logical message too.
    let queued = inbound.core().pop_received().expect("queued delivery");
    assert_eq!(
        MessageEnvelope::decode(&queued.payload).unwrap().body,
        WireMessage::Garlic(b"onions within onions".to_vec())
    );
}

/// Scenario B: hop 2 of 3 declines the build. The unwound record set
/// shows exactly that hop as declined, and the tunnel terminates without
/// ever entering the established registry.
#[test]
fn test_scenario_b_middle_hop_declines() {
    let net = TestNet::new();
    let creator = net.add_router();
    let h1 = net.add_router();
    let decliner = net.add_router_with(TunnelSettings {
        max_transit_tunnels: 0,
        ..Default::default()
    });
    let h3 = net.add_router();
    let (recording, owner) = recording_owner();

    let peers = vec![h1.peer(), decliner.peer(), h3.peer()];
    let config = TunnelConfig::outbound(TunnelPool::Client, peers, None).unwrap();
    let tunnel = creator
        .provider
        .create_tunnel(&owner, config)
        .expect("outbound creation");
    net.pump();

    let results = tunnel.core().build_results().expect("unwound replies");
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].reply, BuildReply::Accept);
    assert_eq!(results[1].reply, BuildReply::Reject);
    assert_eq!(results[2].reply, BuildReply::Accept);
    assert!(results.iter().all(|r| r.integrity_ok));

    assert_eq!(tunnel.state(), TunnelState::Terminated);
    assert!(
        !creator
            .provider
            .is_established_registered(tunnel.core().sequence)
    );
    assert_eq!(
        *recording.build_failed.lock().unwrap(),
        vec![(tunnel.core().sequence, false)]
    );
    assert!(
        net.reputation()
            .declined
            .lock()
            .unwrap()
            .contains(&decliner.hash())
    );
    assert!(net.reputation().successes.lock().unwrap().contains(&h1.hash()));
}

fn scenario_c_setup(
    net: &TestNet,
    partners: usize,
) -> (
    TestRouter,
    Arc<RecordingOwner>,
    Arc<veil_tunnel::Tunnel>,
    Vec<TestRouter>,
) {
    let creator = net.add_router();
    let b = net.add_router();
    let c = net.add_router();
    let (recording, owner) = recording_owner();

    let outbound = build_outbound(net, &creator, &owner, &[&b, &c]);

    let mut gateways = Vec::new();
    for _ in 0..partners {
        let gateway = net.add_router();
        build_inbound(net, &creator, &owner, &[&gateway]);
        gateways.push(gateway);
    }
    (creator, recording, outbound, gateways)
}

/// Scenario C, passing half: 5 partners, 3 reachable and 2 dead. The
/// tunnel under test collects 3 passes and 2 timeout failures, is marked
/// as having passed liveness testing, and stays registered.
#[test]
fn test_scenario_c_tester_pass() {
    let net = TestNet::new();
    let (creator, _recording, outbound, gateways) = scenario_c_setup(&net, 5);

    net.remove_router(&gateways[3].hash());
    net.remove_router(&gateways[4].hash());

    let tester = Arc::clone(creator.provider.tester());
    let sent = tester.start_run(&creator.provider, &outbound);
    assert_eq!(sent, 5);
    net.tick_all();

    // The three live partners answered; the two dead ones time out.
    tester.sweep_timeouts(&creator.provider, Duration::ZERO);

    assert!(outbound.core().quality.passed_test());
    assert!(
        creator
            .provider
            .is_established_registered(outbound.core().sequence)
    );
}

/// Scenario C, failing half: 1 reachable partner and 4 dead. One pass
/// against four failures retires the tunnel even though it has not
/// expired.
#[test]
fn test_scenario_c_tester_retire() {
    let net = TestNet::new();
    let (creator, recording, outbound, gateways) = scenario_c_setup(&net, 5);

    for gateway in &gateways[1..] {
        net.remove_router(&gateway.hash());
    }

    let tester = Arc::clone(creator.provider.tester());
    let sent = tester.start_run(&creator.provider, &outbound);
    assert_eq!(sent, 5);
    net.tick_all();
    tester.sweep_timeouts(&creator.provider, Duration::ZERO);

    assert!(!outbound.core().quality.passed_test());
    assert_eq!(outbound.state(), TunnelState::Terminated);
    assert!(
        !creator
            .provider
            .is_established_registered(outbound.core().sequence)
    );
    assert!(
        recording
            .failed
            .lock()
            .unwrap()
            .contains(&outbound.core().sequence)
    );
}

/// The exploratory owner's periodic policy builds its pool up through
/// the provider: outbound first, inbound once an outbound exists.
#[test]
fn test_exploratory_owner_builds_pool() {
    let net = TestNet::new();
    let creator = net.add_router();
    for _ in 0..4 {
        net.add_router();
    }
    let exploratory = Arc::new(ExploratoryOwner::new());
    creator
        .provider
        .register_owner(exploratory.clone() as Arc<dyn TunnelOwner>);

    // First pass: outbound builds go out; inbound creation has no
    // established outbound yet and is skipped.
    net.maintain_all();
    assert!(creator.provider.select_outbound().is_some());

    // Second pass: inbound builds route through the established
    // outbound tunnels.
    net.maintain_all();
    net.tick_all();
    assert!(exploratory.tunnel_count(TunnelDirection::Inbound) > 0);
}

/// A replayed build request is dropped without an answer; the original
/// is answered exactly once.
#[test]
fn test_transit_replay_rejected() {
    let net = TestNet::new();
    let relay = net.add_router();
    let origin = net.add_router();

    let mut config =
        TunnelConfig::outbound(TunnelPool::Client, vec![relay.peer()], None).unwrap();
    let records = create_build_message(BuildPlan {
        hops: &mut config.hops,
        direction: TunnelDirection::Outbound,
        reply_gateway: Some((origin.hash(), TunnelId::new(7777))),
        reply_msg_id: 31337,
        request_time_minutes: 0,
    })
    .unwrap();
    let envelope = MessageEnvelope {
        id: 31337,
        expiration_ms: veil_tunnel::messages::default_expiration(),
        body: WireMessage::TunnelBuild(records),
    };

    relay.provider.handle_message(&origin.hash(), &envelope);
    assert_eq!(relay.provider.transit_count(), 1);
    assert_eq!(net.pump(), 1, "exactly one forwarded answer expected");

    relay.provider.handle_message(&origin.hash(), &envelope);
    assert_eq!(relay.provider.transit_count(), 1);
    assert_eq!(net.pump(), 0, "replay must be dropped unanswered");
}

/// A build whose request never gets a reply fails by timeout through the
/// normal failure path.
#[test]
fn test_build_timeout_fails_pending_tunnel() {
    let net = TestNet::new();
    let creator = net.add_router_with(TunnelSettings {
        per_hop_build_timeout: Duration::from_millis(1),
        ..Default::default()
    });
    let (recording, owner) = recording_owner();

    // A peer that exists nowhere on the bus: the request goes to a void.
    let ghost = veil_tunnel::RouterIdentity::generate().unwrap().as_peer();
    let config = TunnelConfig::outbound(TunnelPool::Client, vec![ghost], None).unwrap();
    let tunnel = creator
        .provider
        .create_tunnel(&owner, config)
        .expect("creation succeeds even if the peer is unreachable");

    std::thread::sleep(Duration::from_millis(10));
    net.tick_all();

    assert_eq!(tunnel.state(), TunnelState::Terminated);
    assert_eq!(
        *recording.build_failed.lock().unwrap(),
        vec![(tunnel.core().sequence, true)]
    );
}

/// Without any established inbound tunnel, outbound builds fall back to
/// the zero-hop reply tunnel; inbound builds with no outbound available
/// fail fast instead of blocking.
#[test]
fn test_creation_prerequisites() {
    let net = TestNet::new();
    let creator = net.add_router();
    let relay = net.add_router();
    let (_recording, owner) = recording_owner();

    // Inbound first: no established outbound exists, creation refuses.
    let config = TunnelConfig::inbound(
        TunnelPool::Client,
        vec![relay.peer()],
        creator.provider.local_identity(),
        None,
    )
    .unwrap();
    assert!(creator.provider.create_tunnel(&owner, config).is_none());

    // Outbound works immediately thanks to the zero-hop fallback.
    let config = TunnelConfig::outbound(TunnelPool::Client, vec![relay.peer()], None).unwrap();
    let outbound = creator.provider.create_tunnel(&owner, config);
    assert!(outbound.is_some());
    net.pump();
    assert!(outbound.unwrap().core().is_established());
}

/// Expired tunnels are shut down and deregistered by the scheduler tick,
/// with exactly one owner notification.
#[test]
fn test_expiry_removes_and_notifies_once() {
    let net = TestNet::new();
    let creator = net.add_router_with(TunnelSettings {
        lifetime: Duration::from_millis(20),
        ..Default::default()
    });
    let relay = net.add_router();
    let (recording, owner) = recording_owner();

    let config = TunnelConfig::outbound(TunnelPool::Client, vec![relay.peer()], None).unwrap();
    let tunnel = creator.provider.create_tunnel(&owner, config).unwrap();
    net.pump();
    assert!(tunnel.core().is_established());

    std::thread::sleep(Duration::from_millis(30));
    net.tick_all();
    net.tick_all();

    assert_eq!(tunnel.state(), TunnelState::Terminated);
    assert_eq!(
        *recording.expired.lock().unwrap(),
        vec![tunnel.core().sequence]
    );
    assert!(
        !creator
            .provider
            .is_established_registered(tunnel.core().sequence)
    );
}

/// The provider's weighted selection prefers the live, tested tunnel.
#[test]
fn test_selection_prefers_live_tunnel() {
    let net = TestNet::new();
    let creator = net.add_router();
    let b = net.add_router();
    let c = net.add_router();
    let (_recording, owner) = recording_owner();

    let good = build_outbound(&net, &creator, &owner, &[&b]);
    good.core().quality.mark_passed_test();
    good.core().quality.record_latency(10);
    let other = build_outbound(&net, &creator, &owner, &[&c]);
    other.core().terminate();

    let mut good_draws = 0;
    for _ in 0..200 {
        let chosen = creator.provider.select_outbound().unwrap();
        if chosen.core().sequence == good.core().sequence {
            good_draws += 1;
        }
    }
    assert!(good_draws >= 190, "good tunnel drawn {good_draws}/200 times");
}

fn _assert_send_sync<T: Send + Sync>() {}

#[test]
fn test_provider_is_send_sync() {
    _assert_send_sync::<veil_tunnel::TunnelProvider>();
    _assert_send_sync::<IdentHash>();
}
