//! The tunnel provider: registries, scheduling, dispatch and selection.
//!
//! The provider is the single source of truth for which tunnels exist
//! and what phase they are in. It owns separate registries for pending
//! and established tunnels per direction plus the transit pool, and a
//! tunnel-ID index used to route inbound wire messages. All registries
//! are concurrent maps; mutation during scheduling uses
//! remove-after-iterate semantics so a failing tunnel never invalidates
//! the iteration that discovered it.
//!
//! Three background loops drive the subsystem when [`TunnelProvider::run`]
//! is invoked: a scheduler loop ticking every tunnel and running periodic
//! maintenance, a pump loop draining the inbound message queue, and a
//! tester loop pacing liveness probes. They share no mutable locals and
//! communicate only through the concurrent registries and channels.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use veil_crypto::random::random_nonzero_u32;

use crate::config::{TunnelConfig, TunnelDirection, TunnelPool};
use crate::error::TunnelError;
use crate::identity::{IdentHash, RouterIdentity, TunnelId};
use crate::inbound::InboundRole;
use crate::messages::{MessageEnvelope, WireMessage, default_expiration, now_ms};
use crate::netdb::NetworkDatabase;
use crate::outbound::OutboundRole;
use crate::owners::{TransitOwner, TunnelOwner};
use crate::records::{
    BuildPlan, BuildReply, HopRole, create_build_message, find_and_open, unwind_build_replies,
};
use crate::selection::select_weighted;
use crate::settings::TunnelSettings;
use crate::tester::TunnelTester;
use crate::transport::{LocalMessageHandler, Transport, dispatch};
use crate::tunnel::{TickContext, Tunnel, TunnelState};
use crate::zero_hop::ZeroHopRole;

struct PendingBuild {
    sequence: u64,
    started: Instant,
}

enum Outcome {
    BuildTimeout,
    Failed,
    Expired,
}

struct ProviderInner {
    local: RouterIdentity,
    settings: TunnelSettings,
    transport: Arc<dyn Transport>,
    netdb: Arc<dyn NetworkDatabase>,
    handler: Arc<dyn LocalMessageHandler>,
    tester: Arc<TunnelTester>,

    pending_inbound: DashMap<u64, Arc<Tunnel>>,
    pending_outbound: DashMap<u64, Arc<Tunnel>>,
    established_inbound: DashMap<u64, Arc<Tunnel>>,
    established_outbound: DashMap<u64, Arc<Tunnel>>,
    transit: DashMap<u64, Arc<Tunnel>>,
    tunnel_index: DashMap<u32, Vec<Arc<Tunnel>>>,

    owners_by_seq: DashMap<u64, Arc<dyn TunnelOwner>>,
    owners: Mutex<Vec<Arc<dyn TunnelOwner>>>,
    transit_owner: Mutex<Option<Arc<TransitOwner>>>,
    pending_builds: DashMap<u32, PendingBuild>,

    sequence: AtomicU64,
    build_successes: AtomicU64,
    build_failures: AtomicU64,
    running: AtomicBool,

    inbound_tx: UnboundedSender<(IdentHash, MessageEnvelope)>,
    inbound_rx: Mutex<Option<UnboundedReceiver<(IdentHash, MessageEnvelope)>>>,
}

/// Registry and scheduler for all tunnels of one router.
#[derive(Clone)]
pub struct TunnelProvider {
    inner: Arc<ProviderInner>,
}

impl TunnelProvider {
    /// Construct a provider wired to its collaborators.
    #[must_use]
    pub fn new(
        local: RouterIdentity,
        settings: TunnelSettings,
        transport: Arc<dyn Transport>,
        netdb: Arc<dyn NetworkDatabase>,
        handler: Arc<dyn LocalMessageHandler>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = unbounded_channel();
        Self {
            inner: Arc::new(ProviderInner {
                local,
                settings,
                transport,
                netdb,
                handler,
                tester: Arc::new(TunnelTester::new()),
                pending_inbound: DashMap::new(),
                pending_outbound: DashMap::new(),
                established_inbound: DashMap::new(),
                established_outbound: DashMap::new(),
                transit: DashMap::new(),
                tunnel_index: DashMap::new(),
                owners_by_seq: DashMap::new(),
                owners: Mutex::new(Vec::new()),
                transit_owner: Mutex::new(None),
                pending_builds: DashMap::new(),
                sequence: AtomicU64::new(1),
                build_successes: AtomicU64::new(0),
                build_failures: AtomicU64::new(0),
                running: AtomicBool::new(false),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
            }),
        }
    }

    /// This router's identity hash.
    #[must_use]
    pub fn local_hash(&self) -> IdentHash {
        self.inner.local.hash()
    }

    /// This router's full identity.
    #[must_use]
    pub fn local_identity(&self) -> &RouterIdentity {
        &self.inner.local
    }

    /// Subsystem settings.
    #[must_use]
    pub fn settings(&self) -> &TunnelSettings {
        &self.inner.settings
    }

    /// The network-database collaborator.
    #[must_use]
    pub fn netdb(&self) -> &Arc<dyn NetworkDatabase> {
        &self.inner.netdb
    }

    /// The transport collaborator.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// The liveness tester.
    #[must_use]
    pub fn tester(&self) -> &Arc<TunnelTester> {
        &self.inner.tester
    }

    /// Register a pool owner for periodic maintenance callbacks.
    pub fn register_owner(&self, owner: Arc<dyn TunnelOwner>) {
        if let Ok(mut owners) = self.inner.owners.lock() {
            owners.push(owner);
        }
    }

    /// Register the transit owner that answers foreign build requests.
    pub fn register_transit_owner(&self, owner: Arc<TransitOwner>) {
        if let Ok(mut slot) = self.inner.transit_owner.lock() {
            *slot = Some(owner);
        }
    }

    /// Allocate the next tunnel sequence number.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn tick_context(&self) -> TickContext<'_> {
        TickContext {
            transport: self.inner.transport.as_ref(),
            settings: &self.inner.settings,
            local: self.inner.local.hash(),
        }
    }

    /// Create a tunnel for an owner from a hop chain.
    ///
    /// An outbound build needs a reply (inbound) tunnel for the build
    /// reply; an inbound build needs an established outbound tunnel to
    /// carry the request. If the prerequisite is missing the creation
    /// fails and returns `None` — callers retry on a later tick rather
    /// than block.
    pub fn create_tunnel(
        &self,
        owner: &Arc<dyn TunnelOwner>,
        config: TunnelConfig,
    ) -> Option<Arc<Tunnel>> {
        if config.pool == TunnelPool::Transit || config.hops.is_empty() {
            return None;
        }
        match config.direction {
            TunnelDirection::Outbound => self.create_outbound(owner, config),
            TunnelDirection::Inbound => self.create_inbound(owner, config),
        }
    }

    fn create_outbound(
        &self,
        owner: &Arc<dyn TunnelOwner>,
        mut config: TunnelConfig,
    ) -> Option<Arc<Tunnel>> {
        let reply_tunnel = self.select_reply_tunnel()?;
        let (gateway, gateway_id) = reply_tunnel.gateway()?;
        let reply_msg_id = random_nonzero_u32().ok()?;

        let records = create_build_message(BuildPlan {
            hops: &mut config.hops,
            direction: TunnelDirection::Outbound,
            reply_gateway: Some((gateway, gateway_id)),
            reply_msg_id,
            request_time_minutes: (now_ms() / 60_000) as u32,
        })
        .map_err(|err| tracing::warn!(%err, "failed to assemble outbound build"))
        .ok()?;

        let sequence = self.next_sequence();
        let tunnel = Arc::new(Tunnel::new(
            sequence,
            config,
            &self.inner.settings,
            Box::new(OutboundRole::new()),
        ));
        self.inner.pending_outbound.insert(sequence, Arc::clone(&tunnel));
        self.inner.owners_by_seq.insert(sequence, Arc::clone(owner));
        self.inner.pending_builds.insert(
            reply_msg_id,
            PendingBuild {
                sequence,
                started: Instant::now(),
            },
        );

        let first_hop = tunnel.core().config.hops[0].peer.hash;
        let envelope = MessageEnvelope {
            id: reply_msg_id,
            expiration_ms: default_expiration(),
            body: WireMessage::TunnelBuild(records),
        };
        self.inner.transport.send(&first_hop, &envelope);
        tracing::debug!(
            tunnel = sequence,
            hops = tunnel.core().config.hops.len(),
            "outbound build request sent"
        );
        Some(tunnel)
    }

    fn create_inbound(
        &self,
        owner: &Arc<dyn TunnelOwner>,
        mut config: TunnelConfig,
    ) -> Option<Arc<Tunnel>> {
        let outbound = self.select_outbound()?;
        let reply_msg_id = random_nonzero_u32().ok()?;

        let records = create_build_message(BuildPlan {
            hops: &mut config.hops,
            direction: TunnelDirection::Inbound,
            reply_gateway: None,
            reply_msg_id,
            request_time_minutes: (now_ms() / 60_000) as u32,
        })
        .map_err(|err| tracing::warn!(%err, "failed to assemble inbound build"))
        .ok()?;

        let sequence = self.next_sequence();
        let role = InboundRole::new(
            Arc::clone(&self.inner.handler),
            self.inner.inbound_tx.clone(),
        );
        let tunnel = Arc::new(Tunnel::new(
            sequence,
            config,
            &self.inner.settings,
            Box::new(role),
        ));
        self.inner.pending_inbound.insert(sequence, Arc::clone(&tunnel));
        self.inner.owners_by_seq.insert(sequence, Arc::clone(owner));

        let gateway = tunnel.core().config.hops[0].peer.hash;
        let envelope = MessageEnvelope {
            id: reply_msg_id,
            expiration_ms: default_expiration(),
            body: WireMessage::TunnelBuild(records),
        };
        if outbound
            .send_message(
                crate::frag::DeliveryInstruction::Router(gateway),
                envelope.encode(),
            )
            .is_err()
        {
            self.inner.pending_inbound.remove(&sequence);
            self.inner.owners_by_seq.remove(&sequence);
            return None;
        }
        tracing::debug!(
            tunnel = sequence,
            via = outbound.core().sequence,
            "inbound build request routed"
        );
        Some(tunnel)
    }

    /// Register an accepted transit tunnel built by the transit owner.
    pub fn register_transit_tunnel(&self, tunnel: Arc<Tunnel>) {
        let sequence = tunnel.core().sequence;
        if let Some(id) = tunnel.receive_tunnel_id() {
            self.index_insert(id, &tunnel);
        }
        if let Ok(slot) = self.inner.transit_owner.lock() {
            if let Some(owner) = slot.as_ref() {
                self.inner
                    .owners_by_seq
                    .insert(sequence, Arc::clone(owner) as Arc<dyn TunnelOwner>);
            }
        }
        self.inner.transit.insert(sequence, tunnel);
    }

    /// Number of live transit tunnels.
    #[must_use]
    pub fn transit_count(&self) -> usize {
        self.inner.transit.len()
    }

    /// Whether this router is struggling to build its own tunnels and
    /// should decline to relay for others.
    #[must_use]
    pub fn client_health_degraded(&self) -> bool {
        let failures = self.inner.build_failures.load(Ordering::Relaxed);
        let successes = self.inner.build_successes.load(Ordering::Relaxed);
        failures >= 4 && failures > successes * 2
    }

    /// Queue a received wire message for processing.
    pub fn submit_message(&self, from: IdentHash, envelope: MessageEnvelope) {
        let _ = self.inner.inbound_tx.send((from, envelope));
    }

    /// Drain and handle queued messages synchronously. Returns the number
    /// processed. No-op when the pump loop owns the queue.
    pub fn process_queued(&self) -> usize {
        let mut processed = 0;
        loop {
            let next = {
                let Ok(mut guard) = self.inner.inbound_rx.lock() else {
                    return processed;
                };
                let Some(rx) = guard.as_mut() else {
                    return processed;
                };
                rx.try_recv().ok()
            };
            let Some((from, envelope)) = next else {
                return processed;
            };
            self.handle_message(&from, &envelope);
            processed += 1;
        }
    }

    /// Dispatch one received wire message by type.
    pub fn handle_message(&self, from: &IdentHash, envelope: &MessageEnvelope) {
        tracing::trace!(%from, id = envelope.id, "inbound wire message");
        match &envelope.body {
            WireMessage::TunnelBuild(records) => self.handle_build(records.clone()),
            WireMessage::TunnelBuildReply(records) => {
                self.complete_outbound_build(envelope.id, records.clone());
            }
            WireMessage::TunnelData(data) => self.route_by_tunnel_id(data.tunnel_id, envelope),
            WireMessage::TunnelGateway { tunnel_id, .. } => {
                self.route_by_tunnel_id(*tunnel_id, envelope);
            }
            WireMessage::DeliveryStatus { status_id, .. } => {
                self.inner.tester.handle_status(self, *status_id);
            }
            WireMessage::Garlic(data) => {
                let handler = Arc::clone(&self.inner.handler);
                let data = data.clone();
                dispatch(move || handler.handle_garlic(data));
            }
            WireMessage::DatabaseStore(data) => {
                let handler = Arc::clone(&self.inner.handler);
                let data = data.clone();
                dispatch(move || handler.handle_database_store(data));
            }
        }
    }

    fn handle_build(&self, records: Vec<Vec<u8>>) {
        let opened = match find_and_open(&self.inner.local, &records) {
            Ok(opened) => opened,
            Err(err) => {
                tracing::debug!(%err, "ignoring build message not addressed to us");
                return;
            }
        };
        let role = match opened.request.role(&self.inner.local.hash()) {
            Ok(role) => role,
            Err(err) => {
                tracing::warn!(%err, "rejecting build record with invalid role flags");
                return;
            }
        };
        match role {
            HopRole::OwnInboundTerminus => self.complete_inbound_build(&opened, records),
            _ => {
                let owner = self
                    .inner
                    .transit_owner
                    .lock()
                    .ok()
                    .and_then(|slot| slot.clone());
                match owner {
                    Some(owner) => owner.handle_build_request(self, &opened, records, role),
                    None => {
                        tracing::debug!("no transit owner registered, dropping build request");
                    }
                }
            }
        }
    }

    fn complete_outbound_build(&self, reply_id: u32, mut records: Vec<Vec<u8>>) {
        let Some((_, pending)) = self.inner.pending_builds.remove(&reply_id) else {
            tracing::debug!(reply_id, "build reply matches no pending build");
            return;
        };
        let Some((_, tunnel)) = self.inner.pending_outbound.remove(&pending.sequence) else {
            return;
        };
        let hops = &tunnel.core().config.hops;
        match unwind_build_replies(hops, hops.len(), &mut records) {
            Ok(results) => {
                tunnel.core().set_build_results(results.clone());
                self.conclude_build(&tunnel, &results, pending.started);
            }
            Err(err) => {
                tracing::warn!(tunnel = tunnel.core().sequence, %err, "bad build reply");
                self.build_failed(&tunnel, false);
            }
        }
    }

    fn complete_inbound_build(
        &self,
        opened: &crate::records::OpenedRecord,
        mut records: Vec<Vec<u8>>,
    ) {
        let receive_id = opened.request.receive_tunnel_id;
        let found = self
            .inner
            .pending_inbound
            .iter()
            .find(|entry| entry.value().receive_tunnel_id() == Some(receive_id))
            .map(|entry| *entry.key());
        let Some(sequence) = found else {
            tracing::debug!(
                tunnel_id = receive_id.value(),
                "inbound build completion matches no pending tunnel"
            );
            return;
        };
        let Some((_, tunnel)) = self.inner.pending_inbound.remove(&sequence) else {
            return;
        };
        let started = tunnel.core().created_at;
        let hops = &tunnel.core().config.hops;
        let participants = hops.len() - 1;
        match unwind_build_replies(hops, participants, &mut records) {
            Ok(results) => {
                tunnel.core().set_build_results(results.clone());
                self.conclude_build(&tunnel, &results, started);
            }
            Err(err) => {
                tracing::warn!(tunnel = tunnel.core().sequence, %err, "bad inbound build reply");
                self.build_failed(&tunnel, false);
            }
        }
    }

    fn conclude_build(
        &self,
        tunnel: &Arc<Tunnel>,
        results: &[crate::records::HopBuildResult],
        started: Instant,
    ) {
        let hops = &tunnel.core().config.hops;
        let mut all_accepted = true;
        for result in results {
            let peer = &hops[result.hop_index].peer.hash;
            if !result.integrity_ok {
                self.inner.netdb.record_information_faulty(peer);
                all_accepted = false;
            } else if result.reply == BuildReply::Accept {
                self.inner.netdb.record_tunnel_member_success(peer);
            } else {
                self.inner.netdb.record_tunnel_member_declined(peer);
                all_accepted = false;
            }
        }

        if !all_accepted {
            tracing::debug!(tunnel = tunnel.core().sequence, "tunnel build rejected");
            self.build_failed(tunnel, false);
            return;
        }

        let per_hop_ms = (started.elapsed().as_millis() as u64) / results.len().max(1) as u64;
        tunnel.core().quality.record_build_time_per_hop(per_hop_ms);
        for result in results {
            self.inner
                .netdb
                .record_build_time_per_hop(&hops[result.hop_index].peer.hash, per_hop_ms);
        }

        tunnel.core().mark_established();
        self.inner.build_successes.fetch_add(1, Ordering::Relaxed);
        let sequence = tunnel.core().sequence;
        match tunnel.direction() {
            TunnelDirection::Outbound => {
                self.inner
                    .established_outbound
                    .insert(sequence, Arc::clone(tunnel));
            }
            TunnelDirection::Inbound => {
                if let Some(id) = tunnel.receive_tunnel_id() {
                    self.index_insert(id, tunnel);
                }
                self.inner
                    .established_inbound
                    .insert(sequence, Arc::clone(tunnel));
            }
        }
        tracing::info!(
            tunnel = sequence,
            role = tunnel.role_name(),
            per_hop_ms,
            "tunnel established"
        );
        if let Some(owner) = self.inner.owners_by_seq.get(&sequence) {
            owner.tunnel_established(tunnel);
        }
    }

    fn build_failed(&self, tunnel: &Arc<Tunnel>, was_timeout: bool) {
        self.inner.build_failures.fetch_add(1, Ordering::Relaxed);
        self.remove_everywhere(tunnel);
        if tunnel.core().terminate() {
            if let Some(owner) = self.inner.owners_by_seq.remove(&tunnel.core().sequence) {
                owner.1.tunnel_build_failed(tunnel, was_timeout);
            }
        }
    }

    /// Forcibly retire a tunnel (liveness failure or resource guard).
    pub fn fail_tunnel(&self, tunnel: &Arc<Tunnel>) {
        self.remove_everywhere(tunnel);
        if tunnel.core().terminate() {
            if let Some(owner) = self.inner.owners_by_seq.remove(&tunnel.core().sequence) {
                owner.1.tunnel_failed(tunnel);
            }
        }
    }

    fn expire_tunnel(&self, tunnel: &Arc<Tunnel>) {
        self.remove_everywhere(tunnel);
        if tunnel.core().terminate() {
            if let Some(owner) = self.inner.owners_by_seq.remove(&tunnel.core().sequence) {
                owner.1.tunnel_expired(tunnel);
            }
        }
    }

    fn remove_everywhere(&self, tunnel: &Arc<Tunnel>) {
        let sequence = tunnel.core().sequence;
        self.inner.pending_inbound.remove(&sequence);
        self.inner.pending_outbound.remove(&sequence);
        self.inner.established_inbound.remove(&sequence);
        self.inner.established_outbound.remove(&sequence);
        self.inner.transit.remove(&sequence);
        self.inner
            .pending_builds
            .retain(|_, pending| pending.sequence != sequence);
        if let Some(id) = tunnel.receive_tunnel_id() {
            let mut empty = false;
            if let Some(mut entry) = self.inner.tunnel_index.get_mut(&id.value()) {
                entry.retain(|t| t.core().sequence != sequence);
                empty = entry.is_empty();
            }
            if empty {
                self.inner.tunnel_index.remove_if(&id.value(), |_, v| v.is_empty());
            }
        }
    }

    fn index_insert(&self, id: TunnelId, tunnel: &Arc<Tunnel>) {
        self.inner
            .tunnel_index
            .entry(id.value())
            .or_default()
            .push(Arc::clone(tunnel));
    }

    fn route_by_tunnel_id(&self, id: TunnelId, envelope: &MessageEnvelope) {
        let tunnels: Vec<Arc<Tunnel>> = self
            .inner
            .tunnel_index
            .get(&id.value())
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        if tunnels.is_empty() {
            tracing::debug!(tunnel_id = id.value(), "no tunnel for inbound message");
            return;
        }
        let ctx = self.tick_context();
        for tunnel in tunnels {
            match tunnel.receive(&ctx, envelope) {
                Ok(()) => {}
                Err(TunnelError::BufferExhausted(count)) => {
                    tracing::warn!(
                        tunnel = tunnel.core().sequence,
                        count,
                        "fragment buffer ceiling hit, tearing tunnel down"
                    );
                    self.fail_tunnel(&tunnel);
                }
                Err(err) => {
                    tracing::debug!(tunnel = tunnel.core().sequence, %err, "receive error");
                }
            }
        }
    }

    /// Execute one scheduling pass over every pending, established and
    /// transit tunnel. Failures and expiries are queued during iteration
    /// and applied afterwards, each with exactly one owner notification.
    pub fn tick(&self) {
        let ctx = self.tick_context();
        let mut outcomes: Vec<(Arc<Tunnel>, Outcome)> = Vec::new();

        let registries = [
            &self.inner.pending_inbound,
            &self.inner.pending_outbound,
            &self.inner.established_inbound,
            &self.inner.established_outbound,
            &self.inner.transit,
        ];
        for registry in registries {
            let snapshot: Vec<Arc<Tunnel>> =
                registry.iter().map(|entry| Arc::clone(entry.value())).collect();
            for tunnel in snapshot {
                if tunnel.state() == TunnelState::Expired {
                    outcomes.push((tunnel, Outcome::Expired));
                    continue;
                }
                match tunnel.execute_tick(&ctx) {
                    Ok(()) => {}
                    Err(TunnelError::BuildTimeout) => {
                        outcomes.push((tunnel, Outcome::BuildTimeout));
                    }
                    Err(err) => {
                        tracing::debug!(tunnel = tunnel.core().sequence, %err, "tick failed");
                        outcomes.push((tunnel, Outcome::Failed));
                    }
                }
            }
        }

        for (tunnel, outcome) in outcomes {
            match outcome {
                Outcome::BuildTimeout => self.build_failed(&tunnel, true),
                Outcome::Failed => self.fail_tunnel(&tunnel),
                Outcome::Expired => self.expire_tunnel(&tunnel),
            }
        }
    }

    /// Periodic maintenance: zero-hop upkeep, bandwidth window rollover,
    /// probe timeout sweeps, owner policies and status logging.
    pub fn maintain(&self) {
        self.ensure_zero_hop();

        for registry in [
            &self.inner.established_inbound,
            &self.inner.established_outbound,
            &self.inner.transit,
        ] {
            for entry in registry.iter() {
                entry.value().core().bandwidth.roll_window();
            }
        }

        self.inner
            .tester
            .sweep_timeouts(self, self.inner.settings.max_test_run_time);

        let owners: Vec<Arc<dyn TunnelOwner>> = self
            .inner
            .owners
            .lock()
            .map(|owners| owners.clone())
            .unwrap_or_default();
        for owner in &owners {
            owner.maintain(self, owner);
        }

        self.log_status();
    }

    fn ensure_zero_hop(&self) {
        let live = self.inner.established_inbound.iter().any(|entry| {
            entry.value().hop_count() == 0
                && !matches!(
                    entry.value().state(),
                    TunnelState::Expired | TunnelState::Terminated
                )
        });
        if live {
            return;
        }
        let Ok(id) = TunnelId::generate() else { return };
        let sequence = self.next_sequence();
        let role = ZeroHopRole::new(self.inner.local.hash(), id, self.inner.inbound_tx.clone());
        let config = TunnelConfig {
            direction: TunnelDirection::Inbound,
            pool: TunnelPool::Exploratory,
            hops: Vec::new(),
            destination: None,
        };
        let tunnel = Arc::new(Tunnel::with_lifetime(
            sequence,
            config,
            self.inner.settings.zero_hop_lifetime,
            Duration::ZERO,
            Box::new(role),
        ));
        tunnel.core().mark_established();
        self.index_insert(id, &tunnel);
        self.inner.established_inbound.insert(sequence, tunnel);
        tracing::debug!(tunnel = sequence, "zero-hop fallback tunnel created");
    }

    fn log_status(&self) {
        let mut sent = 0u64;
        let mut received = 0u64;
        for registry in [
            &self.inner.established_inbound,
            &self.inner.established_outbound,
            &self.inner.transit,
        ] {
            for entry in registry.iter() {
                sent += entry.value().core().bandwidth.bytes_sent();
                received += entry.value().core().bandwidth.bytes_received();
            }
        }
        tracing::info!(
            pending_in = self.inner.pending_inbound.len(),
            pending_out = self.inner.pending_outbound.len(),
            established_in = self.inner.established_inbound.len(),
            established_out = self.inner.established_outbound.len(),
            transit = self.inner.transit.len(),
            bytes_sent = sent,
            bytes_received = received,
            "tunnel status"
        );
    }

    fn snapshot(&self, registry: &DashMap<u64, Arc<Tunnel>>) -> Vec<Arc<Tunnel>> {
        registry.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Weighted-random choice over established outbound tunnels.
    #[must_use]
    pub fn select_outbound(&self) -> Option<Arc<Tunnel>> {
        select_weighted(&self.snapshot(&self.inner.established_outbound))
    }

    /// Weighted-random choice over established inbound tunnels. The
    /// zero-hop fallback participates with a prohibitive penalty.
    #[must_use]
    pub fn select_inbound(&self) -> Option<Arc<Tunnel>> {
        select_weighted(&self.snapshot(&self.inner.established_inbound))
    }

    fn select_reply_tunnel(&self) -> Option<Arc<Tunnel>> {
        self.ensure_zero_hop();
        self.select_inbound()
    }

    /// Established client/exploratory tunnels of one direction usable as
    /// probe partners.
    #[must_use]
    pub fn test_partner_candidates(
        &self,
        direction: TunnelDirection,
        exclude_sequence: u64,
    ) -> Vec<Arc<Tunnel>> {
        let registry = match direction {
            TunnelDirection::Inbound => &self.inner.established_inbound,
            TunnelDirection::Outbound => &self.inner.established_outbound,
        };
        registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .filter(|tunnel| {
                tunnel.hop_count() > 0
                    && tunnel.core().sequence != exclude_sequence
                    && matches!(
                        tunnel.state(),
                        TunnelState::Active | TunnelState::NeedsRecreation
                    )
            })
            .collect()
    }

    /// Established client/exploratory tunnels eligible for liveness
    /// testing.
    #[must_use]
    pub fn testable_tunnels(&self) -> Vec<Arc<Tunnel>> {
        let mut tunnels = self.snapshot(&self.inner.established_inbound);
        tunnels.extend(self.snapshot(&self.inner.established_outbound));
        tunnels.retain(|tunnel| {
            tunnel.hop_count() > 0 && matches!(tunnel.state(), TunnelState::Active)
        });
        tunnels
    }

    /// Look up a live tunnel by sequence.
    #[must_use]
    pub fn tunnel_by_sequence(&self, sequence: u64) -> Option<Arc<Tunnel>> {
        for registry in [
            &self.inner.pending_inbound,
            &self.inner.pending_outbound,
            &self.inner.established_inbound,
            &self.inner.established_outbound,
            &self.inner.transit,
        ] {
            if let Some(tunnel) = registry.get(&sequence) {
                return Some(Arc::clone(tunnel.value()));
            }
        }
        None
    }

    /// Whether a tunnel is registered as established.
    #[must_use]
    pub fn is_established_registered(&self, sequence: u64) -> bool {
        self.inner.established_inbound.contains_key(&sequence)
            || self.inner.established_outbound.contains_key(&sequence)
    }

    /// Start the background loops: scheduler, inbound pump and tester
    /// pacing. Idempotent; a second call is ignored.
    pub fn run(&self) {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let receiver = self.inner.inbound_rx.lock().ok().and_then(|mut g| g.take());
        if let Some(mut receiver) = receiver {
            let pump = self.clone();
            tokio::spawn(async move {
                while let Some((from, envelope)) = receiver.recv().await {
                    if !pump.inner.running.load(Ordering::SeqCst) {
                        break;
                    }
                    pump.handle_message(&from, &envelope);
                }
            });
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            let mut ticks = 0u64;
            loop {
                interval.tick().await;
                if !scheduler.inner.running.load(Ordering::SeqCst) {
                    break;
                }
                scheduler.tick();
                ticks += 1;
                if ticks % 8 == 0 {
                    scheduler.maintain();
                }
            }
        });

        let pacer = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                if !pacer.inner.running.load(Ordering::SeqCst) {
                    break;
                }
                let tester = Arc::clone(&pacer.inner.tester);
                if let Some(tunnel) = tester.pick_next(&pacer) {
                    tester.start_run(&pacer, &tunnel);
                }
            }
        });

        tracing::info!(router = %self.local_hash(), "tunnel provider started");
    }

    /// Stop the background loops.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }
}
