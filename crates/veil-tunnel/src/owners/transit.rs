//! Transit owner: answering build requests from other routers.
//!
//! The transit owner never builds tunnels of its own. It decides whether
//! to relay for others, subject to an admission policy: recently seen
//! build requests are dropped (anti-replay), a capacity cap bounds the
//! transit pool, and a router struggling to build its own client tunnels
//! declines to relay at all.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use veil_crypto::{LayerCipher, sha256, trunc16};

use crate::config::{TunnelConfig, TunnelDirection, TunnelPool};
use crate::messages::{MessageEnvelope, WireMessage, default_expiration};
use crate::owners::TunnelOwner;
use crate::provider::TunnelProvider;
use crate::records::{BuildReply, HopRole, OpenedRecord, write_reply};
use crate::transit::{TransitKind, TransitRole};
use crate::tunnel::Tunnel;

/// Owner answering tunnel build requests for which this router is a
/// gateway, participant or endpoint.
pub struct TransitOwner {
    seen_requests: DashMap<[u8; 16], Instant>,
}

impl TransitOwner {
    /// Create the transit owner.
    #[must_use]
    pub fn new() -> Self {
        Self {
            seen_requests: DashMap::new(),
        }
    }

    /// Decide on, answer, and forward a build request addressed to this
    /// router. `records` is the build message as received; `role` is the
    /// classification already derived from the opened record.
    pub fn handle_build_request(
        &self,
        provider: &TunnelProvider,
        opened: &OpenedRecord,
        mut records: Vec<Vec<u8>>,
        role: HopRole,
    ) {
        let settings = provider.settings();

        // Anti-replay: a request whose reduced hash was seen recently is
        // dropped outright, not answered.
        let reduced = trunc16(&sha256(&records[opened.index]));
        self.seen_requests
            .retain(|_, at| at.elapsed() <= settings.transit_replay_window);
        if self.seen_requests.insert(reduced, Instant::now()).is_some() {
            tracing::debug!("dropping replayed build request");
            return;
        }

        let at_capacity = provider.transit_count() >= settings.max_transit_tunnels;
        let degraded = provider.client_health_degraded();
        let reply = if at_capacity || degraded {
            tracing::debug!(at_capacity, degraded, "declining transit build request");
            BuildReply::Reject
        } else {
            BuildReply::Accept
        };

        let request = &opened.request;
        if let Err(err) = write_reply(
            &mut records,
            opened.index,
            &request.reply_key,
            &request.reply_iv,
            reply,
        ) {
            tracing::warn!(%err, "failed to answer build request");
            return;
        }

        if reply == BuildReply::Accept {
            let kind = match role {
                HopRole::InboundGateway => TransitKind::Gateway,
                HopRole::OutboundEndpoint => TransitKind::Endpoint,
                HopRole::Participant => TransitKind::Participant,
                // Own-terminus records never reach the transit owner.
                HopRole::OwnInboundTerminus => return,
            };
            let transit_role = TransitRole::new(
                kind,
                request.receive_tunnel_id,
                request.next_ident,
                request.next_tunnel_id,
                LayerCipher::new(&request.layer_key, &request.iv_key),
                settings.transit_bandwidth_per_tunnel,
            );
            let config = TunnelConfig {
                direction: TunnelDirection::Inbound,
                pool: TunnelPool::Transit,
                hops: Vec::new(),
                destination: None,
            };
            let tunnel = Tunnel::with_lifetime(
                provider.next_sequence(),
                config,
                settings.lifetime,
                Duration::ZERO,
                Box::new(transit_role),
            );
            tunnel.core().mark_established();
            provider.register_transit_tunnel(Arc::new(tunnel));
        }

        self.forward_answer(provider, request, role, records);
    }

    fn forward_answer(
        &self,
        provider: &TunnelProvider,
        request: &crate::records::BuildRequestRecord,
        role: HopRole,
        records: Vec<Vec<u8>>,
    ) {
        match role {
            // The endpoint turns the record set into the build reply and
            // routes it back through the creator's reply tunnel.
            HopRole::OutboundEndpoint => {
                let reply = MessageEnvelope {
                    id: request.reply_msg_id,
                    expiration_ms: default_expiration(),
                    body: WireMessage::TunnelBuildReply(records),
                };
                let envelope = MessageEnvelope {
                    id: request.reply_msg_id,
                    expiration_ms: default_expiration(),
                    body: WireMessage::TunnelGateway {
                        tunnel_id: request.next_tunnel_id,
                        payload: reply.encode(),
                    },
                };
                provider.transport().send(&request.next_ident, &envelope);
            }
            // Gateways and participants pass the build message onward.
            _ => {
                let envelope = MessageEnvelope {
                    id: request.reply_msg_id,
                    expiration_ms: default_expiration(),
                    body: WireMessage::TunnelBuild(records),
                };
                provider.transport().send(&request.next_ident, &envelope);
            }
        }
    }

    /// Recently seen build-request hashes currently tracked.
    #[must_use]
    pub fn seen_request_count(&self) -> usize {
        self.seen_requests.len()
    }
}

impl Default for TransitOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelOwner for TransitOwner {
    fn name(&self) -> &'static str {
        "transit"
    }

    fn tunnel_established(&self, _tunnel: &Arc<Tunnel>) {}

    fn tunnel_build_failed(&self, _tunnel: &Arc<Tunnel>, _was_timeout: bool) {}

    fn tunnel_failed(&self, tunnel: &Arc<Tunnel>) {
        tracing::debug!(tunnel = tunnel.core().sequence, "transit tunnel failed");
    }

    fn tunnel_expired(&self, tunnel: &Arc<Tunnel>) {
        tracing::debug!(tunnel = tunnel.core().sequence, "transit tunnel expired");
    }

    // Transit tunnels are created on demand by incoming requests; there
    // is nothing to build proactively.
    fn maintain(&self, _provider: &TunnelProvider, _me: &Arc<dyn TunnelOwner>) {}
}
