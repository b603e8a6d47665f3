//! Inbound tunnel role: layer unwinding, reassembly and dispatch.

use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;

use crate::TUNNEL_DATA_SIZE;
use crate::config::TunnelDirection;
use crate::error::TunnelError;
use crate::frag::{CompletedMessage, DeliveryInstruction, Reassembler};
use crate::identity::{IdentHash, TunnelId};
use crate::messages::{MessageEnvelope, WireMessage, default_expiration};
use crate::transport::{SharedHandler, dispatch};
use crate::tunnel::{TickContext, TunnelCore, TunnelRole};

/// Role strategy for tunnels terminating at this router.
///
/// Received tunnel-data windows are unwound by applying each relay hop's
/// layer key (this router's own terminal entry excluded), verified against
/// their truncated checksum, reassembled, and dispatched by the embedded
/// delivery instruction. Logical messages that belong to other subsystems
/// (garlic, database store) are handed to the local handler off the
/// delivery path; tunnel-layer messages (build replies, delivery-status
/// acks) are resubmitted to the provider's inbound queue.
pub struct InboundRole {
    reassembler: Mutex<Reassembler>,
    handler: SharedHandler,
    resubmit: UnboundedSender<(IdentHash, MessageEnvelope)>,
}

impl InboundRole {
    /// Create an inbound role.
    #[must_use]
    pub fn new(
        handler: SharedHandler,
        resubmit: UnboundedSender<(IdentHash, MessageEnvelope)>,
    ) -> Self {
        Self {
            reassembler: Mutex::new(Reassembler::new()),
            handler,
            resubmit,
        }
    }

    fn dispatch_completion(
        &self,
        core: &TunnelCore,
        ctx: &TickContext<'_>,
        completed: &CompletedMessage,
    ) {
        match &completed.instruction {
            DeliveryInstruction::Local => match MessageEnvelope::decode(&completed.payload) {
                Ok(envelope) => self.deliver_local(ctx, envelope),
                Err(err) => {
                    tracing::warn!(
                        tunnel = core.sequence,
                        message = completed.message_id,
                        %err,
                        "dropping undecodable local delivery"
                    );
                }
            },
            DeliveryInstruction::Router(hash) => match MessageEnvelope::decode(&completed.payload) {
                Ok(envelope) => ctx.transport.send(hash, &envelope),
                Err(err) => {
                    tracing::warn!(tunnel = core.sequence, %err, "dropping bad router delivery");
                }
            },
            DeliveryInstruction::Tunnel(hash, tunnel_id) => {
                let envelope = MessageEnvelope {
                    id: completed.message_id,
                    expiration_ms: default_expiration(),
                    body: WireMessage::TunnelGateway {
                        tunnel_id: *tunnel_id,
                        payload: completed.payload.clone(),
                    },
                };
                ctx.transport.send(hash, &envelope);
            }
        }
    }

    fn deliver_local(&self, ctx: &TickContext<'_>, envelope: MessageEnvelope) {
        match envelope.body {
            WireMessage::Garlic(data) => {
                let handler = self.handler.clone();
                dispatch(move || handler.handle_garlic(data));
            }
            WireMessage::DatabaseStore(data) => {
                let handler = self.handler.clone();
                dispatch(move || handler.handle_database_store(data));
            }
            // Tunnel-layer messages loop back into the provider.
            _ => {
                let _ = self.resubmit.send((ctx.local, envelope));
            }
        }
    }
}

impl TunnelRole for InboundRole {
    fn name(&self) -> &'static str {
        "inbound"
    }

    fn direction(&self) -> TunnelDirection {
        TunnelDirection::Inbound
    }

    fn execute_tick(&self, core: &TunnelCore, ctx: &TickContext<'_>) -> Result<(), TunnelError> {
        let Ok(mut reassembler) = self.reassembler.lock() else {
            return Ok(());
        };
        let evicted = reassembler.evict_idle(ctx.settings.fragment_eviction_window);
        if evicted > 0 {
            tracing::debug!(tunnel = core.sequence, evicted, "evicted stale fragment buffers");
        }
        let buffered = reassembler.buffered_fragments();
        if buffered > ctx.settings.max_buffered_fragments {
            return Err(TunnelError::BufferExhausted(buffered));
        }
        Ok(())
    }

    fn receive(
        &self,
        core: &TunnelCore,
        ctx: &TickContext<'_>,
        envelope: &MessageEnvelope,
    ) -> Result<(), TunnelError> {
        let WireMessage::TunnelData(data) = &envelope.body else {
            return Err(TunnelError::WrongRole(self.name()));
        };
        core.bandwidth.count_received(TUNNEL_DATA_SIZE as u64);

        let mut iv = data.iv;
        let mut window = data.window.clone();
        let relay_hops = core.config.relay_hop_count();
        for hop in core.config.hops[..relay_hops].iter().rev() {
            hop.cipher().decrypt(&mut iv, &mut window)?;
        }

        let completions = {
            let Ok(mut reassembler) = self.reassembler.lock() else {
                return Ok(());
            };
            match reassembler.ingest_window(&iv, &window) {
                Ok(completions) => completions,
                Err(err) => {
                    let failures = core.quality.count_checksum_failure();
                    tracing::warn!(
                        tunnel = core.sequence,
                        failures,
                        %err,
                        "dropping tunnel-data window"
                    );
                    return Err(err.into());
                }
            }
        };

        for completed in completions {
            core.push_received(completed.clone());
            self.dispatch_completion(core, ctx, &completed);
        }
        Ok(())
    }

    fn receive_tunnel_id(&self, core: &TunnelCore) -> Option<TunnelId> {
        core.config.hops.last().map(|hop| hop.tunnel_id)
    }

    fn gateway(&self, core: &TunnelCore) -> Option<(IdentHash, TunnelId)> {
        core.config.hops.first().map(|hop| (hop.peer.hash, hop.tunnel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TunnelConfig, TunnelPool};
    use crate::frag::Fragmenter;
    use crate::identity::RouterIdentity;
    use crate::messages::TunnelDataMessage;
    use crate::settings::TunnelSettings;
    use crate::transport::{NoopHandler, Transport};
    use crate::tunnel::Tunnel;
    use std::sync::Arc;
    use veil_crypto::random::random_16;

    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&self, _: &IdentHash, _: &MessageEnvelope) {}
    }

    fn make_inbound(
        peers: usize,
    ) -> (
        Tunnel,
        RouterIdentity,
        tokio::sync::mpsc::UnboundedReceiver<(IdentHash, MessageEnvelope)>,
    ) {
        let local = RouterIdentity::generate().unwrap();
        let peers: Vec<_> = (0..peers)
            .map(|_| RouterIdentity::generate().unwrap().as_peer())
            .collect();
        let config = TunnelConfig::inbound(TunnelPool::Client, peers, &local, None).unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let settings = TunnelSettings::default();
        let role = InboundRole::new(Arc::new(NoopHandler), tx);
        let tunnel = Tunnel::new(1, config, &settings, Box::new(role));
        tunnel.core().mark_established();
        (tunnel, local, rx)
    }

    /// Simulate the relay hops' in-flight encryption and the creator's
    /// unwind for a window entering at the gateway.
    #[test]
    fn test_receive_delivers_through_all_layers() {
        let (tunnel, _local, mut rx) = make_inbound(2);
        let settings = TunnelSettings::default();

        let inner = MessageEnvelope {
            id: 9,
            expiration_ms: 0,
            body: WireMessage::DeliveryStatus {
                status_id: 1234,
                created_ms: 1,
            },
        };
        let fragments =
            Fragmenter::fragment(55, &DeliveryInstruction::Local, &inner.encode()).unwrap();
        let area = Fragmenter::pack_areas(&fragments).unwrap().remove(0);

        let mut iv = random_16().unwrap();
        let mut window = Fragmenter::build_window(&area, &iv).unwrap();
        // Relay hops encrypt in chain order as the message moves inward.
        for hop in &tunnel.core().config.hops[..2] {
            hop.cipher().encrypt(&mut iv, &mut window).unwrap();
        }

        let envelope = MessageEnvelope {
            id: 1,
            expiration_ms: 0,
            body: WireMessage::TunnelData(
                TunnelDataMessage::new(tunnel.receive_tunnel_id().unwrap(), iv, window).unwrap(),
            ),
        };
        let transport = NullTransport;
        let ctx = TickContext {
            transport: &transport,
            settings: &settings,
            local: IdentHash::from_bytes([1u8; 32]),
        };
        tunnel.receive(&ctx, &envelope).unwrap();

        let queued = tunnel.core().pop_received().unwrap();
        assert_eq!(queued.payload, inner.encode());

        let (_, resubmitted) = rx.try_recv().unwrap();
        assert_eq!(resubmitted, inner);
    }

    #[test]
    fn test_corrupted_window_counts_checksum_failure() {
        let (tunnel, _local, _rx) = make_inbound(1);
        let settings = TunnelSettings::default();

        let envelope = MessageEnvelope {
            id: 1,
            expiration_ms: 0,
            body: WireMessage::TunnelData(
                TunnelDataMessage::new(
                    tunnel.receive_tunnel_id().unwrap(),
                    [0u8; 16],
                    vec![0xA5u8; crate::TUNNEL_DATA_WINDOW],
                )
                .unwrap(),
            ),
        };
        let transport = NullTransport;
        let ctx = TickContext {
            transport: &transport,
            settings: &settings,
            local: IdentHash::from_bytes([1u8; 32]),
        };
        assert!(tunnel.receive(&ctx, &envelope).is_err());
        assert_eq!(tunnel.core().quality.checksum_failures(), 1);
        assert!(tunnel.core().pop_received().is_none());
    }
}
