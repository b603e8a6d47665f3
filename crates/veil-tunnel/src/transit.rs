//! Transit tunnel roles: this router relaying for someone else.
//!
//! A transit tunnel is a 1-hop pass-through: this router holds exactly
//! one layer of the chain, learned from the build record it accepted.
//! Three kinds exist: the gateway of a remote inbound tunnel (wraps and
//! encrypts), a mid-chain participant (encrypts and forwards), and the
//! endpoint of a remote outbound tunnel (encrypts its final layer, which
//! exposes the plaintext window, then reassembles and dispatches).
//!
//! Every transit tunnel carries an independent token-bucket bandwidth
//! limiter; relayed traffic over the allowance is dropped so a flooding
//! transit peer cannot starve local client traffic.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use veil_crypto::LayerCipher;
use veil_crypto::random::{random_16, random_nonzero_u32};

use crate::TUNNEL_DATA_SIZE;
use crate::config::TunnelDirection;
use crate::error::TunnelError;
use crate::frag::{CompletedMessage, DeliveryInstruction, Fragmenter, Reassembler};
use crate::identity::{IdentHash, TunnelId};
use crate::messages::{MessageEnvelope, TunnelDataMessage, WireMessage, default_expiration};
use crate::tunnel::{TickContext, TunnelCore, TunnelRole};

/// Which transit position this router holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitKind {
    /// Gateway of a remote inbound tunnel.
    Gateway,
    /// Mid-chain relay.
    Participant,
    /// Endpoint of a remote outbound tunnel.
    Endpoint,
}

/// Token bucket capping relayed bytes per second.
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec as f64;
        Self {
            // Burst allowance of two seconds of traffic.
            tokens: rate * 2.0,
            max_tokens: rate * 2.0,
            refill_per_sec: rate,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        if elapsed >= Duration::from_millis(100) {
            self.tokens =
                (self.tokens + self.refill_per_sec * elapsed.as_secs_f64()).min(self.max_tokens);
            self.last_refill = now;
        }
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

/// Role strategy for relaying someone else's tunnel.
pub struct TransitRole {
    kind: TransitKind,
    receive_tunnel_id: TunnelId,
    next_ident: IdentHash,
    next_tunnel_id: TunnelId,
    cipher: LayerCipher,
    limiter: Mutex<TokenBucket>,
    reassembler: Mutex<Reassembler>,
    dropped: Mutex<u64>,
}

impl TransitRole {
    /// Create a transit role from the contents of an accepted build
    /// record.
    #[must_use]
    pub fn new(
        kind: TransitKind,
        receive_tunnel_id: TunnelId,
        next_ident: IdentHash,
        next_tunnel_id: TunnelId,
        cipher: LayerCipher,
        bandwidth_per_sec: u64,
    ) -> Self {
        Self {
            kind,
            receive_tunnel_id,
            next_ident,
            next_tunnel_id,
            cipher,
            limiter: Mutex::new(TokenBucket::new(bandwidth_per_sec)),
            reassembler: Mutex::new(Reassembler::new()),
            dropped: Mutex::new(0),
        }
    }

    /// Which transit position this role holds.
    #[must_use]
    pub fn kind(&self) -> TransitKind {
        self.kind
    }

    /// Bytes dropped by the bandwidth limiter.
    #[must_use]
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped.lock().map(|d| *d).unwrap_or(0)
    }

    fn within_budget(&self, core: &TunnelCore, bytes: usize) -> bool {
        let allowed = self
            .limiter
            .lock()
            .map(|mut bucket| bucket.try_consume(bytes as f64))
            .unwrap_or(false);
        if !allowed {
            if let Ok(mut dropped) = self.dropped.lock() {
                *dropped += bytes as u64;
            }
            tracing::debug!(
                tunnel = core.sequence,
                bytes,
                "transit bandwidth cap exceeded, dropping"
            );
        }
        allowed
    }

    fn forward_window(
        &self,
        core: &TunnelCore,
        ctx: &TickContext<'_>,
        mut iv: [u8; 16],
        mut window: Vec<u8>,
    ) -> Result<(), TunnelError> {
        self.cipher.encrypt(&mut iv, &mut window)?;
        let envelope = MessageEnvelope {
            id: random_nonzero_u32()?,
            expiration_ms: default_expiration(),
            body: WireMessage::TunnelData(TunnelDataMessage {
                tunnel_id: self.next_tunnel_id,
                iv,
                window,
            }),
        };
        ctx.transport.send(&self.next_ident, &envelope);
        core.bandwidth.count_sent(TUNNEL_DATA_SIZE as u64);
        Ok(())
    }

    fn receive_gateway(
        &self,
        core: &TunnelCore,
        ctx: &TickContext<'_>,
        payload: &[u8],
    ) -> Result<(), TunnelError> {
        let message_id = random_nonzero_u32()?;
        let fragments = Fragmenter::fragment(message_id, &DeliveryInstruction::Local, payload)?;
        for area in Fragmenter::pack_areas(&fragments)? {
            let iv = random_16()?;
            let window = Fragmenter::build_window(&area, &iv)?;
            self.forward_window(core, ctx, iv, window)?;
        }
        Ok(())
    }

    fn receive_endpoint(
        &self,
        core: &TunnelCore,
        ctx: &TickContext<'_>,
        data: &TunnelDataMessage,
    ) -> Result<(), TunnelError> {
        let mut iv = data.iv;
        let mut window = data.window.clone();
        // The endpoint's own layer is the last applied; adding it exposes
        // the plaintext window the creator prepared.
        self.cipher.encrypt(&mut iv, &mut window)?;

        let completions = {
            let Ok(mut reassembler) = self.reassembler.lock() else {
                return Ok(());
            };
            match reassembler.ingest_window(&iv, &window) {
                Ok(completions) => completions,
                Err(err) => {
                    core.quality.count_checksum_failure();
                    return Err(err.into());
                }
            }
        };
        for completed in completions {
            self.dispatch_completion(core, ctx, completed);
        }
        Ok(())
    }

    fn dispatch_completion(
        &self,
        core: &TunnelCore,
        ctx: &TickContext<'_>,
        completed: CompletedMessage,
    ) {
        match completed.instruction {
            DeliveryInstruction::Router(hash) => match MessageEnvelope::decode(&completed.payload) {
                Ok(envelope) => ctx.transport.send(&hash, &envelope),
                Err(err) => {
                    tracing::warn!(tunnel = core.sequence, %err, "dropping bad router delivery");
                }
            },
            DeliveryInstruction::Tunnel(hash, tunnel_id) => {
                let envelope = MessageEnvelope {
                    id: completed.message_id,
                    expiration_ms: default_expiration(),
                    body: WireMessage::TunnelGateway {
                        tunnel_id,
                        payload: completed.payload,
                    },
                };
                ctx.transport.send(&hash, &envelope);
            }
            // Local delivery at a foreign endpoint has nowhere to go.
            DeliveryInstruction::Local => {
                tracing::debug!(
                    tunnel = core.sequence,
                    message = completed.message_id,
                    "discarding local delivery at transit endpoint"
                );
            }
        }
    }
}

impl TunnelRole for TransitRole {
    fn name(&self) -> &'static str {
        match self.kind {
            TransitKind::Gateway => "transit-gateway",
            TransitKind::Participant => "transit-participant",
            TransitKind::Endpoint => "transit-endpoint",
        }
    }

    fn direction(&self) -> TunnelDirection {
        // Transit tunnels relay inward from this router's perspective.
        TunnelDirection::Inbound
    }

    fn execute_tick(&self, core: &TunnelCore, ctx: &TickContext<'_>) -> Result<(), TunnelError> {
        if self.kind != TransitKind::Endpoint {
            return Ok(());
        }
        let Ok(mut reassembler) = self.reassembler.lock() else {
            return Ok(());
        };
        reassembler.evict_idle(ctx.settings.fragment_eviction_window);
        let buffered = reassembler.buffered_fragments();
        if buffered > ctx.settings.max_buffered_fragments {
            return Err(TunnelError::BufferExhausted(buffered));
        }
        let _ = core;
        Ok(())
    }

    fn receive(
        &self,
        core: &TunnelCore,
        ctx: &TickContext<'_>,
        envelope: &MessageEnvelope,
    ) -> Result<(), TunnelError> {
        match (&envelope.body, self.kind) {
            (WireMessage::TunnelGateway { payload, .. }, TransitKind::Gateway) => {
                if !self.within_budget(core, payload.len()) {
                    return Ok(());
                }
                core.bandwidth.count_received(payload.len() as u64);
                self.receive_gateway(core, ctx, payload)
            }
            (WireMessage::TunnelData(data), TransitKind::Participant) => {
                if !self.within_budget(core, TUNNEL_DATA_SIZE) {
                    return Ok(());
                }
                core.bandwidth.count_received(TUNNEL_DATA_SIZE as u64);
                self.forward_window(core, ctx, data.iv, data.window.clone())
            }
            (WireMessage::TunnelData(data), TransitKind::Endpoint) => {
                if !self.within_budget(core, TUNNEL_DATA_SIZE) {
                    return Ok(());
                }
                core.bandwidth.count_received(TUNNEL_DATA_SIZE as u64);
                self.receive_endpoint(core, ctx, data)
            }
            _ => Err(TunnelError::WrongRole(self.name())),
        }
    }

    fn receive_tunnel_id(&self, _core: &TunnelCore) -> Option<TunnelId> {
        Some(self.receive_tunnel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_crypto::{IvKey, LayerKey};

    #[test]
    fn test_token_bucket_caps_and_refills() {
        let mut bucket = TokenBucket::new(1000);
        assert!(bucket.try_consume(2000.0));
        assert!(!bucket.try_consume(1.0));

        std::thread::sleep(Duration::from_millis(150));
        assert!(bucket.try_consume(100.0));
    }

    #[test]
    fn test_transit_drops_over_budget() {
        let role = TransitRole::new(
            TransitKind::Participant,
            TunnelId::new(1),
            IdentHash::from_bytes([2u8; 32]),
            TunnelId::new(3),
            LayerCipher::new(&LayerKey::from_bytes([0u8; 32]), &IvKey::from_bytes([0u8; 32])),
            10,
        );
        // Burst allowance is 20 bytes; a full window cannot fit.
        let config = crate::config::TunnelConfig {
            direction: TunnelDirection::Inbound,
            pool: crate::config::TunnelPool::Transit,
            hops: Vec::new(),
            destination: None,
        };
        let settings = crate::settings::TunnelSettings::default();
        let tunnel = crate::tunnel::Tunnel::with_lifetime(
            7,
            config,
            Duration::from_secs(600),
            Duration::ZERO,
            Box::new(role),
        );
        tunnel.core().mark_established();

        struct NullTransport;
        impl crate::transport::Transport for NullTransport {
            fn send(&self, _: &IdentHash, _: &MessageEnvelope) {}
        }
        let transport = NullTransport;
        let ctx = TickContext {
            transport: &transport,
            settings: &settings,
            local: IdentHash::from_bytes([9u8; 32]),
        };
        let envelope = MessageEnvelope {
            id: 1,
            expiration_ms: 0,
            body: WireMessage::TunnelData(
                TunnelDataMessage::new(
                    TunnelId::new(1),
                    [0u8; 16],
                    vec![0u8; crate::TUNNEL_DATA_WINDOW],
                )
                .unwrap(),
            ),
        };
        // Dropped silently, no bytes accounted.
        tunnel.receive(&ctx, &envelope).unwrap();
        assert_eq!(tunnel.core().bandwidth.bytes_received(), 0);
    }
}
