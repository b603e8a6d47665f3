//! Outbound tunnel role: send-queue batching and gateway obfuscation.

use std::collections::VecDeque;
use std::sync::Mutex;

use veil_crypto::random::{random_16, random_nonzero_u32};

use crate::TUNNEL_DATA_SIZE;
use crate::config::TunnelDirection;
use crate::error::TunnelError;
use crate::frag::{DeliveryInstruction, Fragmenter};
use crate::messages::{MessageEnvelope, TunnelDataMessage, WireMessage, default_expiration};
use crate::tunnel::{TickContext, TunnelCore, TunnelRole};

/// Role strategy for tunnels this router sends into.
///
/// Queued logical messages are batched every tick: fragmented, packed
/// into windows, and layer-encrypted hop by hop in reverse chain order
/// (the gateway obfuscation step), so that each hop's encryption in
/// flight peels one prepared layer and the endpoint recovers plaintext.
pub struct OutboundRole {
    send_queue: Mutex<VecDeque<(DeliveryInstruction, Vec<u8>)>>,
}

impl OutboundRole {
    /// Create an outbound role with an empty send queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            send_queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of queued logical messages.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.send_queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl Default for OutboundRole {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelRole for OutboundRole {
    fn name(&self) -> &'static str {
        "outbound"
    }

    fn direction(&self) -> TunnelDirection {
        TunnelDirection::Outbound
    }

    fn execute_tick(&self, core: &TunnelCore, ctx: &TickContext<'_>) -> Result<(), TunnelError> {
        if !core.is_established() {
            return Ok(());
        }
        let drained: Vec<(DeliveryInstruction, Vec<u8>)> = {
            let Ok(mut queue) = self.send_queue.lock() else {
                return Ok(());
            };
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return Ok(());
        }

        let mut fragments = Vec::new();
        for (instruction, payload) in &drained {
            let message_id = random_nonzero_u32()?;
            fragments.extend(Fragmenter::fragment(message_id, instruction, payload)?);
        }

        let first_hop = &core.config.hops[0];
        for area in Fragmenter::pack_areas(&fragments)? {
            let mut iv = random_16()?;
            let mut window = Fragmenter::build_window(&area, &iv)?;

            // Gateway obfuscation: prepare one inverse layer per hop so the
            // encryption each hop applies in flight cancels at the endpoint.
            for hop in core.config.hops.iter().rev() {
                hop.cipher().decrypt(&mut iv, &mut window)?;
            }

            let envelope = MessageEnvelope {
                id: random_nonzero_u32()?,
                expiration_ms: default_expiration(),
                body: WireMessage::TunnelData(TunnelDataMessage {
                    tunnel_id: first_hop.tunnel_id,
                    iv,
                    window,
                }),
            };
            ctx.transport.send(&first_hop.peer.hash, &envelope);
            core.bandwidth.count_sent(TUNNEL_DATA_SIZE as u64);
        }
        tracing::trace!(
            tunnel = core.sequence,
            messages = drained.len(),
            "flushed outbound send queue"
        );
        Ok(())
    }

    fn enqueue_send(
        &self,
        instruction: DeliveryInstruction,
        payload: Vec<u8>,
    ) -> Result<(), TunnelError> {
        if let Ok(mut queue) = self.send_queue.lock() {
            queue.push_back((instruction, payload));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TunnelConfig, TunnelPool};
    use crate::identity::{IdentHash, RouterIdentity};
    use crate::settings::TunnelSettings;
    use crate::transport::Transport;
    use crate::tunnel::Tunnel;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        sent: StdMutex<Vec<(IdentHash, MessageEnvelope)>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
            }
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, to: &IdentHash, message: &MessageEnvelope) {
            self.sent.lock().unwrap().push((*to, message.clone()));
        }
    }

    #[test]
    fn test_queue_flushes_only_when_established() {
        let peer = RouterIdentity::generate().unwrap().as_peer();
        let first_hop_hash = peer.hash;
        let config = TunnelConfig::outbound(TunnelPool::Client, vec![peer], None).unwrap();
        let settings = TunnelSettings::default();
        let tunnel = Tunnel::new(1, config, &settings, Box::new(OutboundRole::new()));

        tunnel
            .send_message(DeliveryInstruction::Local, b"queued".to_vec())
            .unwrap();

        let transport = RecordingTransport::new();
        let ctx = TickContext {
            transport: &transport,
            settings: &settings,
            local: IdentHash::from_bytes([0u8; 32]),
        };

        tunnel.execute_tick(&ctx).unwrap();
        assert!(transport.sent.lock().unwrap().is_empty());

        tunnel.core().mark_established();
        tunnel.execute_tick(&ctx).unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, first_hop_hash);
        assert!(matches!(sent[0].1.body, WireMessage::TunnelData(_)));
        assert_eq!(tunnel.core().bandwidth.bytes_sent(), TUNNEL_DATA_SIZE as u64);
    }
}
