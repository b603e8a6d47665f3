//! Zero-hop fallback tunnel.
//!
//! A degenerate inbound tunnel with no relay hops: this router is its own
//! gateway. It exists to unblock bootstrapping — an outbound build needs a
//! reply tunnel before any real inbound tunnel is established — and is
//! never used for traffic that needs privacy. It is established at
//! creation, never needs recreation, and carries a short fixed lifetime.

use tokio::sync::mpsc::UnboundedSender;

use crate::config::TunnelDirection;
use crate::error::TunnelError;
use crate::identity::{IdentHash, TunnelId};
use crate::messages::{MessageEnvelope, WireMessage};
use crate::tunnel::{TickContext, TunnelCore, TunnelRole};

/// Role strategy for the zero-hop fallback.
pub struct ZeroHopRole {
    local: IdentHash,
    tunnel_id: TunnelId,
    resubmit: UnboundedSender<(IdentHash, MessageEnvelope)>,
}

impl ZeroHopRole {
    /// Create a zero-hop role listening on the given tunnel ID.
    #[must_use]
    pub fn new(
        local: IdentHash,
        tunnel_id: TunnelId,
        resubmit: UnboundedSender<(IdentHash, MessageEnvelope)>,
    ) -> Self {
        Self {
            local,
            tunnel_id,
            resubmit,
        }
    }
}

impl TunnelRole for ZeroHopRole {
    fn name(&self) -> &'static str {
        "zero-hop"
    }

    fn direction(&self) -> TunnelDirection {
        TunnelDirection::Inbound
    }

    fn execute_tick(&self, _core: &TunnelCore, _ctx: &TickContext<'_>) -> Result<(), TunnelError> {
        Ok(())
    }

    fn receive(
        &self,
        core: &TunnelCore,
        _ctx: &TickContext<'_>,
        envelope: &MessageEnvelope,
    ) -> Result<(), TunnelError> {
        let WireMessage::TunnelGateway { payload, .. } = &envelope.body else {
            return Err(TunnelError::WrongRole(self.name()));
        };
        core.bandwidth.count_received(payload.len() as u64);
        match MessageEnvelope::decode(payload) {
            Ok(inner) => {
                let _ = self.resubmit.send((self.local, inner));
                Ok(())
            }
            Err(err) => {
                tracing::warn!(tunnel = core.sequence, %err, "bad zero-hop gateway payload");
                Ok(())
            }
        }
    }

    fn receive_tunnel_id(&self, _core: &TunnelCore) -> Option<TunnelId> {
        Some(self.tunnel_id)
    }

    fn gateway(&self, _core: &TunnelCore) -> Option<(IdentHash, TunnelId)> {
        Some((self.local, self.tunnel_id))
    }
}
