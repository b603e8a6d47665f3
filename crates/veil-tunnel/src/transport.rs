//! Interface to the transport collaborator and local message handlers.

use std::sync::Arc;

use crate::identity::IdentHash;
use crate::messages::MessageEnvelope;

/// The datagram transport as seen by the tunnel layer.
///
/// Sending is fire-and-forget: the transport queues the message and the
/// call returns immediately, so the scheduler loop is never blocked on
/// the network. Received messages are fed back into the provider by the
/// host (see `TunnelProvider::submit_message`).
pub trait Transport: Send + Sync {
    /// Send a wire message to a peer.
    fn send(&self, to: &IdentHash, message: &MessageEnvelope);
}

/// Handlers for logical messages that terminate at this router but belong
/// to other subsystems. Invocations are dispatched off the delivery path,
/// so a slow handler cannot stall tunnel scheduling.
pub trait LocalMessageHandler: Send + Sync {
    /// A garlic container arrived for the session layer.
    fn handle_garlic(&self, _data: Vec<u8>) {}

    /// A database store arrived for the netdb layer.
    fn handle_database_store(&self, _data: Vec<u8>) {}

    /// An unfragmented data payload arrived for the host.
    fn handle_data(&self, _data: Vec<u8>) {}
}

/// Handler that discards everything. Useful for relays and tests.
pub struct NoopHandler;

impl LocalMessageHandler for NoopHandler {}

/// Dispatch a handler invocation asynchronously when a runtime is
/// available, inline otherwise (tests without a runtime).
pub(crate) fn dispatch<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { f() });
    } else {
        f();
    }
}

/// Convenience alias for a shared handler.
pub type SharedHandler = Arc<dyn LocalMessageHandler>;
