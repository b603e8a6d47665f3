//! Tunnel owners: the pool policies above the provider.
//!
//! An owner receives exactly one lifecycle callback per terminal
//! transition of each tunnel it owns, and runs a periodic "build enough
//! tunnels" policy against the provider.

mod client;
mod exploratory;
mod transit;

pub use client::ClientOwner;
pub use exploratory::ExploratoryOwner;
pub use transit::TransitOwner;

use std::sync::Arc;

use crate::provider::TunnelProvider;
use crate::tunnel::Tunnel;

/// Lifecycle callback contract between the provider and a pool owner.
///
/// Every callback fires exactly once per terminal transition; the
/// provider gates them on the tunnel's sticky terminated flag.
pub trait TunnelOwner: Send + Sync {
    /// Owner name for logging.
    fn name(&self) -> &'static str;

    /// The tunnel completed its build handshake.
    fn tunnel_established(&self, tunnel: &Arc<Tunnel>);

    /// The build was rejected by a hop or timed out.
    fn tunnel_build_failed(&self, tunnel: &Arc<Tunnel>, was_timeout: bool);

    /// An established tunnel failed (tick error or liveness failure).
    fn tunnel_failed(&self, tunnel: &Arc<Tunnel>);

    /// An established tunnel reached the end of its lifetime.
    fn tunnel_expired(&self, tunnel: &Arc<Tunnel>);

    /// Periodic policy: build replacements up to the pool targets.
    /// `me` is this owner's shared handle, passed back to
    /// [`TunnelProvider::create_tunnel`] for new builds.
    fn maintain(&self, provider: &TunnelProvider, me: &Arc<dyn TunnelOwner>);
}
