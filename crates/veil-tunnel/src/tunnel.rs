//! The tunnel entity: shared lifecycle, quality and bandwidth state,
//! composed with a role-specific behavior strategy.
//!
//! Tunnel state is derived from timestamps and the sticky terminated
//! flag, never stored as a mutable enum, so the state machine
//!
//! ```text
//! Pending → Established → {Active → NeedsRecreation} → Expired → Terminated
//! ```
//!
//! is monotonic by construction: once the terminated flag is set it is
//! never cleared, and the timestamp comparisons only move forward.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::{TunnelConfig, TunnelDirection, TunnelPool};
use crate::error::TunnelError;
use crate::frag::{CompletedMessage, DeliveryInstruction};
use crate::identity::{IdentHash, TunnelId};
use crate::messages::MessageEnvelope;
use crate::settings::TunnelSettings;
use crate::transport::Transport;

/// Derived tunnel state.
///
/// `Active` and `NeedsRecreation` partition the established phase; use
/// [`TunnelCore::is_established`] for the undivided established check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Built but not yet confirmed by a build reply.
    Pending,
    /// Established with comfortable lifetime remaining.
    Active,
    /// Established, but a replacement should be built now.
    NeedsRecreation,
    /// Past its lifetime; must be shut down and deregistered.
    Expired,
    /// Explicitly shut down. Terminal.
    Terminated,
}

/// Liveness and quality record of a tunnel.
pub struct TunnelQuality {
    min_latency_ms: AtomicU64,
    build_time_per_hop_ms: AtomicU64,
    passed_test: AtomicBool,
    test_passes: AtomicU32,
    test_failures: AtomicU32,
    checksum_failures: AtomicU32,
}

impl TunnelQuality {
    fn new() -> Self {
        Self {
            min_latency_ms: AtomicU64::new(u64::MAX),
            build_time_per_hop_ms: AtomicU64::new(0),
            passed_test: AtomicBool::new(false),
            test_passes: AtomicU32::new(0),
            test_failures: AtomicU32::new(0),
            checksum_failures: AtomicU32::new(0),
        }
    }

    /// Record a measured round-trip latency.
    pub fn record_latency(&self, ms: u64) {
        self.min_latency_ms.fetch_min(ms, Ordering::Relaxed);
    }

    /// Minimum measured latency, if any probe has completed.
    #[must_use]
    pub fn min_latency_ms(&self) -> Option<u64> {
        match self.min_latency_ms.load(Ordering::Relaxed) {
            u64::MAX => None,
            ms => Some(ms),
        }
    }

    /// Record the observed build time per hop.
    pub fn record_build_time_per_hop(&self, ms: u64) {
        self.build_time_per_hop_ms.store(ms, Ordering::Relaxed);
    }

    /// Observed build time per hop in milliseconds.
    #[must_use]
    pub fn build_time_per_hop_ms(&self) -> u64 {
        self.build_time_per_hop_ms.load(Ordering::Relaxed)
    }

    /// Mark the tunnel as having passed a liveness test.
    pub fn mark_passed_test(&self) {
        self.passed_test.store(true, Ordering::Relaxed);
    }

    /// Whether a liveness test has ever passed.
    #[must_use]
    pub fn passed_test(&self) -> bool {
        self.passed_test.load(Ordering::Relaxed)
    }

    /// Tally a test result this tunnel participated in.
    pub fn tally_test(&self, passed: bool) {
        if passed {
            self.test_passes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.test_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Accumulated (passes, failures) from test participation.
    #[must_use]
    pub fn test_tally(&self) -> (u32, u32) {
        (
            self.test_passes.load(Ordering::Relaxed),
            self.test_failures.load(Ordering::Relaxed),
        )
    }

    /// Count a checksum failure on received tunnel data.
    pub fn count_checksum_failure(&self) -> u32 {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Checksum failures observed so far.
    #[must_use]
    pub fn checksum_failures(&self) -> u32 {
        self.checksum_failures.load(Ordering::Relaxed)
    }
}

/// Bandwidth accounting: running totals plus a rolling bitrate window.
pub struct BandwidthCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    window_sent: AtomicU64,
    window_received: AtomicU64,
    bitrate_sent: AtomicU64,
    bitrate_received: AtomicU64,
    window_started: Mutex<Instant>,
}

impl BandwidthCounters {
    fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            window_sent: AtomicU64::new(0),
            window_received: AtomicU64::new(0),
            bitrate_sent: AtomicU64::new(0),
            bitrate_received: AtomicU64::new(0),
            window_started: Mutex::new(Instant::now()),
        }
    }

    /// Account bytes sent into the tunnel.
    pub fn count_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.window_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Account bytes received from the tunnel.
    pub fn count_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.window_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total bytes sent.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total bytes received.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Close the current measurement window and update the bitrates.
    pub fn roll_window(&self) {
        let Ok(mut started) = self.window_started.lock() else {
            return;
        };
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let sent = self.window_sent.swap(0, Ordering::Relaxed);
        let received = self.window_received.swap(0, Ordering::Relaxed);
        self.bitrate_sent
            .store((sent as f64 * 8.0 / elapsed) as u64, Ordering::Relaxed);
        self.bitrate_received
            .store((received as f64 * 8.0 / elapsed) as u64, Ordering::Relaxed);
        *started = Instant::now();
    }

    /// (send, receive) bitrate in bits per second over the last window.
    #[must_use]
    pub fn bitrates(&self) -> (u64, u64) {
        (
            self.bitrate_sent.load(Ordering::Relaxed),
            self.bitrate_received.load(Ordering::Relaxed),
        )
    }
}

/// Shared lifecycle and accounting state of a tunnel.
pub struct TunnelCore {
    /// Sequence ID for debug tracing.
    pub sequence: u64,
    /// Immutable configuration the tunnel was built from.
    pub config: TunnelConfig,
    /// Creation timestamp.
    pub created_at: Instant,
    /// Nominal lifetime.
    pub lifetime: Duration,
    /// Liveness and quality record.
    pub quality: TunnelQuality,
    /// Bandwidth counters.
    pub bandwidth: BandwidthCounters,
    established_at: Mutex<Option<Instant>>,
    terminated: AtomicBool,
    recreation_margin: Duration,
    receive_queue: Mutex<VecDeque<CompletedMessage>>,
    build_results: Mutex<Option<Vec<crate::records::HopBuildResult>>>,
}

impl TunnelCore {
    fn new(sequence: u64, config: TunnelConfig, lifetime: Duration, margin: Duration) -> Self {
        Self {
            sequence,
            config,
            created_at: Instant::now(),
            lifetime,
            quality: TunnelQuality::new(),
            bandwidth: BandwidthCounters::new(),
            established_at: Mutex::new(None),
            terminated: AtomicBool::new(false),
            recreation_margin: margin,
            receive_queue: Mutex::new(VecDeque::new()),
            build_results: Mutex::new(None),
        }
    }

    /// Derive the current state.
    #[must_use]
    pub fn state(&self) -> TunnelState {
        if self.terminated.load(Ordering::Acquire) {
            return TunnelState::Terminated;
        }
        let established = self.established_at.lock().ok().and_then(|guard| *guard);
        match established {
            None => {
                if self.created_at.elapsed() > self.lifetime.mul_f64(1.1) {
                    TunnelState::Expired
                } else {
                    TunnelState::Pending
                }
            }
            Some(at) => {
                let elapsed = at.elapsed();
                if elapsed > self.lifetime {
                    TunnelState::Expired
                } else if self.lifetime - elapsed < self.recreation_margin {
                    TunnelState::NeedsRecreation
                } else {
                    TunnelState::Active
                }
            }
        }
    }

    /// Mark the tunnel established. Records the establishment timestamp
    /// once; later calls are ignored.
    pub fn mark_established(&self) {
        if let Ok(mut guard) = self.established_at.lock() {
            guard.get_or_insert_with(Instant::now);
        }
    }

    /// Whether the tunnel has been established.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.established_at
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Time since establishment, if established.
    #[must_use]
    pub fn established_age(&self) -> Option<Duration> {
        self.established_at
            .lock()
            .ok()
            .and_then(|guard| *guard)
            .map(|at| at.elapsed())
    }

    /// Set the sticky terminated flag. Returns `true` exactly once, so
    /// callers can gate the single owner notification on it.
    pub fn terminate(&self) -> bool {
        !self.terminated.swap(true, Ordering::AcqRel)
    }

    /// Whether the tunnel has been terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Queue a delivered logical message for host consumption.
    pub fn push_received(&self, message: CompletedMessage) {
        if let Ok(mut queue) = self.receive_queue.lock() {
            queue.push_back(message);
        }
    }

    /// Pop the oldest delivered logical message.
    pub fn pop_received(&self) -> Option<CompletedMessage> {
        self.receive_queue.lock().ok()?.pop_front()
    }

    /// Store the per-hop outcomes of the unwound build reply.
    pub fn set_build_results(&self, results: Vec<crate::records::HopBuildResult>) {
        if let Ok(mut guard) = self.build_results.lock() {
            *guard = Some(results);
        }
    }

    /// Per-hop outcomes of the unwound build reply, if one arrived.
    #[must_use]
    pub fn build_results(&self) -> Option<Vec<crate::records::HopBuildResult>> {
        self.build_results.lock().ok()?.clone()
    }
}

/// Per-tick environment handed to tunnel roles.
pub struct TickContext<'a> {
    /// The transport collaborator.
    pub transport: &'a dyn Transport,
    /// Subsystem settings.
    pub settings: &'a TunnelSettings,
    /// This router's identity hash.
    pub local: IdentHash,
}

/// Role-specific tunnel behavior, composed into [`Tunnel`].
pub trait TunnelRole: Send + Sync {
    /// Role name for logging and role-mismatch errors.
    fn name(&self) -> &'static str;

    /// Direction of the tunnel relative to this router.
    fn direction(&self) -> TunnelDirection;

    /// Run one scheduling tick.
    ///
    /// # Errors
    ///
    /// Any error is converted by the provider into a failed outcome for
    /// this tunnel; it never escapes the scheduler loop.
    fn execute_tick(&self, core: &TunnelCore, ctx: &TickContext<'_>) -> Result<(), TunnelError>;

    /// Handle a wire message routed to this tunnel by ID.
    ///
    /// # Errors
    ///
    /// Defaults to a role mismatch.
    fn receive(
        &self,
        core: &TunnelCore,
        ctx: &TickContext<'_>,
        envelope: &MessageEnvelope,
    ) -> Result<(), TunnelError> {
        let _ = (core, ctx, envelope);
        Err(TunnelError::WrongRole(self.name()))
    }

    /// Queue a logical message for sending through the tunnel.
    ///
    /// # Errors
    ///
    /// Defaults to a role mismatch; only outbound tunnels send.
    fn enqueue_send(
        &self,
        instruction: DeliveryInstruction,
        payload: Vec<u8>,
    ) -> Result<(), TunnelError> {
        let _ = (instruction, payload);
        Err(TunnelError::WrongRole(self.name()))
    }

    /// Tunnel ID this tunnel listens on locally, if any.
    fn receive_tunnel_id(&self, core: &TunnelCore) -> Option<TunnelId> {
        let _ = core;
        None
    }

    /// Gateway peers address to reach this tunnel, if it has one.
    fn gateway(&self, core: &TunnelCore) -> Option<(IdentHash, TunnelId)> {
        let _ = core;
        None
    }

    /// Deadline for the build handshake to complete.
    fn establishment_timeout(&self, core: &TunnelCore, settings: &TunnelSettings) -> Duration {
        settings.establishment_timeout(core.config.relay_hop_count())
    }
}

/// A runtime tunnel: shared core plus its role strategy.
pub struct Tunnel {
    core: TunnelCore,
    role: Box<dyn TunnelRole>,
}

impl Tunnel {
    /// Construct a tunnel from its configuration and role.
    #[must_use]
    pub fn new(
        sequence: u64,
        config: TunnelConfig,
        settings: &TunnelSettings,
        role: Box<dyn TunnelRole>,
    ) -> Self {
        let margin = settings.recreation_margin(config.relay_hop_count());
        let core = TunnelCore::new(sequence, config, settings.lifetime, margin);
        Self { core, role }
    }

    /// Construct a tunnel with explicit lifetime and recreation margin.
    /// Used by the zero-hop fallback and transit tunnels.
    #[must_use]
    pub fn with_lifetime(
        sequence: u64,
        config: TunnelConfig,
        lifetime: Duration,
        margin: Duration,
        role: Box<dyn TunnelRole>,
    ) -> Self {
        let core = TunnelCore::new(sequence, config, lifetime, margin);
        Self { core, role }
    }

    /// Shared lifecycle and accounting state.
    #[must_use]
    pub fn core(&self) -> &TunnelCore {
        &self.core
    }

    /// Role name for logging.
    #[must_use]
    pub fn role_name(&self) -> &'static str {
        self.role.name()
    }

    /// Direction of the tunnel.
    #[must_use]
    pub fn direction(&self) -> TunnelDirection {
        self.role.direction()
    }

    /// Pool classification.
    #[must_use]
    pub fn pool(&self) -> TunnelPool {
        self.core.config.pool
    }

    /// Derived state.
    #[must_use]
    pub fn state(&self) -> TunnelState {
        self.core.state()
    }

    /// Run one scheduling tick: build-timeout enforcement plus the role's
    /// own work.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::BuildTimeout`] when a pending tunnel has
    /// outlived its establishment deadline, [`TunnelError::Terminated`]
    /// for terminated tunnels, or whatever the role's tick raises.
    pub fn execute_tick(&self, ctx: &TickContext<'_>) -> Result<(), TunnelError> {
        if self.core.is_terminated() {
            return Err(TunnelError::Terminated);
        }
        if !self.core.is_established()
            && self.core.created_at.elapsed()
                > self.role.establishment_timeout(&self.core, ctx.settings)
        {
            return Err(TunnelError::BuildTimeout);
        }
        self.role.execute_tick(&self.core, ctx)
    }

    /// Handle a wire message routed to this tunnel.
    ///
    /// # Errors
    ///
    /// Propagates the role's error; checksum and parse failures surface
    /// here and are counted against the tunnel by the provider.
    pub fn receive(
        &self,
        ctx: &TickContext<'_>,
        envelope: &MessageEnvelope,
    ) -> Result<(), TunnelError> {
        if self.core.is_terminated() {
            return Err(TunnelError::Terminated);
        }
        self.role.receive(&self.core, ctx, envelope)
    }

    /// Queue a logical message for sending through this tunnel.
    ///
    /// # Errors
    ///
    /// Returns a role mismatch unless this is an outbound tunnel.
    pub fn send_message(
        &self,
        instruction: DeliveryInstruction,
        payload: Vec<u8>,
    ) -> Result<(), TunnelError> {
        if self.core.is_terminated() {
            return Err(TunnelError::Terminated);
        }
        self.role.enqueue_send(instruction, payload)
    }

    /// Tunnel ID this tunnel listens on locally, if any.
    #[must_use]
    pub fn receive_tunnel_id(&self) -> Option<TunnelId> {
        self.role.receive_tunnel_id(&self.core)
    }

    /// Gateway address peers use to reach this tunnel, if it has one.
    #[must_use]
    pub fn gateway(&self) -> Option<(IdentHash, TunnelId)> {
        self.role.gateway(&self.core)
    }

    /// Total hop count relevant for probe budgets: the relay hops of
    /// this tunnel.
    #[must_use]
    pub fn hop_count(&self) -> usize {
        self.core.config.relay_hop_count()
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("sequence", &self.core.sequence)
            .field("role", &self.role.name())
            .field("pool", &self.core.config.pool)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelPool;
    use crate::identity::RouterIdentity;

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

    fn make_tunnel(lifetime: Duration, margin: Duration) -> Tunnel {
        let peer = RouterIdentity::generate().unwrap().as_peer();
        let config = TunnelConfig::outbound(TunnelPool::Client, vec![peer], None).unwrap();
        Tunnel::with_lifetime(1, config, lifetime, margin, Box::new(IdleRole))
    }

    #[test]
    fn test_pending_then_active() {
        let tunnel = make_tunnel(Duration::from_secs(600), Duration::from_secs(15));
        assert_eq!(tunnel.state(), TunnelState::Pending);
        tunnel.core().mark_established();
        assert_eq!(tunnel.state(), TunnelState::Active);
    }

    #[test]
    fn test_terminated_is_sticky() {
        let tunnel = make_tunnel(Duration::from_secs(600), Duration::from_secs(15));
        tunnel.core().mark_established();
        assert!(tunnel.core().terminate());
        assert!(!tunnel.core().terminate(), "second terminate must report false");
        assert_eq!(tunnel.state(), TunnelState::Terminated);

        // No later event may move the state away from Terminated.
        tunnel.core().mark_established();
        assert_eq!(tunnel.state(), TunnelState::Terminated);
    }

    #[test]
    fn test_needs_recreation_near_expiry() {
        let tunnel = make_tunnel(Duration::from_millis(50), Duration::from_millis(45));
        tunnel.core().mark_established();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(tunnel.state(), TunnelState::NeedsRecreation);
    }

    #[test]
    fn test_established_expiry() {
        let tunnel = make_tunnel(Duration::from_millis(5), Duration::ZERO);
        tunnel.core().mark_established();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(tunnel.state(), TunnelState::Expired);
    }

    #[test]
    fn test_pending_expiry_at_110_percent() {
        let tunnel = make_tunnel(Duration::from_millis(10), Duration::ZERO);
        assert_eq!(tunnel.state(), TunnelState::Pending);
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(tunnel.state(), TunnelState::Expired);
    }

    #[test]
    fn test_min_latency_keeps_minimum() {
        let quality = TunnelQuality::new();
        quality.record_latency(200);
        quality.record_latency(120);
        quality.record_latency(500);
        assert_eq!(quality.min_latency_ms(), Some(120));
    }

    #[test]
    fn test_bitrate_window() {
        let counters = BandwidthCounters::new();
        counters.count_sent(1000);
        counters.count_received(500);
        std::thread::sleep(Duration::from_millis(10));
        counters.roll_window();
        let (sent, received) = counters.bitrates();
        assert!(sent > 0);
        assert!(received > 0);
        assert_eq!(counters.bytes_sent(), 1000);
        assert_eq!(counters.bytes_received(), 500);
    }
}
