//! # VEIL Tunnel
//!
//! The tunnel subsystem of the VEIL anonymity router: pre-built,
//! fixed-length chains of relay peers carrying messages under layered
//! encryption, so that no single hop except the endpoints knows both the
//! origin and the final destination of a message.
//!
//! This crate provides:
//! - The onion-layered tunnel build handshake (request/reply records)
//! - Tunnel-data fragmentation and reassembly with checksum verification
//! - The tunnel entity with its role strategies (outbound, inbound,
//!   transit gateway/participant/endpoint, zero-hop fallback)
//! - The tunnel provider: registries, scheduling, inbound dispatch,
//!   weighted tunnel selection, build-reply completion
//! - Pool owners (client, exploratory, transit) and the liveness tester
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Tunnel Owners                              │
//! │   (client / exploratory / transit pool policies)                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      Tunnel Provider                             │
//! │   (registries, per-tick scheduling, dispatch, selection)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Tunnels                                   │
//! │   (per-hop layer crypto, fragmentation, bandwidth accounting)   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The network database (peer selection, reputation) and the datagram
//! transport are external collaborators, consumed through the
//! [`netdb::NetworkDatabase`] and [`transport::Transport`] traits.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod frag;
pub mod hop;
pub mod identity;
pub mod inbound;
pub mod messages;
pub mod netdb;
pub mod outbound;
pub mod provider;
pub mod records;
pub mod selection;
pub mod settings;
pub mod tester;
pub mod transit;
pub mod transport;
pub mod tunnel;
pub mod zero_hop;

pub mod owners;

pub use config::{TunnelConfig, TunnelDirection, TunnelPool};
pub use error::{FragmentError, MessageError, RecordError, TunnelError};
pub use frag::{CompletedMessage, DeliveryInstruction, Fragment, Fragmenter, Reassembler};
pub use hop::Hop;
pub use identity::{IdentHash, PeerIdentity, RouterIdentity, TunnelId};
pub use messages::{MessageEnvelope, TunnelDataMessage, WireMessage};
pub use netdb::{NetworkDatabase, PeerSelectionRole};
pub use owners::{ClientOwner, ExploratoryOwner, TransitOwner, TunnelOwner};
pub use provider::TunnelProvider;
pub use records::{BuildReply, HopBuildResult, HopRole};
pub use settings::TunnelSettings;
pub use tester::TunnelTester;
pub use transport::{LocalMessageHandler, NoopHandler, Transport};
pub use tunnel::{TickContext, Tunnel, TunnelCore, TunnelRole, TunnelState};

/// Size of the fixed tunnel-data payload window in bytes.
pub const TUNNEL_DATA_WINDOW: usize = 1008;

/// Total wire size of a tunnel-data message body (tunnel ID + IV + window).
pub const TUNNEL_DATA_SIZE: usize = 4 + 16 + TUNNEL_DATA_WINDOW;

/// Fixed size of one build request/response record on the wire.
pub const BUILD_RECORD_SIZE: usize = 256;

/// Maximum hops a single build message can describe.
pub const MAX_BUILD_RECORDS: usize = 8;
