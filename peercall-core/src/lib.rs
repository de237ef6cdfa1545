//! PeerCall - call negotiation for peer-to-peer video calls
//!
//! This library decides whether and when media flows between two peers. The
//! point-to-point transport itself (NAT traversal, encryption, codecs) is
//! consumed through the [`PeerTransport`] trait. On top of it the crate
//! provides:
//!
//! - **Directory**: the roster of online peers, replaced wholesale on every
//!   broadcast
//! - **Signaling**: the four-message `call`/`yes`/`no`/`close` protocol over a
//!   reliable data channel
//! - **Call sessions**: an explicit state machine from request to teardown,
//!   including the busy signal and the grace delay after `close`
//! - **Coordination**: one actor task per local peer owning at most one call
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::{CoordinatorConfig, MemoryNetwork, PeerId, SyntheticMediaSource};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let network = MemoryNetwork::new();
//! let alice = network
//!     .join("alice")?
//!     .spawn_coordinator(Arc::new(SyntheticMediaSource::new()), CoordinatorConfig::default());
//! let _bob = network
//!     .join("bob")?
//!     .spawn_coordinator(Arc::new(SyntheticMediaSource::new()), CoordinatorConfig::default());
//!
//! let mut events = alice.subscribe();
//! let call_id = alice.place_call(PeerId::new("bob")).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{call_id}: {event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Call types and data structures
pub mod types;

/// Peer identity
pub mod identity;

/// Local media streams and acquisition
pub mod media;

/// Link transport abstraction layer
pub mod link_transport;

/// Signaling protocol and links
pub mod signaling;

/// Roster of online peers
pub mod directory;

/// Directory service bookkeeping
pub mod presence;

/// Call session state machine
pub mod call;

/// Call coordinator and configuration
pub mod service;

/// In-process transport
#[cfg(feature = "memory-transport")]
pub mod transport;

// Re-export main types at crate root
pub use call::{CallError, CallSession};
pub use directory::{PeerDirectory, Roster};
pub use identity::PeerId;
pub use link_transport::{
    DataChannel, DataConnection, DataEvent, Incoming, LinkError, MediaChannel, MediaConnection,
    MediaEvent, PeerTransport,
};
pub use media::{MediaError, MediaSource, MediaStream, MediaTrack, SyntheticMediaSource, TrackKind};
pub use presence::{PresenceError, PresenceHub};
pub use service::{CallCoordinator, CallCoordinatorBuilder, CoordinatorConfig};
pub use signaling::{LinkEvent, LinkId, SignalMessage, SignalingLink, UnknownMessage};
#[cfg(feature = "memory-transport")]
pub use transport::{MemoryNetwork, MemoryPeer, MemoryTransport, WireRecord};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::CallError;
    pub use crate::identity::PeerId;
    pub use crate::link_transport::{Incoming, PeerTransport};
    pub use crate::media::{MediaSource, MediaStream};
    pub use crate::service::{CallCoordinator, CoordinatorConfig};
    #[cfg(feature = "memory-transport")]
    pub use crate::transport::{MemoryNetwork, MemoryPeer};
    pub use crate::types::{CallEvent, CallId, CallInfo, CallState, EndReason, MediaConstraints};
}
