//! Call types and data structures

use crate::identity::PeerId;
use crate::media::MediaStream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media constraints used when acquiring the local stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture audio
    pub audio: bool,
    /// Capture video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Which side started the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// We sent `call`
    Outbound,
    /// The remote peer sent `call`
    Inbound,
}

/// Call state
///
/// ```text
///   Requesting ──yes──► Connecting ──media──► Active
///       │                   ▲   │                │
///       │ no        accept  │   │ close/error    │ hangup
///       ▼                   │   ▼                ▼
///     Closed ◄──decline── Offered   Closed ◄── Closing
/// ```
///
/// There is no idle state: a coordinator without a session is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Outbound: `call` sent, awaiting `yes`/`no`
    Requesting,
    /// Inbound: `call` received, awaiting the local decision
    Offered,
    /// Decision made, acquiring local media
    Connecting,
    /// Local media attached, streams flowing
    Active,
    /// `close` sent, grace delay running
    Closing,
    /// Terminal
    Closed,
}

impl CallState {
    /// Check whether `self -> next` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Requesting, Connecting)
                | (Requesting, Closing)
                | (Requesting, Closed)
                | (Offered, Connecting)
                | (Offered, Closed)
                | (Connecting, Active)
                | (Connecting, Closing)
                | (Connecting, Closed)
                | (Active, Closing)
                | (Active, Closed)
                | (Closing, Closed)
        )
    }

    /// Terminal state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == CallState::Closed
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallState::Requesting => "requesting",
            CallState::Offered => "offered",
            CallState::Connecting => "connecting",
            CallState::Active => "active",
            CallState::Closing => "closing",
            CallState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a call reached `Closed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Remote peer answered `no` (declined or busy)
    Declined,
    /// We declined an incoming offer
    Rejected,
    /// We hung up and the grace delay finished
    LocalHangup,
    /// Remote peer sent `close`
    RemoteHangup,
    /// Local camera/microphone could not be acquired
    MediaUnavailable(String),
    /// Media channel failure
    LinkFailed(String),
    /// Data or media channel closed without a `close` message
    LinkClosed,
    /// The coordinator shut down
    Shutdown,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::Declined => f.write_str("declined by remote peer"),
            EndReason::Rejected => f.write_str("declined locally"),
            EndReason::LocalHangup => f.write_str("hung up"),
            EndReason::RemoteHangup => f.write_str("remote peer hung up"),
            EndReason::MediaUnavailable(err) => write!(f, "media unavailable: {err}"),
            EndReason::LinkFailed(err) => write!(f, "link failed: {err}"),
            EndReason::LinkClosed => f.write_str("link closed"),
            EndReason::Shutdown => f.write_str("shut down"),
        }
    }
}

/// Events emitted by a coordinator for the UI layer
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The displayed roster changed
    RosterChanged {
        /// Online peers, excluding ourselves, in broadcast order
        peers: Vec<PeerId>,
    },
    /// A peer wants to call us; answer with `decide`
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        peer: PeerId,
    },
    /// The session moved to a new state
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// Remote peer
        peer: PeerId,
        /// New state
        state: CallState,
    },
    /// Our camera/microphone stream is ready for display
    LocalStreamReady {
        /// Call identifier
        call_id: CallId,
        /// Local stream
        stream: MediaStream,
    },
    /// The remote peer's stream arrived
    RemoteStreamReady {
        /// Call identifier
        call_id: CallId,
        /// Remote stream
        stream: MediaStream,
    },
    /// The remote peer answered `no`
    Declined {
        /// Call identifier
        call_id: CallId,
        /// Peer that declined
        peer: PeerId,
    },
    /// The session reached `Closed`
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Remote peer
        peer: PeerId,
        /// Why the call ended
        reason: EndReason,
    },
}

impl CallEvent {
    /// The call this event belongs to, if any
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            CallEvent::RosterChanged { .. } => None,
            CallEvent::IncomingCall { call_id, .. }
            | CallEvent::StateChanged { call_id, .. }
            | CallEvent::LocalStreamReady { call_id, .. }
            | CallEvent::RemoteStreamReady { call_id, .. }
            | CallEvent::Declined { call_id, .. }
            | CallEvent::CallEnded { call_id, .. } => Some(*call_id),
        }
    }
}

/// Snapshot of the current call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInfo {
    /// Call identifier
    pub call_id: CallId,
    /// Remote peer
    pub peer: PeerId,
    /// Who started the call
    pub direction: CallDirection,
    /// Current state
    pub state: CallState,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When the call became active
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallInfo {
    /// Time spent in the active call so far
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|start| Utc::now() - start)
    }
}
