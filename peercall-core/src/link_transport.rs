//! Link transport abstraction layer
//!
//! The point-to-point transport (NAT traversal, ICE, encryption) is not part
//! of this crate. It is consumed through two primitives per remote peer:
//!
//! - a **data channel**: ordered, reliable, bidirectional messages
//! - a **media channel**: carries a media stream once the call is answered
//!
//! Opening either returns a handle immediately; progress (open, messages,
//! streams, failures) is reported afterwards on the connection's event
//! receiver. Inbound connections arrive as [`Incoming`] values.

use crate::identity::PeerId;
use crate::media::MediaStream;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Link transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Data channel not open yet, or already closed
    #[error("Channel not open")]
    NotOpen,

    /// The remote peer cannot be reached
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// The channel was closed
    #[error("Channel closed")]
    Closed,

    /// No media channel attached to the link
    #[error("No media channel")]
    NoMediaChannel,

    /// The media offer was already answered
    #[error("Media offer already answered")]
    AlreadyAnswered,

    /// Media negotiation or transport failure
    #[error("Media failure: {0}")]
    MediaFailed(String),
}

/// Event reported by a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataEvent {
    /// The channel can carry messages
    Open,
    /// A message arrived
    Message(String),
    /// The channel closed (either side)
    Closed,
}

/// Event reported by a media channel
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// The remote media stream arrived
    Stream(MediaStream),
    /// Negotiation or transport failure
    Error(String),
    /// The channel closed (either side)
    Closed,
}

/// Sending half of a data channel
pub trait DataChannel: Send + Sync {
    /// Whether messages can be sent
    fn is_open(&self) -> bool;

    /// Send a text message
    ///
    /// # Errors
    ///
    /// Returns `LinkError::NotOpen` if the channel is not open
    fn send(&self, payload: &str) -> Result<(), LinkError>;

    /// Close the channel; idempotent
    fn close(&self);
}

/// Control half of a media channel
pub trait MediaChannel: Send + Sync {
    /// Answer an inbound media offer with the local stream
    ///
    /// # Errors
    ///
    /// Returns error if the channel is closed or already answered
    fn answer(&self, stream: MediaStream) -> Result<(), LinkError>;

    /// Close the channel; idempotent
    fn close(&self);
}

/// A data channel handle with its event feed
pub struct DataConnection {
    /// Channel handle
    pub channel: Arc<dyn DataChannel>,
    /// Events reported by the transport
    pub events: mpsc::UnboundedReceiver<DataEvent>,
}

impl DataConnection {
    /// Bundle a channel with its events
    pub fn new(channel: Arc<dyn DataChannel>, events: mpsc::UnboundedReceiver<DataEvent>) -> Self {
        Self { channel, events }
    }
}

impl fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataConnection")
            .field("open", &self.channel.is_open())
            .finish_non_exhaustive()
    }
}

/// A media channel handle with its event feed
pub struct MediaConnection {
    /// Channel handle
    pub channel: Arc<dyn MediaChannel>,
    /// Events reported by the transport
    pub events: mpsc::UnboundedReceiver<MediaEvent>,
}

impl MediaConnection {
    /// Bundle a channel with its events
    pub fn new(
        channel: Arc<dyn MediaChannel>,
        events: mpsc::UnboundedReceiver<MediaEvent>,
    ) -> Self {
        Self { channel, events }
    }
}

impl fmt::Debug for MediaConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaConnection").finish_non_exhaustive()
    }
}

/// A connection opened by a remote peer
#[derive(Debug)]
pub enum Incoming {
    /// Remote peer opened a data channel to us
    Data {
        /// Remote peer
        peer: PeerId,
        /// The channel
        connection: DataConnection,
    },
    /// Remote peer offered its media stream
    Media {
        /// Remote peer
        peer: PeerId,
        /// The channel, to be answered with our stream
        connection: MediaConnection,
    },
}

impl Incoming {
    /// Remote peer of the connection
    pub fn peer(&self) -> &PeerId {
        match self {
            Incoming::Data { peer, .. } | Incoming::Media { peer, .. } => peer,
        }
    }
}

/// Point-to-point transport trait
///
/// Implement this over the real peer-to-peer stack. Both operations return
/// without waiting for the remote side; completion is reported as events.
pub trait PeerTransport: Send + Sync {
    /// Our identifier as assigned by the directory service
    fn local_id(&self) -> &PeerId;

    /// Open a data channel to `peer`
    ///
    /// # Errors
    ///
    /// Returns error if the peer is not reachable at all
    fn connect(&self, peer: &PeerId) -> Result<DataConnection, LinkError>;

    /// Offer our media stream to `peer`
    ///
    /// # Errors
    ///
    /// Returns error if the peer is not reachable at all
    fn call(&self, peer: &PeerId, stream: &MediaStream) -> Result<MediaConnection, LinkError>;
}
