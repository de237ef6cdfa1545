//! Call signaling protocol
//!
//! Four literal text messages travel over the data channel:
//!
//! | message | meaning                       |
//! |---------|-------------------------------|
//! | `call`  | propose a session             |
//! | `yes`   | accept                        |
//! | `no`    | decline, or busy              |
//! | `close` | terminate                     |
//!
//! There is no payload, no sequence number and no acknowledgment. Anything
//! else arriving on the channel is ignored so the protocol can grow.

use crate::identity::PeerId;
use crate::link_transport::{
    DataChannel, DataConnection, DataEvent, LinkError, MediaChannel, MediaConnection, MediaEvent,
};
use crate::media::MediaStream;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A data-channel payload that is not part of the protocol
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown signaling message: {0:?}")]
pub struct UnknownMessage(pub String);

/// Signaling message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalMessage {
    /// Propose a session
    Call,
    /// Accept the proposal
    Yes,
    /// Decline the proposal (also sent when busy)
    No,
    /// Terminate the session
    Close,
}

impl SignalMessage {
    /// Wire representation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SignalMessage::Call => "call",
            SignalMessage::Yes => "yes",
            SignalMessage::No => "no",
            SignalMessage::Close => "close",
        }
    }
}

impl fmt::Display for SignalMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalMessage {
    type Err = UnknownMessage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(SignalMessage::Call),
            "yes" => Ok(SignalMessage::Yes),
            "no" => Ok(SignalMessage::No),
            "close" => Ok(SignalMessage::Close),
            other => Err(UnknownMessage(other.to_string())),
        }
    }
}

/// Identifier of one signaling link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    /// Allocate a process-unique link id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Transport event before protocol interpretation
#[derive(Debug, Clone)]
pub enum RawLinkEvent {
    /// From the data channel
    Data(DataEvent),
    /// From the media channel
    Media(MediaEvent),
}

/// A raw event tagged with the link it came from
#[derive(Debug, Clone)]
pub struct LinkEnvelope {
    /// Originating link
    pub link: LinkId,
    /// The event
    pub event: RawLinkEvent,
}

/// Event exposed by a signaling link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The data channel opened
    Opened,
    /// A protocol message arrived
    Message(SignalMessage),
    /// The data channel closed
    DataClosed,
    /// The remote media stream arrived (reported once)
    StreamReady(MediaStream),
    /// The media channel failed
    MediaError(String),
    /// The media channel closed
    MediaClosed,
}

/// One connection attempt with one remote peer
///
/// Owns the data channel and, once the call is answered, the media channel.
/// Channel events are forwarded by pump tasks into a shared sink tagged with
/// the link id, so a single event loop can serve every link. Dropping the
/// link closes both channels.
pub struct SignalingLink {
    id: LinkId,
    remote: PeerId,
    data: Arc<dyn DataChannel>,
    media: Option<Arc<dyn MediaChannel>>,
    sink: mpsc::UnboundedSender<LinkEnvelope>,
    pumps: Vec<JoinHandle<()>>,
    stream_seen: bool,
    answered: bool,
    closed: bool,
}

impl SignalingLink {
    /// Wrap an established data connection
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        remote: PeerId,
        connection: DataConnection,
        sink: mpsc::UnboundedSender<LinkEnvelope>,
    ) -> Self {
        let id = LinkId::next();
        let DataConnection { channel, events } = connection;
        let pump = spawn_pump(id, events, sink.clone(), RawLinkEvent::Data);
        tracing::debug!(link = %id, peer = %remote, "Signaling link created");
        Self {
            id,
            remote,
            data: channel,
            media: None,
            sink,
            pumps: vec![pump],
            stream_seen: false,
            answered: false,
            closed: false,
        }
    }

    /// Link identifier
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Remote peer
    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    /// Whether messages can be sent
    pub fn is_open(&self) -> bool {
        !self.closed && self.data.is_open()
    }

    /// Whether a media channel is attached
    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    /// Send a protocol message
    ///
    /// # Errors
    ///
    /// Returns `LinkError::NotOpen` if the data channel is not open; nothing
    /// is sent in that case
    pub fn send(&self, message: SignalMessage) -> Result<(), LinkError> {
        if !self.is_open() {
            tracing::warn!(link = %self.id, peer = %self.remote, message = %message, "Dropping message, data channel not open");
            return Err(LinkError::NotOpen);
        }
        tracing::debug!(link = %self.id, peer = %self.remote, message = %message, "Sending signaling message");
        self.data.send(message.as_str())
    }

    /// Attach the media channel for this call
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed or already has a media channel;
    /// the rejected connection is closed
    pub fn attach_media(&mut self, connection: MediaConnection) -> Result<(), LinkError> {
        let MediaConnection { channel, events } = connection;
        if self.closed {
            channel.close();
            return Err(LinkError::Closed);
        }
        if self.media.is_some() {
            tracing::warn!(link = %self.id, "Media channel already attached, closing the new one");
            channel.close();
            return Err(LinkError::MediaFailed(
                "media channel already attached".to_string(),
            ));
        }
        self.pumps.push(spawn_pump(
            self.id,
            events,
            self.sink.clone(),
            RawLinkEvent::Media,
        ));
        self.media = Some(channel);
        tracing::debug!(link = %self.id, "Media channel attached");
        Ok(())
    }

    /// Answer the inbound media offer with our local stream
    ///
    /// # Errors
    ///
    /// Returns error if no media channel is attached or it was already
    /// answered
    pub fn answer_media(&mut self, stream: MediaStream) -> Result<(), LinkError> {
        let media = self.media.as_ref().ok_or(LinkError::NoMediaChannel)?;
        if self.answered {
            return Err(LinkError::AlreadyAnswered);
        }
        media.answer(stream)?;
        self.answered = true;
        Ok(())
    }

    /// Interpret a raw transport event
    ///
    /// Unknown messages and repeated stream deliveries yield `None`.
    pub fn interpret(&mut self, event: RawLinkEvent) -> Option<LinkEvent> {
        match event {
            RawLinkEvent::Data(DataEvent::Open) => Some(LinkEvent::Opened),
            RawLinkEvent::Data(DataEvent::Message(payload)) => match payload.parse() {
                Ok(message) => Some(LinkEvent::Message(message)),
                Err(UnknownMessage(payload)) => {
                    tracing::trace!(link = %self.id, payload = %payload, "Ignoring unknown message");
                    None
                }
            },
            RawLinkEvent::Data(DataEvent::Closed) => Some(LinkEvent::DataClosed),
            RawLinkEvent::Media(MediaEvent::Stream(stream)) => {
                if self.stream_seen {
                    tracing::trace!(link = %self.id, "Ignoring repeated remote stream");
                    None
                } else {
                    self.stream_seen = true;
                    Some(LinkEvent::StreamReady(stream))
                }
            }
            RawLinkEvent::Media(MediaEvent::Error(err)) => Some(LinkEvent::MediaError(err)),
            RawLinkEvent::Media(MediaEvent::Closed) => Some(LinkEvent::MediaClosed),
        }
    }

    /// Release both channels; idempotent
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.data.close();
        if let Some(media) = &self.media {
            media.close();
        }
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        tracing::debug!(link = %self.id, peer = %self.remote, "Signaling link closed");
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SignalingLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingLink")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("has_media", &self.media.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn spawn_pump<E, F>(
    link: LinkId,
    mut events: mpsc::UnboundedReceiver<E>,
    sink: mpsc::UnboundedSender<LinkEnvelope>,
    wrap: F,
) -> JoinHandle<()>
where
    E: Send + 'static,
    F: Fn(E) -> RawLinkEvent + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if sink
                .send(LinkEnvelope {
                    link,
                    event: wrap(event),
                })
                .is_err()
            {
                break;
            }
        }
    })
}
