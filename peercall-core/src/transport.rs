//! In-process transport
//!
//! [`MemoryNetwork`] connects any number of peers inside one process. It
//! implements the consumed transport primitives the way a browser peer
//! library behaves: data channels open shortly after creation, media offers
//! arrive as [`Incoming::Media`], and answering an offer delivers each side's
//! stream to the other. A [`PresenceHub`] plays the directory service.
//!
//! Every message a data channel carries is recorded in a wire log, and faults
//! can be injected per peer pair.

use crate::identity::PeerId;
use crate::link_transport::{
    DataChannel, DataConnection, DataEvent, Incoming, LinkError, MediaChannel, MediaConnection,
    MediaEvent, PeerTransport,
};
use crate::media::{MediaSource, MediaStream};
use crate::presence::{PresenceError, PresenceHub};
use crate::service::{CallCoordinator, CoordinatorConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};

/// One data-channel message as it crossed the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    /// Sender
    pub from: PeerId,
    /// Receiver
    pub to: PeerId,
    /// Message text
    pub payload: String,
}

struct Shared {
    presence: PresenceHub,
    state: Mutex<NetworkState>,
}

#[derive(Default)]
struct NetworkState {
    peers: HashMap<PeerId, mpsc::UnboundedSender<Incoming>>,
    wire: Vec<WireRecord>,
    data_pipes: Vec<Weak<DataPipe>>,
    media_pipes: Vec<Weak<MediaPipe>>,
}

impl NetworkState {
    fn data_pipes_matching(&self, filter: impl Fn(&DataPipe) -> bool) -> Vec<Arc<DataPipe>> {
        self.data_pipes
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|pipe| filter(pipe))
            .collect()
    }

    fn media_pipes_matching(&self, filter: impl Fn(&MediaPipe) -> bool) -> Vec<Arc<MediaPipe>> {
        self.media_pipes
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|pipe| filter(pipe))
            .collect()
    }

    fn prune(&mut self) {
        self.data_pipes.retain(|pipe| pipe.strong_count() > 0);
        self.media_pipes.retain(|pipe| pipe.strong_count() > 0);
    }
}

/// Everything a peer receives when joining the network
#[derive(Debug)]
pub struct MemoryPeer {
    /// Transport bound to the peer's id
    pub transport: Arc<MemoryTransport>,
    /// Connections opened by other peers
    pub incoming: mpsc::UnboundedReceiver<Incoming>,
    /// Roster broadcasts, starting with the one announcing this peer
    pub directory: broadcast::Receiver<String>,
}

impl MemoryPeer {
    /// Start a coordinator wired to this peer's transport and directory
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn_coordinator(
        self,
        media: Arc<dyn MediaSource>,
        config: CoordinatorConfig,
    ) -> CallCoordinator {
        CallCoordinator::builder(self.transport, media)
            .with_config(config)
            .with_directory(self.directory)
            .spawn(self.incoming)
    }
}

/// In-process network of peers
#[derive(Clone)]
pub struct MemoryNetwork {
    shared: Arc<Shared>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                presence: PresenceHub::new(),
                state: Mutex::new(NetworkState::default()),
            }),
        }
    }

    /// Connect a peer and announce it to the directory
    ///
    /// Joining with an id that is already connected replaces the previous
    /// registration.
    ///
    /// # Errors
    ///
    /// Returns error if the id cannot be carried in a roster payload
    pub fn join(&self, id: impl Into<PeerId>) -> Result<MemoryPeer, PresenceError> {
        let id = id.into();
        let directory = self.shared.presence.subscribe();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        if !id.is_roster_safe() {
            return Err(PresenceError::InvalidId(id.to_string()));
        }
        if self
            .shared
            .state
            .lock()
            .peers
            .insert(id.clone(), incoming_tx)
            .is_some()
        {
            tracing::warn!(peer = %id, "Peer id joined twice, replacing registration");
        }
        self.shared.presence.join(id.clone())?;

        Ok(MemoryPeer {
            transport: Arc::new(MemoryTransport {
                local: id,
                shared: Arc::clone(&self.shared),
            }),
            incoming,
            directory,
        })
    }

    /// Disconnect a peer: drop it from the directory and cut its channels
    pub fn leave(&self, id: &PeerId) {
        let (data, media) = {
            let mut state = self.shared.state.lock();
            state.peers.remove(id);
            (
                state.data_pipes_matching(|pipe| pipe.ends.contains(id)),
                state.media_pipes_matching(|pipe| pipe.ends.contains(id)),
            )
        };
        self.shared.presence.leave(id);
        for pipe in data {
            pipe.shut();
        }
        for pipe in media {
            pipe.shut();
        }
    }

    /// Close every channel between `a` and `b` without any message
    ///
    /// Returns how many channels were cut.
    pub fn sever(&self, a: &PeerId, b: &PeerId) -> usize {
        let (data, media) = {
            let state = self.shared.state.lock();
            (
                state.data_pipes_matching(|pipe| pipe.connects(a, b)),
                state.media_pipes_matching(|pipe| pipe.connects(a, b)),
            )
        };
        tracing::debug!(a = %a, b = %b, "Severing channels");
        let cut = data.iter().filter(|pipe| pipe.shut()).count();
        cut + media.iter().filter(|pipe| pipe.shut()).count()
    }

    /// Fail every live media channel between `a` and `b`
    ///
    /// Returns how many channels failed.
    pub fn fail_media(&self, a: &PeerId, b: &PeerId, reason: &str) -> usize {
        let pipes = self
            .shared
            .state
            .lock()
            .media_pipes_matching(|pipe| pipe.connects(a, b));
        tracing::debug!(a = %a, b = %b, reason, "Failing media channels");
        pipes.iter().filter(|pipe| pipe.fail(reason)).count()
    }

    /// Every data-channel message sent so far, in order
    pub fn wire_log(&self) -> Vec<WireRecord> {
        self.shared.state.lock().wire.clone()
    }

    /// Messages `from` sent to `to`, in order
    pub fn messages(&self, from: &PeerId, to: &PeerId) -> Vec<String> {
        self.shared
            .state
            .lock()
            .wire
            .iter()
            .filter(|record| &record.from == from && &record.to == to)
            .map(|record| record.payload.clone())
            .collect()
    }

    /// The directory service
    pub fn presence(&self) -> &PresenceHub {
        &self.shared.presence
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("peers", &self.shared.state.lock().peers.len())
            .finish_non_exhaustive()
    }
}

/// A peer's handle on the in-process network
pub struct MemoryTransport {
    local: PeerId,
    shared: Arc<Shared>,
}

impl MemoryTransport {
    fn route(&self, peer: &PeerId) -> Result<mpsc::UnboundedSender<Incoming>, LinkError> {
        self.shared
            .state
            .lock()
            .peers
            .get(peer)
            .cloned()
            .ok_or_else(|| LinkError::PeerUnreachable(peer.to_string()))
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl PeerTransport for MemoryTransport {
    fn local_id(&self) -> &PeerId {
        &self.local
    }

    fn connect(&self, peer: &PeerId) -> Result<DataConnection, LinkError> {
        let route = self.route(peer)?;
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let pipe = Arc::new(DataPipe {
            ends: [self.local.clone(), peer.clone()],
            events: [local_tx, remote_tx],
            status: Mutex::new(PipeStatus::Connecting),
        });
        {
            let mut state = self.shared.state.lock();
            state.prune();
            state.data_pipes.push(Arc::downgrade(&pipe));
        }

        let remote = DataConnection::new(
            Arc::new(MemoryDataChannel {
                pipe: Arc::clone(&pipe),
                side: 1,
                shared: Arc::clone(&self.shared),
            }),
            remote_rx,
        );
        route
            .send(Incoming::Data {
                peer: self.local.clone(),
                connection: remote,
            })
            .map_err(|_| LinkError::PeerUnreachable(peer.to_string()))?;
        tracing::debug!(from = %self.local, to = %peer, "Data channel requested");

        // Channels open asynchronously, as a real negotiation would
        let opening = Arc::clone(&pipe);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            opening.open();
        });

        Ok(DataConnection::new(
            Arc::new(MemoryDataChannel {
                pipe,
                side: 0,
                shared: Arc::clone(&self.shared),
            }),
            local_rx,
        ))
    }

    fn call(&self, peer: &PeerId, stream: &MediaStream) -> Result<MediaConnection, LinkError> {
        let route = self.route(peer)?;
        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, callee_rx) = mpsc::unbounded_channel();
        let pipe = Arc::new(MediaPipe {
            ends: [self.local.clone(), peer.clone()],
            events: [caller_tx, callee_tx],
            offer: stream.clone(),
            status: Mutex::new(MediaStatus::Offered),
        });
        {
            let mut state = self.shared.state.lock();
            state.prune();
            state.media_pipes.push(Arc::downgrade(&pipe));
        }

        let offer = MediaConnection::new(
            Arc::new(MemoryMediaChannel {
                pipe: Arc::clone(&pipe),
                side: 1,
            }),
            callee_rx,
        );
        route
            .send(Incoming::Media {
                peer: self.local.clone(),
                connection: offer,
            })
            .map_err(|_| LinkError::PeerUnreachable(peer.to_string()))?;
        tracing::debug!(from = %self.local, to = %peer, stream_id = %stream.id(), "Media offered");

        Ok(MediaConnection::new(
            Arc::new(MemoryMediaChannel { pipe, side: 0 }),
            caller_rx,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeStatus {
    Connecting,
    Open,
    Closed,
}

struct DataPipe {
    ends: [PeerId; 2],
    events: [mpsc::UnboundedSender<DataEvent>; 2],
    status: Mutex<PipeStatus>,
}

impl DataPipe {
    fn connects(&self, a: &PeerId, b: &PeerId) -> bool {
        (&self.ends[0] == a && &self.ends[1] == b) || (&self.ends[0] == b && &self.ends[1] == a)
    }

    fn open(&self) {
        let mut status = self.status.lock();
        if *status == PipeStatus::Connecting {
            *status = PipeStatus::Open;
            for events in &self.events {
                let _ = events.send(DataEvent::Open);
            }
        }
    }

    fn shut(&self) -> bool {
        let mut status = self.status.lock();
        if *status == PipeStatus::Closed {
            return false;
        }
        *status = PipeStatus::Closed;
        for events in &self.events {
            let _ = events.send(DataEvent::Closed);
        }
        true
    }
}

struct MemoryDataChannel {
    pipe: Arc<DataPipe>,
    side: usize,
    shared: Arc<Shared>,
}

impl DataChannel for MemoryDataChannel {
    fn is_open(&self) -> bool {
        *self.pipe.status.lock() == PipeStatus::Open
    }

    fn send(&self, payload: &str) -> Result<(), LinkError> {
        let status = self.pipe.status.lock();
        if *status != PipeStatus::Open {
            return Err(LinkError::NotOpen);
        }
        let other = 1 - self.side;
        self.pipe.events[other]
            .send(DataEvent::Message(payload.to_string()))
            .map_err(|_| LinkError::Closed)?;
        self.shared.state.lock().wire.push(WireRecord {
            from: self.pipe.ends[self.side].clone(),
            to: self.pipe.ends[other].clone(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    fn close(&self) {
        self.pipe.shut();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaStatus {
    Offered,
    Answered,
    Closed,
}

// Side 0 is the caller, side 1 the callee
struct MediaPipe {
    ends: [PeerId; 2],
    events: [mpsc::UnboundedSender<MediaEvent>; 2],
    offer: MediaStream,
    status: Mutex<MediaStatus>,
}

impl MediaPipe {
    fn connects(&self, a: &PeerId, b: &PeerId) -> bool {
        (&self.ends[0] == a && &self.ends[1] == b) || (&self.ends[0] == b && &self.ends[1] == a)
    }

    fn shut(&self) -> bool {
        self.end_with(|| MediaEvent::Closed)
    }

    fn fail(&self, reason: &str) -> bool {
        self.end_with(|| MediaEvent::Error(reason.to_string()))
    }

    fn end_with(&self, event: impl Fn() -> MediaEvent) -> bool {
        let mut status = self.status.lock();
        if *status == MediaStatus::Closed {
            return false;
        }
        *status = MediaStatus::Closed;
        for events in &self.events {
            let _ = events.send(event());
        }
        true
    }
}

struct MemoryMediaChannel {
    pipe: Arc<MediaPipe>,
    side: usize,
}

impl MediaChannel for MemoryMediaChannel {
    fn answer(&self, stream: MediaStream) -> Result<(), LinkError> {
        if self.side == 0 {
            return Err(LinkError::MediaFailed(
                "caller cannot answer its own offer".to_string(),
            ));
        }
        let mut status = self.pipe.status.lock();
        match *status {
            MediaStatus::Offered => {}
            MediaStatus::Answered => return Err(LinkError::AlreadyAnswered),
            MediaStatus::Closed => return Err(LinkError::Closed),
        }
        *status = MediaStatus::Answered;
        let _ = self.pipe.events[0].send(MediaEvent::Stream(stream.remote_view()));
        let _ = self.pipe.events[1].send(MediaEvent::Stream(self.pipe.offer.remote_view()));
        Ok(())
    }

    fn close(&self) {
        self.pipe.shut();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::types::MediaConstraints;

    fn data_parts(incoming: Incoming) -> (PeerId, DataConnection) {
        match incoming {
            Incoming::Data { peer, connection } => (peer, connection),
            Incoming::Media { .. } => panic!("expected a data channel"),
        }
    }

    #[tokio::test]
    async fn test_join_announces_roster() {
        let network = MemoryNetwork::new();
        let mut alice = network.join("alice").unwrap();
        let _bob = network.join("bob").unwrap();

        assert_eq!(alice.directory.recv().await.unwrap(), "alice");
        assert_eq!(alice.directory.recv().await.unwrap(), "alice,bob");

        network.leave(&PeerId::new("bob"));
        assert_eq!(alice.directory.recv().await.unwrap(), "alice");
    }

    #[test]
    fn test_join_rejects_unsafe_ids() {
        let network = MemoryNetwork::new();
        assert!(network.join("a,b").is_err());
        assert!(network.presence().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_data_channel_opens_then_carries_messages() {
        let network = MemoryNetwork::new();
        let alice = network.join("alice").unwrap();
        let mut bob = network.join("bob").unwrap();

        let mut outbound = alice.transport.connect(&PeerId::new("bob")).unwrap();
        assert!(!outbound.channel.is_open());
        assert_eq!(outbound.events.recv().await.unwrap(), DataEvent::Open);

        let (from, mut inbound) = data_parts(bob.incoming.recv().await.unwrap());
        assert_eq!(from.as_str(), "alice");
        assert_eq!(inbound.events.recv().await.unwrap(), DataEvent::Open);

        outbound.channel.send("call").unwrap();
        assert_eq!(
            inbound.events.recv().await.unwrap(),
            DataEvent::Message("call".to_string())
        );
        assert_eq!(
            network.messages(&PeerId::new("alice"), &PeerId::new("bob")),
            vec!["call"]
        );

        inbound.channel.close();
        assert_eq!(outbound.events.recv().await.unwrap(), DataEvent::Closed);
        assert_eq!(outbound.channel.send("yes"), Err(LinkError::NotOpen));
    }

    #[test]
    fn test_connect_to_unknown_peer() {
        let network = MemoryNetwork::new();
        let alice = network.join("alice").unwrap();
        let err = alice.transport.connect(&PeerId::new("ghost")).unwrap_err();
        assert_eq!(err, LinkError::PeerUnreachable("ghost".to_string()));
    }

    #[tokio::test]
    async fn test_answer_exchanges_streams() {
        let network = MemoryNetwork::new();
        let alice = network.join("alice").unwrap();
        let mut bob = network.join("bob").unwrap();

        let local = MediaStream::from_constraints(MediaConstraints::video_call());
        let mut caller = alice.transport.call(&PeerId::new("bob"), &local).unwrap();
        let Incoming::Media { mut connection, .. } = bob.incoming.recv().await.unwrap() else {
            panic!("expected a media offer");
        };

        let answer = MediaStream::from_constraints(MediaConstraints::audio_only());
        connection.channel.answer(answer.clone()).unwrap();
        assert_eq!(
            connection.channel.answer(answer.clone()),
            Err(LinkError::AlreadyAnswered)
        );

        let MediaEvent::Stream(at_caller) = caller.events.recv().await.unwrap() else {
            panic!("expected a stream");
        };
        let MediaEvent::Stream(at_callee) = connection.events.recv().await.unwrap() else {
            panic!("expected a stream");
        };
        assert_eq!(at_caller.id(), answer.id());
        assert_eq!(at_callee.id(), local.id());

        at_callee.stop_all();
        assert!(!local.is_stopped());
    }

    #[tokio::test]
    async fn test_fail_media_reaches_both_sides() {
        let network = MemoryNetwork::new();
        let alice = network.join("alice").unwrap();
        let mut bob = network.join("bob").unwrap();

        let local = MediaStream::from_constraints(MediaConstraints::video_call());
        let mut caller = alice.transport.call(&PeerId::new("bob"), &local).unwrap();
        let Incoming::Media { mut connection, .. } = bob.incoming.recv().await.unwrap() else {
            panic!("expected a media offer");
        };

        let failed = network.fail_media(&PeerId::new("bob"), &PeerId::new("alice"), "ice failed");
        assert_eq!(failed, 1);
        assert!(matches!(caller.events.recv().await.unwrap(), MediaEvent::Error(e) if e == "ice failed"));
        assert!(matches!(connection.events.recv().await.unwrap(), MediaEvent::Error(_)));
        assert_eq!(network.fail_media(&PeerId::new("alice"), &PeerId::new("bob"), "again"), 0);
    }

    #[tokio::test]
    async fn test_sever_closes_data_channels_silently() {
        let network = MemoryNetwork::new();
        let alice = network.join("alice").unwrap();
        let mut bob = network.join("bob").unwrap();

        let mut outbound = alice.transport.connect(&PeerId::new("bob")).unwrap();
        let (_, mut inbound) = data_parts(bob.incoming.recv().await.unwrap());
        assert_eq!(outbound.events.recv().await.unwrap(), DataEvent::Open);

        assert_eq!(network.sever(&PeerId::new("alice"), &PeerId::new("bob")), 1);
        assert_eq!(inbound.events.recv().await.unwrap(), DataEvent::Open);
        assert_eq!(inbound.events.recv().await.unwrap(), DataEvent::Closed);
        assert!(network.wire_log().is_empty());
    }
}
