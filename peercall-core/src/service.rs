//! Call coordinator
//!
//! One [`CallCoordinator`] serves one local peer. It owns at most one
//! [`CallSession`], decides what happens to inbound `call` requests, and turns
//! local intents into sessions.
//!
//! The coordinator runs as a single tokio task. Every input (UI command, link
//! event, media or timer wake-up, incoming connection, roster broadcast) is
//! handled to completion before the next one is taken, so the session state
//! machine needs no locks. [`CallCoordinator`] itself is a cheap cloneable
//! handle that talks to that task.

use crate::call::{CallError, CallSession, SessionContext, SessionWakeup};
use crate::directory::PeerDirectory;
use crate::identity::PeerId;
use crate::link_transport::{Incoming, PeerTransport};
use crate::media::MediaSource;
use crate::signaling::{LinkEnvelope, LinkEvent, LinkId, SignalMessage, SignalingLink};
use crate::types::{CallEvent, CallId, CallInfo, CallState, MediaConstraints};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Delay between sending `close` and tearing the link down, in milliseconds
    pub close_grace_ms: u64,
    /// Constraints used when acquiring local media
    pub constraints: MediaConstraints,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl CoordinatorConfig {
    /// Grace delay as a duration
    #[must_use]
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            close_grace_ms: 200,
            constraints: MediaConstraints::video_call(),
            event_capacity: 100,
        }
    }
}

const COMMAND_CAPACITY: usize = 32;

enum Command {
    PlaceCall {
        peer: PeerId,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Hangup {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Decide {
        accept: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<()>,
    },
    SetCameraHidden {
        hidden: bool,
        reply: oneshot::Sender<()>,
    },
    Roster {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    CurrentCall {
        reply: oneshot::Sender<Option<CallInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running call coordinator
///
/// Clones share the same coordinator. When the last handle is dropped the
/// coordinator shuts down as if [`CallCoordinator::shutdown`] was called.
#[derive(Debug, Clone)]
pub struct CallCoordinator {
    local: PeerId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
}

impl CallCoordinator {
    /// Create a builder
    #[must_use]
    pub fn builder(
        transport: Arc<dyn PeerTransport>,
        media: Arc<dyn MediaSource>,
    ) -> CallCoordinatorBuilder {
        CallCoordinatorBuilder::new(transport, media)
    }

    /// Our peer id
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// Subscribe to call and roster events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Call `peer`
    ///
    /// # Errors
    ///
    /// Returns `CallError::Busy` if a call is already in progress,
    /// `CallError::SelfCall` for our own id, or a link error if the peer
    /// cannot be reached
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn place_call(&self, peer: PeerId) -> Result<CallId, CallError> {
        self.request(|reply| Command::PlaceCall { peer, reply })
            .await?
    }

    /// Hang up the current call
    ///
    /// # Errors
    ///
    /// Returns `CallError::NoActiveCall` without a call, or
    /// `CallError::InvalidState` if the call cannot be hung up now
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Hangup { reply }).await?
    }

    /// Accept or decline the pending incoming call
    ///
    /// # Errors
    ///
    /// Returns `CallError::NoPendingOffer` unless an incoming call is waiting
    /// for a decision, including while an outgoing call is in progress
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn decide(&self, accept: bool) -> Result<(), CallError> {
        self.request(|reply| Command::Decide { accept, reply })
            .await?
    }

    /// Mute or unmute the microphone, now and for later calls
    ///
    /// # Errors
    ///
    /// Returns `CallError::Stopped` if the coordinator is gone
    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetMuted { muted, reply })
            .await
    }

    /// Hide or show the camera, now and for later calls
    ///
    /// # Errors
    ///
    /// Returns `CallError::Stopped` if the coordinator is gone
    pub async fn set_camera_hidden(&self, hidden: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetCameraHidden { hidden, reply })
            .await
    }

    /// Online peers, excluding ourselves, in broadcast order
    ///
    /// # Errors
    ///
    /// Returns `CallError::Stopped` if the coordinator is gone
    pub async fn roster(&self) -> Result<Vec<PeerId>, CallError> {
        self.request(|reply| Command::Roster { reply }).await
    }

    /// Snapshot of the current call, if any
    ///
    /// # Errors
    ///
    /// Returns `CallError::Stopped` if the coordinator is gone
    pub async fn current_call(&self) -> Result<Option<CallInfo>, CallError> {
        self.request(|reply| Command::CurrentCall { reply }).await
    }

    /// End any call and stop the coordinator
    ///
    /// # Errors
    ///
    /// Returns `CallError::Stopped` if the coordinator was already gone
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CallError::Stopped)?;
        response.await.map_err(|_| CallError::Stopped)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::PlaceCall { .. } => "PlaceCall",
            Command::Hangup { .. } => "Hangup",
            Command::Decide { .. } => "Decide",
            Command::SetMuted { .. } => "SetMuted",
            Command::SetCameraHidden { .. } => "SetCameraHidden",
            Command::Roster { .. } => "Roster",
            Command::CurrentCall { .. } => "CurrentCall",
            Command::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Call coordinator builder
pub struct CallCoordinatorBuilder {
    transport: Arc<dyn PeerTransport>,
    media: Arc<dyn MediaSource>,
    config: CoordinatorConfig,
    directory: Option<BoxStream<'static, String>>,
}

impl CallCoordinatorBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(transport: Arc<dyn PeerTransport>, media: Arc<dyn MediaSource>) -> Self {
        Self {
            transport,
            media,
            config: CoordinatorConfig::default(),
            directory: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Follow a directory broadcast channel
    ///
    /// Lagging behind is harmless: only the newest roster matters.
    #[must_use]
    pub fn with_directory(self, updates: broadcast::Receiver<String>) -> Self {
        let stream = BroadcastStream::new(updates).filter_map(|update| async move {
            match update {
                Ok(payload) => Some(payload),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Skipped stale roster broadcasts");
                    None
                }
            }
        });
        self.with_directory_stream(stream.boxed())
    }

    /// Follow an arbitrary stream of roster payloads
    #[must_use]
    pub fn with_directory_stream(mut self, updates: BoxStream<'static, String>) -> Self {
        self.directory = Some(updates);
        self
    }

    /// Start the coordinator task
    ///
    /// `incoming` delivers connections opened by remote peers. Must be called
    /// within a tokio runtime.
    pub fn spawn(self, incoming: mpsc::UnboundedReceiver<Incoming>) -> CallCoordinator {
        let local = self.transport.local_id().clone();
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let (wakeups_tx, wakeups_rx) = mpsc::unbounded_channel();

        let actor = CoordinatorActor {
            local: local.clone(),
            transport: Arc::clone(&self.transport),
            ctx: SessionContext {
                events: events.clone(),
                wakeups: wakeups_tx,
                media: self.media,
                transport: self.transport,
                constraints: self.config.constraints,
                close_grace: self.config.close_grace(),
                muted: false,
                camera_hidden: false,
            },
            directory: PeerDirectory::new(),
            session: None,
            pending: HashMap::new(),
            links: links_tx,
        };
        let inputs = Inputs {
            commands: commands_rx,
            links: links_rx,
            wakeups: wakeups_rx,
            incoming,
            directory: self.directory,
        };

        tracing::info!(local = %local, "Starting call coordinator");
        tokio::spawn(actor.run(inputs));

        CallCoordinator {
            local,
            commands: commands_tx,
            events,
        }
    }
}

struct Inputs {
    commands: mpsc::Receiver<Command>,
    links: mpsc::UnboundedReceiver<LinkEnvelope>,
    wakeups: mpsc::UnboundedReceiver<SessionWakeup>,
    incoming: mpsc::UnboundedReceiver<Incoming>,
    directory: Option<BoxStream<'static, String>>,
}

struct CoordinatorActor {
    local: PeerId,
    transport: Arc<dyn PeerTransport>,
    ctx: SessionContext,
    directory: PeerDirectory,
    session: Option<CallSession>,
    // Inbound links that have not sent `call` yet
    pending: HashMap<LinkId, SignalingLink>,
    links: mpsc::UnboundedSender<LinkEnvelope>,
}

impl CoordinatorActor {
    async fn run(mut self, mut inputs: Inputs) {
        let mut incoming_open = true;
        loop {
            tokio::select! {
                command = inputs.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(envelope) = inputs.links.recv() => self.on_link_event(envelope),
                Some(wakeup) = inputs.wakeups.recv() => self.on_wakeup(wakeup),
                incoming = inputs.incoming.recv(), if incoming_open => match incoming {
                    Some(incoming) => self.on_incoming(incoming),
                    None => {
                        tracing::debug!(local = %self.local, "Transport stopped delivering connections");
                        incoming_open = false;
                    }
                },
                update = next_update(&mut inputs.directory) => match update {
                    Some(payload) => self.on_roster(&payload),
                    None => inputs.directory = None,
                },
            }
            self.reap();
        }
        tracing::info!(local = %self.local, "Call coordinator stopped");
    }

    fn on_command(&mut self, command: Command) {
        tracing::trace!(local = %self.local, command = ?command, "Handling command");
        match command {
            Command::PlaceCall { peer, reply } => {
                let _ = reply.send(self.place_call(peer));
            }
            Command::Hangup { reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => session.hangup(&self.ctx),
                    None => Err(CallError::NoActiveCall),
                };
                let _ = reply.send(result);
            }
            Command::Decide { accept, reply } => {
                let result = match self.session.as_mut() {
                    Some(session) if session.state() == CallState::Offered => {
                        session.decide(accept, &self.ctx)
                    }
                    _ => Err(CallError::NoPendingOffer),
                };
                let _ = reply.send(result);
            }
            Command::SetMuted { muted, reply } => {
                self.ctx.muted = muted;
                if let Some(session) = &self.session {
                    session.set_muted(muted);
                }
                let _ = reply.send(());
            }
            Command::SetCameraHidden { hidden, reply } => {
                self.ctx.camera_hidden = hidden;
                if let Some(session) = &self.session {
                    session.set_camera_hidden(hidden);
                }
                let _ = reply.send(());
            }
            Command::Roster { reply } => {
                let _ = reply.send(self.directory.current_roster(&self.local));
            }
            Command::CurrentCall { reply } => {
                let _ = reply.send(self.session.as_ref().map(CallSession::info));
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn place_call(&mut self, peer: PeerId) -> Result<CallId, CallError> {
        if peer == self.local {
            return Err(CallError::SelfCall);
        }
        if let Some(session) = &self.session {
            tracing::warn!(peer = %peer, current = %session.remote(), "Refusing to place a second call");
            return Err(CallError::Busy);
        }
        if !self.directory.is_online(&peer) {
            tracing::debug!(peer = %peer, "Calling a peer missing from the roster");
        }
        let connection = self.transport.connect(&peer)?;
        let link = SignalingLink::new(peer, connection, self.links.clone());
        let session = CallSession::outbound(link, &self.ctx);
        let call_id = session.id();
        self.session = Some(session);
        Ok(call_id)
    }

    fn on_link_event(&mut self, envelope: LinkEnvelope) {
        if let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.link_id() == envelope.link)
        {
            session.handle_raw(envelope.event, &self.ctx);
            return;
        }

        let Some(link) = self.pending.get_mut(&envelope.link) else {
            tracing::trace!(link = %envelope.link, "Event for a released link");
            return;
        };
        match link.interpret(envelope.event) {
            Some(LinkEvent::Message(SignalMessage::Call)) => {
                if let Some(link) = self.pending.remove(&envelope.link) {
                    self.on_call_request(link);
                }
            }
            Some(LinkEvent::DataClosed) => {
                self.pending.remove(&envelope.link);
            }
            Some(event) => {
                tracing::trace!(link = %envelope.link, event = ?event, "Ignoring event before call request");
            }
            None => {}
        }
    }

    fn on_call_request(&mut self, mut link: SignalingLink) {
        if let Some(session) = &self.session {
            tracing::info!(
                peer = %link.remote(),
                current = %session.remote(),
                "Busy, declining incoming call"
            );
            let _ = link.send(SignalMessage::No);
            link.close();
            return;
        }
        self.session = Some(CallSession::offered(link, &self.ctx));
    }

    fn on_incoming(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::Data { peer, connection } => {
                let link = SignalingLink::new(peer, connection, self.links.clone());
                tracing::debug!(link = %link.id(), peer = %link.remote(), "Inbound data channel");
                // At most one pending link per peer; the newest wins
                self.pending.retain(|id, older| {
                    if older.remote() != link.remote() {
                        return true;
                    }
                    tracing::debug!(link = %id, peer = %older.remote(), "Replacing idle pending link");
                    older.close();
                    false
                });
                self.pending.insert(link.id(), link);
            }
            Incoming::Media { peer, connection } => match self.session.as_mut() {
                Some(session) if session.remote() == &peer => {
                    session.media_offered(connection, &self.ctx);
                }
                _ => {
                    tracing::warn!(peer = %peer, "Media offer without a matching call, closing it");
                    connection.channel.close();
                }
            },
        }
    }

    fn on_wakeup(&mut self, wakeup: SessionWakeup) {
        match self.session.as_mut() {
            Some(session) => session.handle_wakeup(wakeup, &self.ctx),
            None => wakeup.discard(),
        }
    }

    fn on_roster(&mut self, payload: &str) {
        if !self.directory.on_roster_update(payload) {
            return;
        }
        let peers = self.directory.current_roster(&self.local);
        if let Some(session) = &self.session {
            if !self.directory.is_online(session.remote()) {
                tracing::info!(call_id = %session.id(), peer = %session.remote(), "Peer left the roster during a call");
            }
        }
        let _ = self.ctx.events.send(CallEvent::RosterChanged { peers });
    }

    fn reap(&mut self) {
        if self.session.as_ref().is_some_and(|s| !s.is_live()) {
            self.session = None;
        }
    }

    fn shutdown(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.shutdown(&self.ctx);
        }
        self.session = None;
        for (_, mut link) in self.pending.drain() {
            link.close();
        }
    }
}

async fn next_update(directory: &mut Option<BoxStream<'static, String>>) -> Option<String> {
    match directory {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
