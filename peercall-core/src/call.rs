//! Call session state machine
//!
//! A [`CallSession`] drives one call over one [`SignalingLink`], from the
//! first `call` message to teardown:
//!
//! ```text
//!  outbound: Requesting ──yes──► Connecting ──local stream + media channel──► Active
//!  inbound:  Offered ──accept──► Connecting ──local stream + media offer────► Active
//!
//!  Active/Connecting/Requesting ──hangup──► Closing ──grace delay──► Closed
//!  any live state ──close / channel loss / media error──► Closed
//! ```
//!
//! The session never blocks. Media acquisition and the grace delay run as
//! spawned tasks that report back through [`SessionWakeup`], tagged with the
//! call id so late reports for a finished call can be recognised. Every path
//! into `Closed` goes through one teardown that stops the local tracks, stops
//! the received tracks, cancels the grace timer and closes the link.
//!
//! The one-session-per-peer rule is enforced by the coordinator, not here.

use crate::identity::PeerId;
use crate::link_transport::{LinkError, MediaConnection, PeerTransport};
use crate::media::{MediaError, MediaSource, MediaStream};
use crate::signaling::{LinkEvent, LinkId, RawLinkEvent, SignalMessage, SignalingLink};
use crate::types::{
    CallDirection, CallEvent, CallId, CallInfo, CallState, EndReason, MediaConstraints,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A call is already in progress
    #[error("Already in a call")]
    Busy,

    /// No call to act on
    #[error("No active call")]
    NoActiveCall,

    /// No incoming call awaiting a decision
    #[error("No pending incoming call")]
    NoPendingOffer,

    /// Operation not allowed in the current state
    #[error("Invalid call state: {0}")]
    InvalidState(CallState),

    /// Attempted to call ourselves
    #[error("Cannot call own peer id")]
    SelfCall,

    /// Transport error
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// The coordinator is no longer running
    #[error("Call coordinator stopped")]
    Stopped,
}

/// Completion of a suspended session operation
#[derive(Debug)]
pub(crate) enum SessionWakeup {
    /// Local media acquisition finished
    MediaAcquired {
        call_id: CallId,
        result: Result<MediaStream, MediaError>,
    },
    /// The post-`close` grace delay elapsed
    GraceElapsed { call_id: CallId },
}

impl SessionWakeup {
    pub(crate) fn call_id(&self) -> CallId {
        match self {
            SessionWakeup::MediaAcquired { call_id, .. }
            | SessionWakeup::GraceElapsed { call_id } => *call_id,
        }
    }

    /// Drop a wake-up whose session is gone, releasing any stream it carries
    pub(crate) fn discard(self) {
        if let SessionWakeup::MediaAcquired {
            call_id,
            result: Ok(stream),
        } = self
        {
            let stopped = stream.stop_all();
            tracing::warn!(call_id = %call_id, stopped, "Media acquired for a finished call, stopping tracks");
        }
    }
}

/// Everything a session needs from its coordinator
pub(crate) struct SessionContext {
    pub(crate) events: broadcast::Sender<CallEvent>,
    pub(crate) wakeups: mpsc::UnboundedSender<SessionWakeup>,
    pub(crate) media: Arc<dyn MediaSource>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) constraints: MediaConstraints,
    pub(crate) close_grace: Duration,
    pub(crate) muted: bool,
    pub(crate) camera_hidden: bool,
}

impl SessionContext {
    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

/// Cancellable grace delay; aborted when dropped
#[derive(Debug)]
struct GraceTimer(JoinHandle<()>);

impl Drop for GraceTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// State of one call
#[derive(Debug)]
pub struct CallSession {
    id: CallId,
    direction: CallDirection,
    link: SignalingLink,
    state: CallState,
    call_sent: bool,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
    pending_offer: Option<MediaConnection>,
    grace: Option<GraceTimer>,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    end_reason: Option<EndReason>,
}

impl CallSession {
    fn with_state(link: SignalingLink, direction: CallDirection, state: CallState) -> Self {
        Self {
            id: CallId::new(),
            direction,
            link,
            state,
            call_sent: false,
            local_stream: None,
            remote_stream: None,
            pending_offer: None,
            grace: None,
            created_at: Utc::now(),
            connected_at: None,
            end_reason: None,
        }
    }

    /// Start an outbound call: enter `Requesting` and send `call`
    ///
    /// If the data channel is not open yet, `call` goes out when it opens.
    pub(crate) fn outbound(link: SignalingLink, ctx: &SessionContext) -> Self {
        let mut session = Self::with_state(link, CallDirection::Outbound, CallState::Requesting);
        tracing::info!(call_id = %session.id, peer = %session.remote(), "Requesting call");
        ctx.emit(CallEvent::StateChanged {
            call_id: session.id,
            peer: session.remote().clone(),
            state: CallState::Requesting,
        });
        session.send_call_request();
        session
    }

    /// Record an inbound `call`: enter `Offered` and ask for a decision
    pub(crate) fn offered(link: SignalingLink, ctx: &SessionContext) -> Self {
        let session = Self::with_state(link, CallDirection::Inbound, CallState::Offered);
        tracing::info!(call_id = %session.id, peer = %session.remote(), "Incoming call offered");
        ctx.emit(CallEvent::StateChanged {
            call_id: session.id,
            peer: session.remote().clone(),
            state: CallState::Offered,
        });
        ctx.emit(CallEvent::IncomingCall {
            call_id: session.id,
            peer: session.remote().clone(),
        });
        session
    }

    /// Call identifier
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Who started the call
    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    /// Remote peer
    pub fn remote(&self) -> &PeerId {
        self.link.remote()
    }

    /// Link carrying this call
    pub fn link_id(&self) -> LinkId {
        self.link.id()
    }

    /// Whether the session has not reached `Closed`
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Our camera/microphone stream, once acquired
    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    /// The remote peer's stream, once received
    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    /// Why the session closed
    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    /// Snapshot for display
    pub fn info(&self) -> CallInfo {
        CallInfo {
            call_id: self.id,
            peer: self.remote().clone(),
            direction: self.direction,
            state: self.state,
            created_at: self.created_at,
            connected_at: self.connected_at,
        }
    }

    /// Interpret and apply a transport event from the session's own link
    pub(crate) fn handle_raw(&mut self, event: RawLinkEvent, ctx: &SessionContext) {
        if let Some(event) = self.link.interpret(event) {
            self.handle_link_event(event, ctx);
        }
    }

    /// Apply an event from the session's own link
    pub(crate) fn handle_link_event(&mut self, event: LinkEvent, ctx: &SessionContext) {
        if !self.is_live() {
            return;
        }
        match event {
            LinkEvent::Opened => {
                if self.state == CallState::Requesting {
                    self.send_call_request();
                }
            }
            LinkEvent::Message(SignalMessage::Yes) if self.state == CallState::Requesting => {
                tracing::info!(call_id = %self.id, "Call accepted by remote peer");
                self.transition(CallState::Connecting, ctx);
                self.start_media_acquisition(ctx);
            }
            LinkEvent::Message(SignalMessage::No) if self.state == CallState::Requesting => {
                tracing::info!(call_id = %self.id, "Call declined by remote peer");
                self.finish(EndReason::Declined, ctx);
            }
            LinkEvent::Message(SignalMessage::Close) => {
                if self.state == CallState::Closing {
                    self.finish(EndReason::LocalHangup, ctx);
                } else {
                    tracing::info!(call_id = %self.id, "Remote peer hung up");
                    self.finish(EndReason::RemoteHangup, ctx);
                }
            }
            LinkEvent::Message(message) => {
                tracing::trace!(call_id = %self.id, state = ?self.state, message = %message, "Ignoring out-of-state message");
            }
            LinkEvent::StreamReady(stream) => self.remote_stream_ready(stream, ctx),
            LinkEvent::DataClosed | LinkEvent::MediaClosed => {
                self.link_lost(EndReason::LinkClosed, ctx);
            }
            LinkEvent::MediaError(err) => {
                tracing::warn!(call_id = %self.id, error = %err, "Media channel failed");
                self.link_lost(EndReason::LinkFailed(err), ctx);
            }
        }
    }

    /// Answer an `Offered` session
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` unless the session is `Offered`, or
    /// a link error if `yes` could not be sent (the session is then closed)
    pub(crate) fn decide(&mut self, accept: bool, ctx: &SessionContext) -> Result<(), CallError> {
        if self.state != CallState::Offered {
            return Err(CallError::InvalidState(self.state));
        }
        if !accept {
            tracing::info!(call_id = %self.id, "Declining call");
            let _ = self.link.send(SignalMessage::No);
            self.finish(EndReason::Rejected, ctx);
            return Ok(());
        }

        tracing::info!(call_id = %self.id, "Accepting call");
        if let Err(err) = self.link.send(SignalMessage::Yes) {
            self.finish(EndReason::LinkClosed, ctx);
            return Err(err.into());
        }
        self.transition(CallState::Connecting, ctx);
        self.start_media_acquisition(ctx);
        Ok(())
    }

    /// Self-initiated hangup: send `close`, then tear down after the grace delay
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` from `Offered` (use a decision
    /// instead), `Closing` and `Closed`
    pub(crate) fn hangup(&mut self, ctx: &SessionContext) -> Result<(), CallError> {
        match self.state {
            CallState::Requesting | CallState::Connecting | CallState::Active => {
                tracing::info!(call_id = %self.id, "Hanging up");
                let _ = self.link.send(SignalMessage::Close);
                self.transition(CallState::Closing, ctx);
                self.start_grace_timer(ctx);
                Ok(())
            }
            other => Err(CallError::InvalidState(other)),
        }
    }

    /// Handle an inbound media offer from the session's remote peer
    pub(crate) fn media_offered(&mut self, connection: MediaConnection, ctx: &SessionContext) {
        if self.direction != CallDirection::Inbound
            || self.state != CallState::Connecting
            || self.pending_offer.is_some()
        {
            tracing::warn!(call_id = %self.id, state = ?self.state, "Unexpected media offer, closing it");
            connection.channel.close();
            return;
        }
        match self.local_stream.clone() {
            Some(stream) => self.answer_offer(connection, stream, ctx),
            None => {
                tracing::debug!(call_id = %self.id, "Media offer waiting for local stream");
                self.pending_offer = Some(connection);
            }
        }
    }

    /// Resume after a suspension point
    pub(crate) fn handle_wakeup(&mut self, wakeup: SessionWakeup, ctx: &SessionContext) {
        if wakeup.call_id() != self.id {
            wakeup.discard();
            return;
        }
        match wakeup {
            SessionWakeup::MediaAcquired { result, .. } => self.media_acquired(result, ctx),
            SessionWakeup::GraceElapsed { .. } => {
                if self.state == CallState::Closing {
                    self.finish(EndReason::LocalHangup, ctx);
                }
            }
        }
    }

    /// Mute or unmute the local audio tracks
    pub(crate) fn set_muted(&self, muted: bool) {
        if let Some(stream) = &self.local_stream {
            stream.set_audio_enabled(!muted);
        }
    }

    /// Hide or show the local video tracks
    pub(crate) fn set_camera_hidden(&self, hidden: bool) {
        if let Some(stream) = &self.local_stream {
            stream.set_video_enabled(!hidden);
        }
    }

    /// End the session because the coordinator is going away
    pub(crate) fn shutdown(&mut self, ctx: &SessionContext) {
        if !self.is_live() {
            return;
        }
        if self.state != CallState::Closing {
            let _ = self.link.send(SignalMessage::Close);
        }
        self.finish(EndReason::Shutdown, ctx);
    }

    fn send_call_request(&mut self) {
        if self.call_sent || !self.link.is_open() {
            return;
        }
        if self.link.send(SignalMessage::Call).is_ok() {
            self.call_sent = true;
        }
    }

    fn media_acquired(&mut self, result: Result<MediaStream, MediaError>, ctx: &SessionContext) {
        if self.state != CallState::Connecting {
            SessionWakeup::MediaAcquired {
                call_id: self.id,
                result,
            }
            .discard();
            return;
        }

        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(call_id = %self.id, error = %err, "Local media unavailable");
                let _ = self.link.send(SignalMessage::Close);
                self.finish(EndReason::MediaUnavailable(err.to_string()), ctx);
                return;
            }
        };

        stream.set_audio_enabled(!ctx.muted);
        stream.set_video_enabled(!ctx.camera_hidden);
        self.local_stream = Some(stream.clone());
        ctx.emit(CallEvent::LocalStreamReady {
            call_id: self.id,
            stream: stream.clone(),
        });

        match self.direction {
            CallDirection::Outbound => {
                let attached = ctx
                    .transport
                    .call(self.link.remote(), &stream)
                    .and_then(|connection| self.link.attach_media(connection));
                match attached {
                    Ok(()) => self.transition(CallState::Active, ctx),
                    Err(err) => self.abort_with(err, ctx),
                }
            }
            CallDirection::Inbound => {
                if let Some(offer) = self.pending_offer.take() {
                    self.answer_offer(offer, stream, ctx);
                }
            }
        }
    }

    fn answer_offer(&mut self, offer: MediaConnection, stream: MediaStream, ctx: &SessionContext) {
        let answered = self
            .link
            .attach_media(offer)
            .and_then(|()| self.link.answer_media(stream));
        match answered {
            Ok(()) => self.transition(CallState::Active, ctx),
            Err(err) => self.abort_with(err, ctx),
        }
    }

    fn remote_stream_ready(&mut self, stream: MediaStream, ctx: &SessionContext) {
        match self.state {
            CallState::Connecting | CallState::Active => {
                tracing::debug!(call_id = %self.id, stream_id = %stream.id(), "Remote stream ready");
                if let Some(previous) = self.remote_stream.replace(stream.clone()) {
                    previous.stop_all();
                }
                ctx.emit(CallEvent::RemoteStreamReady {
                    call_id: self.id,
                    stream,
                });
            }
            _ => {
                tracing::trace!(call_id = %self.id, state = ?self.state, "Dropping remote stream");
                stream.stop_all();
            }
        }
    }

    fn link_lost(&mut self, reason: EndReason, ctx: &SessionContext) {
        if self.state == CallState::Closing {
            // The remote tore the link down before our grace delay ran out
            self.finish(EndReason::LocalHangup, ctx);
        } else {
            self.finish(reason, ctx);
        }
    }

    fn abort_with(&mut self, err: LinkError, ctx: &SessionContext) {
        tracing::warn!(call_id = %self.id, error = %err, "Failed to attach media");
        let _ = self.link.send(SignalMessage::Close);
        self.finish(EndReason::LinkFailed(err.to_string()), ctx);
    }

    fn start_media_acquisition(&self, ctx: &SessionContext) {
        let media = Arc::clone(&ctx.media);
        let wakeups = ctx.wakeups.clone();
        let constraints = ctx.constraints;
        let call_id = self.id;
        tracing::debug!(call_id = %call_id, "Acquiring local media");
        tokio::spawn(async move {
            let result = media.acquire(constraints).await;
            if let Err(mpsc::error::SendError(wakeup)) =
                wakeups.send(SessionWakeup::MediaAcquired { call_id, result })
            {
                wakeup.discard();
            }
        });
    }

    fn start_grace_timer(&mut self, ctx: &SessionContext) {
        let wakeups = ctx.wakeups.clone();
        let delay = ctx.close_grace;
        let call_id = self.id;
        self.grace = Some(GraceTimer(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = wakeups.send(SessionWakeup::GraceElapsed { call_id });
        })));
    }

    fn transition(&mut self, next: CallState, ctx: &SessionContext) {
        let old_state = self.state;
        if !old_state.can_transition_to(next) {
            tracing::warn!(
                call_id = %self.id,
                old_state = ?old_state,
                new_state = ?next,
                "Ignoring invalid state transition"
            );
            return;
        }
        self.state = next;
        if next == CallState::Active {
            self.connected_at = Some(Utc::now());
        }
        tracing::debug!(
            call_id = %self.id,
            old_state = ?old_state,
            new_state = ?next,
            "Call state transition"
        );
        ctx.emit(CallEvent::StateChanged {
            call_id: self.id,
            peer: self.remote().clone(),
            state: next,
        });
    }

    fn finish(&mut self, reason: EndReason, ctx: &SessionContext) {
        if !self.is_live() {
            return;
        }
        self.grace = None;
        if let Some(offer) = self.pending_offer.take() {
            offer.channel.close();
        }
        if let Some(stream) = self.local_stream.take() {
            let stopped = stream.stop_all();
            tracing::debug!(call_id = %self.id, stopped, "Local tracks stopped");
        }
        if let Some(stream) = self.remote_stream.take() {
            stream.stop_all();
        }
        self.link.close();

        if reason == EndReason::Declined {
            ctx.emit(CallEvent::Declined {
                call_id: self.id,
                peer: self.remote().clone(),
            });
        }
        self.transition(CallState::Closed, ctx);
        tracing::info!(call_id = %self.id, reason = ?reason, "Call ended");
        ctx.emit(CallEvent::CallEnded {
            call_id: self.id,
            peer: self.remote().clone(),
            reason: reason.clone(),
        });
        self.end_reason = Some(reason);
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if let Some(stream) = self.local_stream.take() {
            stream.stop_all();
        }
    }
}
