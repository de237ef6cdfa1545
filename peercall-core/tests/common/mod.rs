//! Shared helpers for scenario tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use peercall_core::{
    CallCoordinator, CallEvent, CallState, CoordinatorConfig, DataConnection, DataEvent, EndReason,
    Incoming, MediaConnection, MediaEvent, MemoryNetwork, MemoryPeer, PeerId,
    SyntheticMediaSource,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A coordinator on the test network with its event feed
pub struct TestPeer {
    pub id: PeerId,
    pub coordinator: CallCoordinator,
    pub events: broadcast::Receiver<CallEvent>,
    pub media: Arc<SyntheticMediaSource>,
}

pub fn spawn_peer(network: &MemoryNetwork, name: &str, media: SyntheticMediaSource) -> TestPeer {
    spawn_peer_with(network, name, media, CoordinatorConfig::default())
}

pub fn spawn_peer_with(
    network: &MemoryNetwork,
    name: &str,
    media: SyntheticMediaSource,
    config: CoordinatorConfig,
) -> TestPeer {
    let media = Arc::new(media);
    let coordinator = network
        .join(name)
        .expect("join network")
        .spawn_coordinator(media.clone(), config);
    let events = coordinator.subscribe();
    TestPeer {
        id: PeerId::new(name),
        coordinator,
        events,
        media,
    }
}

/// Collect events until `done` holds for everything seen so far
pub async fn collect_until<F>(events: &mut broadcast::Receiver<CallEvent>, mut done: F) -> Vec<CallEvent>
where
    F: FnMut(&[CallEvent]) -> bool,
{
    let mut seen = Vec::new();
    tokio::time::timeout(TIMEOUT, async {
        while !done(&seen) {
            match events.recv().await {
                Ok(event) => seen.push(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for events");
    seen
}

/// Skip events until one matches
pub async fn wait_for<F>(events: &mut broadcast::Receiver<CallEvent>, matches: F) -> CallEvent
where
    F: Fn(&CallEvent) -> bool,
{
    collect_until(events, |seen| seen.last().is_some_and(&matches))
        .await
        .pop()
        .expect("at least one event")
}

/// Events already delivered, without waiting
pub fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub fn is_state(state: CallState) -> impl Fn(&CallEvent) -> bool {
    move |event| matches!(event, CallEvent::StateChanged { state: s, .. } if *s == state)
}

pub fn is_incoming_from(peer: &PeerId) -> impl Fn(&CallEvent) -> bool + '_ {
    move |event| matches!(event, CallEvent::IncomingCall { peer: p, .. } if p == peer)
}

pub fn is_remote_stream(event: &CallEvent) -> bool {
    matches!(event, CallEvent::RemoteStreamReady { .. })
}

pub fn is_local_stream(event: &CallEvent) -> bool {
    matches!(event, CallEvent::LocalStreamReady { .. })
}

pub fn is_ended(event: &CallEvent) -> bool {
    matches!(event, CallEvent::CallEnded { .. })
}

/// Wait for the current call to end and return why
pub async fn wait_ended(events: &mut broadcast::Receiver<CallEvent>) -> EndReason {
    match wait_for(events, is_ended).await {
        CallEvent::CallEnded { reason, .. } => reason,
        other => panic!("unexpected event {other:?}"),
    }
}

/// Place a call from `caller` to `callee`, accept it, and wait until both
/// sides are active with both streams
pub async fn establish_call(caller: &mut TestPeer, callee: &mut TestPeer) {
    caller
        .coordinator
        .place_call(callee.id.clone())
        .await
        .expect("place call");
    wait_for(&mut callee.events, is_incoming_from(&caller.id)).await;
    callee.coordinator.decide(true).await.expect("accept call");

    for peer in [caller, callee] {
        collect_until(&mut peer.events, |seen| {
            seen.iter().any(is_state(CallState::Active))
                && seen.iter().any(is_remote_stream)
        })
        .await;
    }
}

/// Every track of every stream the source handed out was stopped exactly once
pub fn all_tracks_stopped_once(media: &SyntheticMediaSource) -> bool {
    media
        .issued()
        .iter()
        .all(|stream| stream.tracks().iter().all(|track| track.stop_count() == 1))
}

pub async fn next_incoming(peer: &mut MemoryPeer) -> Incoming {
    tokio::time::timeout(TIMEOUT, peer.incoming.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("incoming channel closed")
}

pub async fn next_data(connection: &mut DataConnection) -> DataEvent {
    tokio::time::timeout(TIMEOUT, connection.events.recv())
        .await
        .expect("timed out waiting for a data event")
        .expect("data channel events ended")
}

pub async fn next_media(connection: &mut MediaConnection) -> MediaEvent {
    tokio::time::timeout(TIMEOUT, connection.events.recv())
        .await
        .expect("timed out waiting for a media event")
        .expect("media channel events ended")
}

/// Next data-channel message, skipping the open notification
pub async fn next_message(connection: &mut DataConnection) -> String {
    loop {
        match next_data(connection).await {
            DataEvent::Open => continue,
            DataEvent::Message(message) => return message,
            DataEvent::Closed => panic!("data channel closed while waiting for a message"),
        }
    }
}
