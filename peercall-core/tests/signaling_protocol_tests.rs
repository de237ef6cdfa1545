//! Wire-level protocol behavior against a hand-driven remote peer
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::*;
use peercall_core::{
    CallEvent, CallState, CoordinatorConfig, DataEvent, EndReason, Incoming, MediaConstraints, MediaEvent,
    MediaStream, MemoryNetwork, PeerId, PeerTransport, SyntheticMediaSource,
};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_close_is_sent_before_link_is_torn_down() {
    let network = MemoryNetwork::new();
    let mut a = spawn_peer(&network, "A", SyntheticMediaSource::new());
    let mut b = network.join("B").unwrap();

    a.coordinator.place_call(PeerId::new("B")).await.unwrap();
    let Incoming::Data { mut connection, .. } = next_incoming(&mut b).await else {
        panic!("expected a data channel");
    };
    assert_eq!(next_message(&mut connection).await, "call");
    connection.channel.send("yes").unwrap();

    let Incoming::Media {
        connection: mut media,
        ..
    } = next_incoming(&mut b).await
    else {
        panic!("expected a media offer");
    };
    media
        .channel
        .answer(MediaStream::from_constraints(MediaConstraints::video_call()))
        .unwrap();
    assert!(matches!(next_media(&mut media).await, MediaEvent::Stream(_)));
    wait_for(&mut a.events, is_state(CallState::Active)).await;

    let started = Instant::now();
    a.coordinator.hangup().await.unwrap();

    // The scripted peer does not react, so A waits out the grace delay
    assert_eq!(next_message(&mut connection).await, "close");
    assert_eq!(next_data(&mut connection).await, DataEvent::Closed);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(wait_ended(&mut a.events).await, EndReason::LocalHangup);
    assert!(all_tracks_stopped_once(&a.media));
}

#[tokio::test]
async fn test_unknown_messages_are_ignored() {
    let network = MemoryNetwork::new();
    let mut a = spawn_peer(&network, "A", SyntheticMediaSource::new());
    let b = network.join("B").unwrap();

    let mut link = b.transport.connect(&PeerId::new("A")).unwrap();
    assert_eq!(next_data(&mut link).await, DataEvent::Open);
    link.channel.send("hello").unwrap();
    link.channel.send("yes").unwrap();
    link.channel.send("CALL").unwrap();
    link.channel.send("call").unwrap();

    wait_for(&mut a.events, is_incoming_from(&PeerId::new("B"))).await;
    let info = a.coordinator.current_call().await.unwrap().unwrap();
    assert_eq!(info.state, CallState::Offered);

    a.coordinator.decide(false).await.unwrap();
    assert_eq!(next_message(&mut link).await, "no");
    assert_eq!(next_data(&mut link).await, DataEvent::Closed);
    assert_eq!(wait_ended(&mut a.events).await, EndReason::Rejected);
}

#[tokio::test]
async fn test_repeated_call_does_not_reoffer() {
    let network = MemoryNetwork::new();
    let mut a = spawn_peer(&network, "A", SyntheticMediaSource::new());
    let b = network.join("B").unwrap();

    let mut link = b.transport.connect(&PeerId::new("A")).unwrap();
    assert_eq!(next_data(&mut link).await, DataEvent::Open);
    link.channel.send("call").unwrap();
    wait_for(&mut a.events, is_incoming_from(&PeerId::new("B"))).await;
    link.channel.send("call").unwrap();

    // Round trip through the coordinator so the second message is handled
    a.coordinator.set_muted(false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!drain(&mut a.events)
        .iter()
        .any(|e| matches!(e, CallEvent::IncomingCall { .. })));
    let info = a.coordinator.current_call().await.unwrap().unwrap();
    assert_eq!(info.state, CallState::Offered);
}

#[tokio::test]
async fn test_caller_gives_up_before_decision() {
    let network = MemoryNetwork::new();
    let mut a = spawn_peer(&network, "A", SyntheticMediaSource::new());
    let b = network.join("B").unwrap();

    let mut link = b.transport.connect(&PeerId::new("A")).unwrap();
    assert_eq!(next_data(&mut link).await, DataEvent::Open);
    link.channel.send("call").unwrap();
    wait_for(&mut a.events, is_incoming_from(&PeerId::new("B"))).await;

    link.channel.send("close").unwrap();
    assert_eq!(wait_ended(&mut a.events).await, EndReason::RemoteHangup);
    assert!(a.coordinator.current_call().await.unwrap().is_none());
    assert!(a.media.issued().is_empty());
}

#[tokio::test]
async fn test_channel_loss_while_offered() {
    let network = MemoryNetwork::new();
    let mut a = spawn_peer(&network, "A", SyntheticMediaSource::new());
    let b = network.join("B").unwrap();

    let mut link = b.transport.connect(&PeerId::new("A")).unwrap();
    assert_eq!(next_data(&mut link).await, DataEvent::Open);
    link.channel.send("call").unwrap();
    wait_for(&mut a.events, is_incoming_from(&PeerId::new("B"))).await;

    link.channel.close();
    assert_eq!(wait_ended(&mut a.events).await, EndReason::LinkClosed);
}

#[tokio::test]
async fn test_no_answer_ends_request() {
    let network = MemoryNetwork::new();
    let mut a = spawn_peer(&network, "A", SyntheticMediaSource::new());
    let mut b = network.join("B").unwrap();

    a.coordinator.place_call(PeerId::new("B")).await.unwrap();
    let Incoming::Data { mut connection, .. } = next_incoming(&mut b).await else {
        panic!("expected a data channel");
    };
    assert_eq!(next_message(&mut connection).await, "call");

    connection.channel.send("no").unwrap();
    let events = collect_until(&mut a.events, |seen| seen.iter().any(is_ended)).await;
    assert!(events.iter().any(|e| matches!(e, CallEvent::Declined { .. })));
    assert_eq!(next_data(&mut connection).await, DataEvent::Closed);
    assert!(a.media.issued().is_empty());
}

#[tokio::test]
async fn test_unsolicited_media_offer_is_closed() {
    let network = MemoryNetwork::new();
    let _a = spawn_peer(&network, "A", SyntheticMediaSource::new());
    let c = network.join("C").unwrap();

    let stream = MediaStream::from_constraints(MediaConstraints::audio_only());
    let mut offer = c.transport.call(&PeerId::new("A"), &stream).unwrap();
    assert!(matches!(next_media(&mut offer).await, MediaEvent::Closed));
}

#[tokio::test]
async fn test_link_that_never_calls_is_harmless() {
    let network = MemoryNetwork::new();
    let mut a = spawn_peer(&network, "A", SyntheticMediaSource::new());
    let b = network.join("B").unwrap();
    let mut c = spawn_peer(&network, "C", SyntheticMediaSource::new());

    let mut idle = b.transport.connect(&PeerId::new("A")).unwrap();
    assert_eq!(next_data(&mut idle).await, DataEvent::Open);

    establish_call(&mut c, &mut a).await;
    idle.channel.close();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let info = a.coordinator.current_call().await.unwrap().unwrap();
    assert_eq!(info.state, CallState::Active);
    assert_eq!(info.peer, c.id);
}

#[tokio::test]
async fn test_busy_while_close_grace_runs() {
    let network = MemoryNetwork::new();
    let config = CoordinatorConfig {
        close_grace_ms: 2_000,
        ..CoordinatorConfig::default()
    };
    let mut b = spawn_peer_with(&network, "B", SyntheticMediaSource::new(), config);
    let mut a = spawn_peer(&network, "A", SyntheticMediaSource::new());
    let r = network.join("R").unwrap();

    let mut link = r.transport.connect(&b.id).unwrap();
    assert_eq!(next_data(&mut link).await, DataEvent::Open);
    link.channel.send("call").unwrap();
    wait_for(&mut b.events, is_incoming_from(&PeerId::new("R"))).await;
    b.coordinator.decide(true).await.unwrap();
    assert_eq!(next_message(&mut link).await, "yes");

    // The scripted peer never offers media and never answers `close`
    b.coordinator.hangup().await.unwrap();
    assert_eq!(next_message(&mut link).await, "close");
    let closing = b.coordinator.current_call().await.unwrap().unwrap();
    assert_eq!(closing.state, CallState::Closing);

    a.coordinator.place_call(b.id.clone()).await.unwrap();
    assert_eq!(wait_ended(&mut a.events).await, EndReason::Declined);

    let after = b.coordinator.current_call().await.unwrap().unwrap();
    assert_eq!(after.call_id, closing.call_id);
    assert_eq!(after.state, CallState::Closing);
    assert_eq!(network.messages(&b.id, &a.id), vec!["no"]);
}

#[tokio::test]
async fn test_newer_idle_link_replaces_older_one() {
    let network = MemoryNetwork::new();
    let mut a = spawn_peer(&network, "A", SyntheticMediaSource::new());
    let b = network.join("B").unwrap();

    let mut first = b.transport.connect(&PeerId::new("A")).unwrap();
    assert_eq!(next_data(&mut first).await, DataEvent::Open);
    let mut second = b.transport.connect(&PeerId::new("A")).unwrap();
    assert_eq!(next_data(&mut second).await, DataEvent::Open);

    assert_eq!(next_data(&mut first).await, DataEvent::Closed);

    second.channel.send("call").unwrap();
    wait_for(&mut a.events, is_incoming_from(&PeerId::new("B"))).await;
    let info = a.coordinator.current_call().await.unwrap().unwrap();
    assert_eq!(info.state, CallState::Offered);
}
