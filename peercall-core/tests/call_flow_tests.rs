//! End-to-end call flows against a scripted media transport
//!
//! The test plays the remote party on the other end of an in-memory relay.

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use common::{candidate, eventually, remote_offer, FakePeerFactory, Harness, Op};
use peercall_core::{
    CallError, CallEvent, CallState, ConnectionState, EndReason, MediaType, MemoryTransport,
    PeerCallConfig, Role, SdpType, SessionDescription, SignalingMessage, SignalingTransport,
    SyntheticCapture, TransportEvent,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};

async fn next_call_end(events: &mut broadcast::Receiver<CallEvent>) -> EndReason {
    loop {
        let event = tokio::time::timeout(common::WAIT, events.recv())
            .await
            .expect("no call end event")
            .unwrap();
        if let CallEvent::CallEnded { reason, .. } = event {
            return reason;
        }
    }
}

#[tokio::test]
async fn caller_happy_path() {
    let h = Harness::start().await;
    assert_eq!(h.controller.state(), CallState::Idle);

    let call_id = h.controller.call().await.unwrap();
    assert_eq!(h.controller.state(), CallState::Negotiating(Role::Caller));
    assert!(h.controller.in_call());

    match h.recv().await {
        SignalingMessage::Offer(offer) => assert_eq!(offer.sdp, "v=0 fake-offer"),
        other => panic!("expected offer, got {other:?}"),
    }

    let session = h.factory.wait_session(0).await;
    assert_eq!(
        session.ops(),
        vec![
            Op::AddTrack(MediaType::Audio),
            Op::AddTrack(MediaType::Video),
            Op::CreateOffer,
            Op::SetLocal(SdpType::Offer),
        ]
    );

    h.send(SignalingMessage::Answer(SessionDescription::answer("v=0 remote-answer")))
        .await;
    h.wait_state(CallState::Active).await;
    eventually("answer applied", || {
        session.ops().contains(&Op::SetRemote(SdpType::Answer))
    })
    .await;

    h.send(SignalingMessage::IceCandidate(candidate(1))).await;
    eventually("candidate applied", || session.applied_candidates().len() == 1).await;
    assert_eq!(session.applied_candidates(), vec![candidate(1).candidate]);
    assert_ne!(call_id.to_string(), "");
}

#[tokio::test]
async fn callee_happy_path() {
    let h = Harness::start().await;

    h.send(remote_offer()).await;
    match h.recv().await {
        SignalingMessage::Answer(answer) => assert_eq!(answer.sdp, "v=0 fake-answer"),
        other => panic!("expected answer, got {other:?}"),
    }
    assert_eq!(h.controller.state(), CallState::Negotiating(Role::Callee));

    let session = h.factory.wait_session(0).await;
    assert_eq!(
        session.ops(),
        vec![
            Op::SetRemote(SdpType::Offer),
            Op::AddTrack(MediaType::Audio),
            Op::AddTrack(MediaType::Video),
            Op::CreateAnswer,
            Op::SetLocal(SdpType::Answer),
        ]
    );

    session.emit(TransportEvent::ConnectionState(ConnectionState::Connecting));
    session.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
    h.wait_state(CallState::Active).await;
}

#[tokio::test]
async fn local_hangup_notifies_peer_and_releases_transport() {
    let h = Harness::start().await;
    let mut events = h.controller.subscribe_events();
    let session = h.establish_as_caller().await;

    h.controller.hang_up().await.unwrap();
    assert_eq!(h.recv().await, SignalingMessage::Hangup);
    assert_eq!(h.controller.state(), CallState::Idle);
    assert!(!h.controller.in_call());
    assert_eq!(next_call_end(&mut events).await, EndReason::LocalHangup);

    eventually("transport closed", || session.is_closed()).await;
    let ops = session.ops();
    assert_eq!(
        &ops[ops.len() - 3..],
        &[Op::DetachTracks, Op::StopTransceivers, Op::Close]
    );
}

#[tokio::test]
async fn hangup_is_idempotent() {
    let h = Harness::start().await;
    h.establish_as_caller().await;

    h.controller.hang_up().await.unwrap();
    assert_eq!(h.recv().await, SignalingMessage::Hangup);

    h.controller.hang_up().await.unwrap();
    h.controller.hang_up().await.unwrap();
    h.expect_silence().await;
    assert_eq!(h.controller.state(), CallState::Idle);
}

#[tokio::test]
async fn hangup_while_idle_sends_nothing() {
    let h = Harness::start().await;
    h.controller.hang_up().await.unwrap();
    h.expect_silence().await;
    assert_eq!(h.factory.created(), 0);
}

#[tokio::test]
async fn remote_hangup_ends_call_without_echo() {
    let h = Harness::start().await;
    let mut events = h.controller.subscribe_events();
    let session = h.establish_as_caller().await;

    h.send(SignalingMessage::Hangup).await;
    h.wait_state(CallState::Idle).await;
    assert_eq!(next_call_end(&mut events).await, EndReason::RemoteHangup);
    h.expect_silence().await;
    eventually("transport closed", || session.is_closed()).await;
}

#[tokio::test]
async fn terminal_connection_state_ends_call() {
    let h = Harness::start().await;
    let mut events = h.controller.subscribe_events();
    let session = h.establish_as_caller().await;

    session.emit(TransportEvent::ConnectionState(ConnectionState::Failed));
    h.wait_state(CallState::Idle).await;
    assert_eq!(next_call_end(&mut events).await, EndReason::ConnectionLost);
    h.expect_silence().await;
    eventually("transport closed", || session.is_closed()).await;
}

#[tokio::test]
async fn signaling_closed_ends_call() {
    let h = Harness::start().await;
    let session = h.establish_as_caller().await;

    session.emit(TransportEvent::SignalingState(peercall_core::SignalingState::Closed));
    h.wait_state(CallState::Idle).await;
}

#[tokio::test]
async fn call_while_in_call_is_rejected() {
    let h = Harness::start().await;
    h.controller.call().await.unwrap();

    assert_eq!(h.controller.call().await, Err(CallError::AlreadyInCall));
    assert_eq!(h.controller.state(), CallState::Negotiating(Role::Caller));
}

#[tokio::test]
async fn call_without_media_fails_but_incoming_is_answered() {
    let h = Harness::start_with(FakePeerFactory::new(), SyntheticCapture::unavailable()).await;

    assert!(matches!(
        h.controller.call().await,
        Err(CallError::MediaUnavailable(_))
    ));
    assert_eq!(h.controller.state(), CallState::Idle);

    h.send(remote_offer()).await;
    assert!(matches!(h.recv().await, SignalingMessage::Answer(_)));
    let session = h.factory.wait_session(0).await;
    assert!(!session
        .ops()
        .iter()
        .any(|op| matches!(op, Op::AddTrack(_))));
}

#[tokio::test]
async fn call_with_closed_channel_fails() {
    let h = Harness::start().await;
    h.local.disconnect().await;

    assert_eq!(h.controller.call().await, Err(CallError::ChannelNotOpen));
    assert_eq!(h.controller.state(), CallState::Idle);
    assert_eq!(h.factory.created(), 0);
}

#[tokio::test]
async fn call_before_start_fails() {
    let (local, _remote) = MemoryTransport::pair();
    let controller = peercall_core::CallController::builder(Arc::new(local))
        .with_config(PeerCallConfig::default())
        .with_transport_factory(Arc::new(FakePeerFactory::new()))
        .build()
        .unwrap();

    assert_eq!(controller.call().await, Err(CallError::NotStarted));
    assert_eq!(controller.hang_up().await, Err(CallError::NotStarted));
}

#[tokio::test]
async fn completion_after_hangup_is_discarded() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::start_with(FakePeerFactory::gated(gate.clone()), SyntheticCapture::new())
        .await;

    h.send(remote_offer()).await;
    h.wait_state(CallState::Negotiating(Role::Callee)).await;
    let session = h.factory.wait_session(0).await;

    h.controller.hang_up().await.unwrap();
    assert_eq!(h.recv().await, SignalingMessage::Hangup);
    assert_eq!(h.controller.state(), CallState::Idle);

    gate.add_permits(1);
    eventually("transport closed", || session.is_closed()).await;
    assert!(!session.ops().contains(&Op::CreateAnswer));
    h.expect_silence().await;
    assert_eq!(h.controller.state(), CallState::Idle);
}

#[tokio::test]
async fn offer_during_negotiation_is_rejected() {
    let h = Harness::start().await;
    h.controller.call().await.unwrap();
    assert!(matches!(h.recv().await, SignalingMessage::Offer(_)));

    h.send(remote_offer()).await;
    h.expect_silence().await;
    assert_eq!(h.controller.state(), CallState::Negotiating(Role::Caller));
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn answer_while_idle_is_ignored() {
    let h = Harness::start().await;
    h.send(SignalingMessage::Answer(SessionDescription::answer("v=0 stale")))
        .await;
    h.expect_silence().await;
    assert_eq!(h.controller.state(), CallState::Idle);
    assert_eq!(h.factory.created(), 0);

    h.controller.call().await.unwrap();
    assert!(matches!(h.recv().await, SignalingMessage::Offer(_)));
}

#[tokio::test]
async fn invalid_frames_do_not_stop_the_session() {
    let h = Harness::start().await;
    h.send_raw(r#"{"type":"renegotiate","data":{}}"#).await;
    h.send_raw("not json at all").await;
    h.send_raw(r#"{"type":"offer","data":{"type":"answer","sdp":"v=0"}}"#)
        .await;

    h.send(remote_offer()).await;
    assert!(matches!(h.recv().await, SignalingMessage::Answer(_)));
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn malformed_offer_fails_negotiation() {
    let h = Harness::start().await;
    let mut events = h.controller.subscribe_events();

    h.send(SignalingMessage::Offer(SessionDescription::offer("malformed")))
        .await;
    assert_eq!(next_call_end(&mut events).await, EndReason::NegotiationFailed);
    h.wait_state(CallState::Idle).await;
    h.expect_silence().await;

    let session = h.factory.wait_session(0).await;
    assert!(!session.ops().contains(&Op::CreateAnswer));
}

#[tokio::test]
async fn local_candidates_are_forwarded() {
    let h = Harness::start().await;
    let session = h.establish_as_caller().await;

    session.emit(TransportEvent::LocalCandidate(Some(candidate(7))));
    session.emit(TransportEvent::LocalCandidate(None));
    assert_eq!(h.recv().await, SignalingMessage::IceCandidate(candidate(7)));
    h.expect_silence().await;
}

#[tokio::test]
async fn remote_track_is_reported() {
    let h = Harness::start().await;
    let mut events = h.controller.subscribe_events();
    let session = h.establish_as_caller().await;

    session.emit(TransportEvent::RemoteTrack {
        track_id: "remote-video".to_string(),
        kind: MediaType::Video,
    });

    loop {
        let event = tokio::time::timeout(common::WAIT, events.recv())
            .await
            .unwrap()
            .unwrap();
        if let CallEvent::RemoteTrack { track_id, kind, .. } = event {
            assert_eq!(track_id, "remote-video");
            assert_eq!(kind, MediaType::Video);
            break;
        }
    }
}

#[tokio::test]
async fn video_toggle_does_not_affect_call() {
    let h = Harness::start().await;
    assert!(!h.controller.local_video_active());
    h.establish_as_caller().await;

    h.controller.start_local_video().unwrap();
    assert!(h.controller.local_video_active());
    assert_eq!(h.controller.state(), CallState::Active);

    h.controller.pause_local_video().unwrap();
    assert!(!h.controller.local_video_active());
    assert_eq!(h.controller.state(), CallState::Active);
    h.expect_silence().await;
}

#[tokio::test]
async fn new_call_after_previous_ended_uses_fresh_transport() {
    let h = Harness::start().await;
    let first = h.establish_as_caller().await;
    h.controller.hang_up().await.unwrap();
    assert_eq!(h.recv().await, SignalingMessage::Hangup);

    h.send(remote_offer()).await;
    assert!(matches!(h.recv().await, SignalingMessage::Answer(_)));
    let second = h.factory.wait_session(1).await;
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!second.is_closed());
}

#[tokio::test]
async fn shutdown_hangs_up_active_call() {
    let h = Harness::start().await;
    h.establish_as_caller().await;

    h.controller.shutdown().await;
    assert_eq!(h.recv().await, SignalingMessage::Hangup);
    assert_eq!(h.controller.call().await, Err(CallError::NotStarted));
}

#[tokio::test]
async fn duplicate_answer_while_active_is_ignored() {
    let h = Harness::start().await;
    let session = h.establish_as_caller().await;
    let ops_before = session.ops().len();

    h.send(SignalingMessage::Answer(SessionDescription::answer("v=0 duplicate")))
        .await;
    h.expect_silence().await;

    assert_eq!(h.controller.state(), CallState::Active);
    assert_eq!(session.ops().len(), ops_before);
}

#[tokio::test]
async fn answer_while_answering_is_ignored() {
    let h = Harness::start().await;
    h.send(remote_offer()).await;
    assert!(matches!(h.recv().await, SignalingMessage::Answer(_)));
    let session = h.factory.wait_session(0).await;
    let ops_before = session.ops().len();

    h.send(SignalingMessage::Answer(SessionDescription::answer("v=0 unexpected")))
        .await;
    h.expect_silence().await;

    assert_eq!(h.controller.state(), CallState::Negotiating(Role::Callee));
    assert_eq!(session.ops().len(), ops_before);
}

#[tokio::test]
async fn local_candidate_waits_for_answer() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::start_with(FakePeerFactory::gated(gate.clone()), SyntheticCapture::new())
        .await;

    h.send(remote_offer()).await;
    h.wait_state(CallState::Negotiating(Role::Callee)).await;
    let session = h.factory.wait_session(0).await;

    session.emit(TransportEvent::LocalCandidate(Some(candidate(4))));
    h.expect_silence().await;

    gate.add_permits(1);
    assert!(matches!(h.recv().await, SignalingMessage::Answer(_)));
    assert_eq!(h.recv().await, SignalingMessage::IceCandidate(candidate(4)));
}

#[tokio::test]
async fn failed_answer_send_ends_call() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::start_with(FakePeerFactory::gated(gate.clone()), SyntheticCapture::new())
        .await;
    let mut events = h.controller.subscribe_events();

    h.send(remote_offer()).await;
    h.wait_state(CallState::Negotiating(Role::Callee)).await;
    let session = h.factory.wait_session(0).await;

    h.local.disconnect().await;
    gate.add_permits(1);

    assert_eq!(next_call_end(&mut events).await, EndReason::SignalingFailed);
    h.wait_state(CallState::Idle).await;
    eventually("transport closed", || session.is_closed()).await;
    h.expect_silence().await;
}

#[tokio::test]
async fn start_after_shutdown_leaves_relay_closed() {
    let h = Harness::start().await;
    h.controller.shutdown().await;
    assert!(!h.local.is_open());

    assert_eq!(h.controller.start().await, Err(CallError::NotStarted));
    assert!(!h.local.is_open());
}
