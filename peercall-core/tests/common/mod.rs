//! Shared fixtures for call tests
//!
//! A scripted media transport that records every operation, plus a harness
//! that plays the remote party on the other end of an in-memory relay.

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::panic)]

use async_trait::async_trait;
use peercall_core::{
    CallController, IceCandidate, LocalTrack, MediaType, MemoryTransport, PeerCallConfig,
    PeerTransport, PeerTransportError, PeerTransportFactory, SdpType, SessionDescription,
    SignalingMessage, SignalingTransport, SyntheticCapture, TransportEvent,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// How long to wait for something that should happen
pub const WAIT: Duration = Duration::from_secs(2);
/// How long to wait for something that should not happen
pub const QUIET: Duration = Duration::from_millis(150);

/// One recorded transport operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddTrack(MediaType),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    DetachTracks,
    StopTransceivers,
    Close,
}

/// Scripted media transport
pub struct FakePeerTransport {
    ops: parking_lot::Mutex<Vec<Op>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    remote_gate: Option<Arc<Semaphore>>,
    closed: AtomicBool,
}

impl FakePeerTransport {
    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: Op) {
        self.ops.lock().push(op);
    }
}

#[async_trait]
impl PeerTransport for FakePeerTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerTransportError> {
        self.record(Op::AddTrack(track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerTransportError> {
        self.record(Op::CreateOffer);
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerTransportError> {
        self.record(Op::CreateAnswer);
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerTransportError> {
        self.record(Op::SetLocal(description.sdp_type));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerTransportError> {
        if let Some(gate) = &self.remote_gate {
            gate.acquire().await.unwrap().forget();
        }
        self.record(Op::SetRemote(description.sdp_type));
        if description.sdp.contains("malformed") {
            return Err(PeerTransportError::InvalidDescription(
                "unparseable sdp".to_string(),
            ));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerTransportError> {
        self.record(Op::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn detach_tracks(&self) {
        self.record(Op::DetachTracks);
    }

    async fn stop_transceivers(&self) {
        self.record(Op::StopTransceivers);
    }

    async fn close(&self) {
        self.record(Op::Close);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out scripted transports
#[derive(Default)]
pub struct FakePeerFactory {
    sessions: parking_lot::Mutex<Vec<Arc<FakePeerTransport>>>,
    remote_gate: Option<Arc<Semaphore>>,
    created: AtomicUsize,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `set_remote_description` waits for one permit on `gate`
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            remote_gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn session(&self, index: usize) -> Option<Arc<FakePeerTransport>> {
        self.sessions.lock().get(index).cloned()
    }

    /// Wait until the `index`th session exists
    pub async fn wait_session(&self, index: usize) -> Arc<FakePeerTransport> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(session) = self.session(index) {
                return session;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("transport session {index} was never created");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl PeerTransportFactory for FakePeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerTransportError> {
        let transport = Arc::new(FakePeerTransport {
            ops: parking_lot::Mutex::new(Vec::new()),
            events,
            remote_gate: self.remote_gate.clone(),
            closed: AtomicBool::new(false),
        });
        self.sessions.lock().push(transport.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(transport)
    }
}

/// Poll `condition` until it holds
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A controller wired to a scripted transport, with the test playing the
/// remote party
pub struct Harness {
    pub controller: CallController<MemoryTransport>,
    pub local: Arc<MemoryTransport>,
    pub remote: Arc<MemoryTransport>,
    pub factory: Arc<FakePeerFactory>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(FakePeerFactory::new(), SyntheticCapture::new()).await
    }

    pub async fn start_with(factory: FakePeerFactory, capture: SyntheticCapture) -> Self {
        let (local, remote) = MemoryTransport::pair();
        let local = Arc::new(local);
        let remote = Arc::new(remote);
        remote.connect().await.unwrap();

        let factory = Arc::new(factory);
        let controller = CallController::builder(local.clone())
            .with_config(PeerCallConfig::default())
            .with_transport_factory(factory.clone())
            .with_capture(Arc::new(capture))
            .build()
            .unwrap();
        controller.start().await.unwrap();

        Self {
            controller,
            local,
            remote,
            factory,
        }
    }

    /// Send a message as the remote party
    pub async fn send(&self, message: SignalingMessage) {
        self.remote.send_text(message.to_json().unwrap()).await.unwrap();
    }

    /// Send a raw frame as the remote party
    pub async fn send_raw(&self, frame: &str) {
        self.remote.send_text(frame.to_string()).await.unwrap();
    }

    /// Next message the controller sent to the remote party
    pub async fn recv(&self) -> SignalingMessage {
        let frame = tokio::time::timeout(WAIT, self.remote.receive_text())
            .await
            .expect("no signaling message arrived")
            .unwrap()
            .unwrap();
        SignalingMessage::from_json(&frame).unwrap()
    }

    /// Assert the controller sends nothing for a short while
    pub async fn expect_silence(&self) {
        if let Ok(frame) = tokio::time::timeout(QUIET, self.remote.receive_text()).await {
            panic!("unexpected signaling frame: {frame:?}");
        }
    }

    /// Wait until the controller reaches `state`
    pub async fn wait_state(&self, state: peercall_core::CallState) {
        let mut rx = self.controller.watch_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("never reached {state:?}"))
            .unwrap();
    }

    /// Place a call and complete it with an answer from the remote party
    pub async fn establish_as_caller(&self) -> Arc<FakePeerTransport> {
        self.controller.call().await.unwrap();
        assert!(matches!(self.recv().await, SignalingMessage::Offer(_)));
        self.send(SignalingMessage::Answer(SessionDescription::answer(
            "v=0 remote-answer",
        )))
        .await;
        self.wait_state(peercall_core::CallState::Active).await;
        let session = self.factory.wait_session(0).await;
        eventually("answer applied", || {
            session.ops().contains(&Op::SetRemote(SdpType::Answer))
        })
        .await;
        session
    }
}

pub fn remote_offer() -> SignalingMessage {
    SignalingMessage::Offer(SessionDescription::offer("v=0 remote-offer"))
}

pub fn candidate(n: usize) -> IceCandidate {
    let mut candidate = IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"));
    candidate.sdp_mid = Some("0".to_string());
    candidate.sdp_mline_index = Some(0);
    candidate
}
