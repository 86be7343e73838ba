//! Call negotiation state machine
//!
//! `PeerSession` owns the call state and at most one transport session. It
//! runs on a single task and consumes one ordered queue of inputs: inbound
//! signaling messages, local commands, monitor signals and results of
//! transport operations. Nothing else mutates it.
//!
//! ```text
//!               call()                     ANSWER
//!     Idle ───────────────► Negotiating ──────────────► Active
//!      ▲   OFFER            (Caller|Callee)  Connected   │
//!      │ ─────────────────►      │           (callee)    │
//!      │                         │ hangup / HANGUP /     │
//!      │                         ▼ terminal / failure    │
//!      └──────────────────── Closing ◄───────────────────┘
//! ```
//!
//! Transport operations are asynchronous. They run in order on a per-session
//! worker task and report back tagged with the session's `CallId`. A result
//! is committed only if that `CallId` is still current and the state still
//! expects it; anything else is dropped. Hangup does not cancel in-flight
//! operations, it just makes their results inert.

use crate::media::{LocalTrack, MediaController, MediaError};
use crate::monitor::{ConnectionMonitor, MonitorSignal};
use crate::peer::{PeerTransport, PeerTransportError, PeerTransportFactory};
use crate::signaling::{SignalingChannel, SignalingError, SignalingMessage, SignalingTransport};
use crate::types::{
    CallEvent, CallId, CallState, ConnectionState, EndReason, IceCandidate, Role,
    SessionDescription,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Call errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Capture device missing or denied
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// Signaling send attempted while the relay is disconnected
    #[error("Signaling channel is not open")]
    ChannelNotOpen,

    /// A session description could not be generated or applied
    #[error("Negotiation rejected: {0}")]
    NegotiationRejected(String),

    /// Message that does not fit the protocol or the current state
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Transport reported a call-ending state
    #[error("Terminal connection state: {0}")]
    TerminalConnectionState(String),

    /// A call is already in progress
    #[error("A call is already in progress")]
    AlreadyInCall,

    /// Controller has not been started or has shut down
    #[error("Call controller is not running")]
    NotStarted,

    /// Relay transport failure
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::ChannelNotOpen => CallError::ChannelNotOpen,
            SignalingError::ProtocolViolation(msg) => CallError::ProtocolViolation(msg),
            SignalingError::TransportError(msg) => CallError::SignalingError(msg),
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::MediaUnavailable(msg) => CallError::MediaUnavailable(msg),
            MediaError::NoLocalStream => {
                CallError::MediaUnavailable("no local stream acquired".to_string())
            }
        }
    }
}

impl From<PeerTransportError> for CallError {
    fn from(err: PeerTransportError) -> Self {
        CallError::NegotiationRejected(err.to_string())
    }
}

/// Remote candidates that arrived before the remote description was applied
///
/// Drained in receipt order once the description is in place.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a candidate
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Take every buffered candidate, oldest first
    pub fn drain(&mut self) -> impl Iterator<Item = IceCandidate> + '_ {
        self.queue.drain(..)
    }

    /// Drop every buffered candidate
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Number of buffered candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Local request to the session
#[derive(Debug)]
pub(crate) enum Command {
    Call(oneshot::Sender<Result<CallId, CallError>>),
    HangUp(oneshot::Sender<()>),
}

/// Everything the session task consumes, in one ordered queue
#[derive(Debug)]
pub(crate) enum SessionInput {
    Command(Command),
    Inbound(Result<SignalingMessage, SignalingError>),
    RelayClosed,
    Transport { call_id: CallId, signal: MonitorSignal },
    Step { call_id: CallId, outcome: StepOutcome },
    Shutdown,
}

/// Operation for the transport worker
#[derive(Debug)]
enum TransportOp {
    AttachTracks(Vec<LocalTrack>),
    Offer,
    Answer,
    ApplyRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

/// Result of a transport operation
#[derive(Debug)]
pub(crate) enum StepOutcome {
    OfferReady(SessionDescription),
    AnswerReady(SessionDescription),
    RemoteApplied,
    CandidateRejected(PeerTransportError),
    Failed(PeerTransportError),
}

/// Runs transport operations for one session strictly in submission order
struct TransportWorker {
    ops: mpsc::UnboundedSender<TransportOp>,
    closing: Arc<AtomicBool>,
}

impl TransportWorker {
    fn spawn(
        call_id: CallId,
        factory: Arc<dyn PeerTransportFactory>,
        events: mpsc::UnboundedSender<crate::peer::TransportEvent>,
        results: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_worker(
            call_id,
            factory,
            events,
            ops_rx,
            closing.clone(),
            results,
        ));
        Self { ops, closing }
    }

    fn submit(&self, op: TransportOp) {
        let _ = self.ops.send(op);
    }

    /// Skip whatever is still queued, then release the transport session
    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.ops.send(TransportOp::Close);
    }
}

async fn run_worker(
    call_id: CallId,
    factory: Arc<dyn PeerTransportFactory>,
    events: mpsc::UnboundedSender<crate::peer::TransportEvent>,
    mut ops: mpsc::UnboundedReceiver<TransportOp>,
    closing: Arc<AtomicBool>,
    results: mpsc::UnboundedSender<SessionInput>,
) {
    let transport = match factory.create(events).await {
        Ok(transport) => transport,
        Err(e) => {
            tracing::error!(call_id = %call_id, error = %e, "Failed to create transport session");
            let _ = results.send(SessionInput::Step {
                call_id,
                outcome: StepOutcome::Failed(e),
            });
            return;
        }
    };
    tracing::debug!(call_id = %call_id, "Transport session created");

    let mut failed = false;
    while let Some(op) = ops.recv().await {
        if matches!(op, TransportOp::Close) {
            break;
        }
        if failed || closing.load(Ordering::SeqCst) {
            tracing::trace!(call_id = %call_id, op = ?op, "Skipping transport operation");
            continue;
        }

        let outcome = match op {
            TransportOp::AttachTracks(tracks) => attach_tracks(transport.as_ref(), &tracks)
                .await
                .err()
                .map(StepOutcome::Failed),
            TransportOp::Offer => Some(match local_description(transport.as_ref(), Role::Caller).await {
                Ok(desc) => StepOutcome::OfferReady(desc),
                Err(e) => StepOutcome::Failed(e),
            }),
            TransportOp::Answer => Some(match local_description(transport.as_ref(), Role::Callee).await {
                Ok(desc) => StepOutcome::AnswerReady(desc),
                Err(e) => StepOutcome::Failed(e),
            }),
            TransportOp::ApplyRemote(desc) => Some(match transport.set_remote_description(desc).await {
                Ok(()) => StepOutcome::RemoteApplied,
                Err(e) => StepOutcome::Failed(e),
            }),
            TransportOp::AddCandidate(candidate) => transport
                .add_ice_candidate(candidate)
                .await
                .err()
                .map(StepOutcome::CandidateRejected),
            TransportOp::Close => None,
        };

        if let Some(outcome) = outcome {
            failed = matches!(outcome, StepOutcome::Failed(_));
            if results.send(SessionInput::Step { call_id, outcome }).is_err() {
                break;
            }
        }
    }

    transport.detach_tracks().await;
    transport.stop_transceivers().await;
    transport.close().await;
    tracing::debug!(call_id = %call_id, "Transport session released");
}

async fn attach_tracks(
    transport: &dyn PeerTransport,
    tracks: &[LocalTrack],
) -> Result<(), PeerTransportError> {
    for track in tracks {
        transport.add_track(track).await?;
    }
    Ok(())
}

async fn local_description(
    transport: &dyn PeerTransport,
    role: Role,
) -> Result<SessionDescription, PeerTransportError> {
    let desc = match role {
        Role::Caller => transport.create_offer().await?,
        Role::Callee => transport.create_answer().await?,
    };
    transport.set_local_description(desc.clone()).await?;
    Ok(desc)
}

/// The transport session currently owned by the state machine
struct ActiveTransport {
    call_id: CallId,
    worker: TransportWorker,
    monitor: ConnectionMonitor,
    remote_applied: bool,
    local_sent: bool,
    outbound_candidates: Vec<IceCandidate>,
}

/// Negotiation state machine
pub(crate) struct PeerSession<T: SignalingTransport> {
    state: CallState,
    current: Option<ActiveTransport>,
    pending: PendingCandidates,
    channel: Arc<SignalingChannel<T>>,
    media: Arc<MediaController>,
    factory: Arc<dyn PeerTransportFactory>,
    inputs: mpsc::UnboundedSender<SessionInput>,
    state_tx: watch::Sender<CallState>,
    events: broadcast::Sender<CallEvent>,
}

impl<T: SignalingTransport + 'static> PeerSession<T> {
    pub(crate) fn new(
        channel: Arc<SignalingChannel<T>>,
        media: Arc<MediaController>,
        factory: Arc<dyn PeerTransportFactory>,
        inputs: mpsc::UnboundedSender<SessionInput>,
        state_tx: watch::Sender<CallState>,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        Self {
            state: CallState::Idle,
            current: None,
            pending: PendingCandidates::new(),
            channel,
            media,
            factory,
            inputs,
            state_tx,
            events,
        }
    }

    #[cfg(test)]
    fn state(&self) -> CallState {
        self.state
    }

    #[cfg(test)]
    fn current_call(&self) -> Option<CallId> {
        self.current.as_ref().map(|t| t.call_id)
    }

    #[cfg(test)]
    fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Process inputs until shutdown
    pub(crate) async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<SessionInput>) {
        tracing::debug!("Peer session running");
        while let Some(input) = inputs.recv().await {
            match input {
                SessionInput::Command(command) => self.on_command(command).await,
                SessionInput::Inbound(Ok(message)) => self.on_message(message).await,
                SessionInput::Inbound(Err(e)) => {
                    let err = CallError::from(e);
                    tracing::warn!(error = %err, "Discarding inbound signaling frame");
                }
                SessionInput::RelayClosed => {
                    tracing::warn!(state = ?self.state, "Signaling relay closed, no further messages will arrive");
                }
                SessionInput::Transport { call_id, signal } => {
                    self.on_transport_signal(call_id, signal).await;
                }
                SessionInput::Step { call_id, outcome } => self.on_step(call_id, outcome).await,
                SessionInput::Shutdown => {
                    self.teardown(EndReason::LocalHangup, true).await;
                    break;
                }
            }
        }
        tracing::debug!("Peer session stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Call(reply) => {
                let result = self.start_call();
                let _ = reply.send(result);
            }
            Command::HangUp(reply) => {
                self.teardown(EndReason::LocalHangup, true).await;
                let _ = reply.send(());
            }
        }
    }

    /// Idle → Negotiating(Caller)
    #[tracing::instrument(skip(self), fields(state = ?self.state))]
    fn start_call(&mut self) -> Result<CallId, CallError> {
        if self.state != CallState::Idle {
            tracing::warn!("Call requested while a call is in progress");
            return Err(CallError::AlreadyInCall);
        }
        let stream = self.media.local_stream().ok_or(MediaError::NoLocalStream)?;
        if !self.channel.is_open() {
            return Err(CallError::ChannelNotOpen);
        }

        let call_id = self.begin_transport();
        self.submit(TransportOp::AttachTracks(stream.tracks().to_vec()));
        self.submit(TransportOp::Offer);
        self.set_state(CallState::Negotiating(Role::Caller));
        tracing::info!(call_id = %call_id, "Placing call");
        Ok(call_id)
    }

    async fn on_message(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Offer(desc) => self.on_offer(desc),
            SignalingMessage::Answer(desc) => self.on_answer(desc),
            SignalingMessage::IceCandidate(candidate) => self.on_remote_candidate(candidate),
            SignalingMessage::Hangup => {
                if self.state == CallState::Idle {
                    tracing::debug!("Hangup received with no call in progress");
                } else {
                    tracing::info!("Remote peer hung up");
                    self.teardown(EndReason::RemoteHangup, false).await;
                }
            }
        }
    }

    /// Idle → Negotiating(Callee)
    fn on_offer(&mut self, offer: SessionDescription) {
        if self.state != CallState::Idle {
            let err = CallError::ProtocolViolation(format!(
                "offer received in state {:?}",
                self.state
            ));
            tracing::warn!(error = %err, "Rejecting offer, keeping current negotiation");
            return;
        }

        let call_id = self.begin_transport();
        self.submit(TransportOp::ApplyRemote(offer));
        match self.media.local_stream() {
            Some(stream) => self.submit(TransportOp::AttachTracks(stream.tracks().to_vec())),
            None => tracing::warn!(call_id = %call_id, "No local stream, answering receive-only"),
        }
        self.submit(TransportOp::Answer);
        self.set_state(CallState::Negotiating(Role::Callee));
        tracing::info!(call_id = %call_id, "Answering incoming call");
    }

    /// Negotiating(Caller) → Active
    fn on_answer(&mut self, answer: SessionDescription) {
        if self.state != CallState::Negotiating(Role::Caller) {
            let err = CallError::ProtocolViolation(format!(
                "answer received in state {:?}",
                self.state
            ));
            tracing::warn!(error = %err, "Discarding stale answer");
            return;
        }
        self.submit(TransportOp::ApplyRemote(answer));
        self.set_state(CallState::Active);
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(current) = self.current.as_ref() else {
            tracing::debug!("Discarding candidate with no transport session");
            return;
        };
        if current.remote_applied {
            current.worker.submit(TransportOp::AddCandidate(candidate));
        } else {
            self.pending.push(candidate);
            tracing::trace!(buffered = self.pending.len(), "Buffered early candidate");
        }
    }

    async fn on_transport_signal(&mut self, call_id: CallId, signal: MonitorSignal) {
        if !self.is_current(call_id) {
            tracing::trace!(call_id = %call_id, signal = ?signal, "Ignoring signal from released session");
            return;
        }

        match signal {
            MonitorSignal::Terminal(condition) => {
                let reason = CallError::TerminalConnectionState(condition.to_string());
                tracing::info!(call_id = %call_id, %reason, "Call ended by transport");
                self.teardown(EndReason::ConnectionLost, false).await;
            }
            MonitorSignal::Connected => {
                self.publish(CallEvent::ConnectionStateChanged {
                    call_id,
                    state: ConnectionState::Connected,
                });
                if self.state == CallState::Negotiating(Role::Callee) {
                    self.set_state(CallState::Active);
                }
                tracing::info!(call_id = %call_id, "Media connected");
            }
            MonitorSignal::ConnectionState(state) => {
                tracing::debug!(call_id = %call_id, state = ?state, "Connection state changed");
                self.publish(CallEvent::ConnectionStateChanged { call_id, state });
            }
            MonitorSignal::SignalingState(state) => {
                tracing::debug!(call_id = %call_id, state = ?state, "Signaling state changed");
            }
            MonitorSignal::LocalCandidate(candidate) => {
                let Some(current) = self.current.as_mut() else {
                    return;
                };
                if current.local_sent {
                    self.send_candidate(candidate).await;
                } else {
                    current.outbound_candidates.push(candidate);
                }
            }
            MonitorSignal::GatheringComplete => {
                tracing::debug!(call_id = %call_id, "Candidate gathering complete");
            }
            MonitorSignal::RemoteTrack { track_id, kind } => {
                tracing::info!(call_id = %call_id, track_id = %track_id, kind = %kind, "Remote track");
                self.publish(CallEvent::RemoteTrack {
                    call_id,
                    track_id,
                    kind,
                });
            }
        }
    }

    async fn on_step(&mut self, call_id: CallId, outcome: StepOutcome) {
        if !self.is_current(call_id) {
            tracing::debug!(call_id = %call_id, outcome = ?outcome, "Ignoring result for released session");
            return;
        }

        match outcome {
            StepOutcome::OfferReady(offer) => {
                if self.state != CallState::Negotiating(Role::Caller) {
                    tracing::debug!(state = ?self.state, "Offer no longer needed");
                    return;
                }
                self.send_local_description(SignalingMessage::Offer(offer))
                    .await;
            }
            StepOutcome::AnswerReady(answer) => {
                if self.state != CallState::Negotiating(Role::Callee) {
                    tracing::debug!(state = ?self.state, "Answer no longer needed");
                    return;
                }
                self.send_local_description(SignalingMessage::Answer(answer))
                    .await;
            }
            StepOutcome::RemoteApplied => {
                let Some(current) = self.current.as_mut() else {
                    return;
                };
                current.remote_applied = true;
                let flushed = self.pending.len();
                for candidate in self.pending.drain() {
                    current.worker.submit(TransportOp::AddCandidate(candidate));
                }
                tracing::debug!(call_id = %call_id, flushed, "Remote description applied");
            }
            StepOutcome::CandidateRejected(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Remote candidate rejected");
            }
            StepOutcome::Failed(e) => {
                let err = CallError::from(e);
                tracing::error!(call_id = %call_id, error = %err, "Negotiation failed");
                self.publish(CallEvent::Error {
                    message: err.to_string(),
                });
                self.teardown(EndReason::NegotiationFailed, false).await;
            }
        }
    }

    async fn send_local_description(&mut self, message: SignalingMessage) {
        if let Err(e) = self.channel.send(message).await {
            let err = CallError::from(e);
            tracing::error!(error = %err, "Failed to send session description");
            self.publish(CallEvent::Error {
                message: err.to_string(),
            });
            self.teardown(EndReason::SignalingFailed, false).await;
            return;
        }

        let Some(current) = self.current.as_mut() else {
            return;
        };
        current.local_sent = true;
        let queued = std::mem::take(&mut current.outbound_candidates);
        for candidate in queued {
            self.send_candidate(candidate).await;
        }
    }

    async fn send_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self
            .channel
            .send(SignalingMessage::IceCandidate(candidate))
            .await
        {
            tracing::warn!(error = %e, "Failed to send local candidate");
            self.publish(CallEvent::Error {
                message: e.to_string(),
            });
        }
    }

    /// Any state → Closing → Idle
    ///
    /// A no-op when there is nothing to tear down.
    async fn teardown(&mut self, reason: EndReason, notify_peer: bool) {
        if matches!(self.state, CallState::Idle | CallState::Closing) {
            tracing::debug!(state = ?self.state, reason = ?reason, "Nothing to tear down");
            return;
        }
        self.set_state(CallState::Closing);

        if notify_peer {
            if let Err(e) = self.channel.send(SignalingMessage::Hangup).await {
                tracing::warn!(error = %e, "Failed to notify peer of hangup");
                self.publish(CallEvent::Error {
                    message: e.to_string(),
                });
            }
        }

        if let Some(current) = self.current.take() {
            current.monitor.stop();
            current.worker.close();
            tracing::info!(
                call_id = %current.call_id,
                reason = ?reason,
                dropped_candidates = self.pending.len(),
                "Call torn down"
            );
            self.publish(CallEvent::CallEnded {
                call_id: current.call_id,
                reason,
            });
        }
        self.pending.clear();
        self.set_state(CallState::Idle);
    }

    fn begin_transport(&mut self) -> CallId {
        let call_id = CallId::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inputs = self.inputs.clone();
        let monitor = ConnectionMonitor::spawn(call_id, events_rx, move |call_id, signal| {
            inputs
                .send(SessionInput::Transport { call_id, signal })
                .is_ok()
        });
        let worker =
            TransportWorker::spawn(call_id, self.factory.clone(), events_tx, self.inputs.clone());

        self.pending.clear();
        self.current = Some(ActiveTransport {
            call_id,
            worker,
            monitor,
            remote_applied: false,
            local_sent: false,
            outbound_candidates: Vec::new(),
        });
        call_id
    }

    fn submit(&self, op: TransportOp) {
        if let Some(current) = self.current.as_ref() {
            current.worker.submit(op);
        }
    }

    fn is_current(&self, call_id: CallId) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| current.call_id == call_id)
    }

    fn set_state(&mut self, to: CallState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::debug!(from = ?from, to = ?to, "Call state transition");
        self.state_tx.send_replace(to);
        self.publish(CallEvent::StateChanged { from, to });
    }

    fn publish(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

/// Forward inbound signaling into the session queue, preserving order
pub(crate) async fn pump_inbound<T: SignalingTransport>(
    channel: Arc<SignalingChannel<T>>,
    inputs: mpsc::UnboundedSender<SessionInput>,
) {
    loop {
        let input = match channel.receive().await {
            Ok(Some(message)) => SessionInput::Inbound(Ok(message)),
            Ok(None) => {
                let _ = inputs.send(SessionInput::RelayClosed);
                break;
            }
            Err(e @ SignalingError::ProtocolViolation(_)) => SessionInput::Inbound(Err(e)),
            Err(e) => {
                tracing::warn!(error = %e, "Signaling receive failed");
                let _ = inputs.send(SessionInput::RelayClosed);
                break;
            }
        };
        if inputs.send(input).is_err() {
            break;
        }
    }
}
