//! Connection monitoring
//!
//! Watches the events of one transport session and reduces them to what the
//! negotiation state machine cares about. `Closed`, `Failed` and
//! `Disconnected` connection states and the `Closed` signaling state are all
//! the same thing to the session: a `TerminalCondition` that ends the call.

use crate::peer::TransportEvent;
use crate::types::{CallId, ConnectionState, IceCandidate, MediaType, SignalingState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Transport state that ends the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCondition {
    /// Terminal connection state
    Connection(ConnectionState),
    /// Signaling closed
    Signaling(SignalingState),
}

impl std::fmt::Display for TerminalCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(state) => write!(f, "connection {:?}", state),
            Self::Signaling(state) => write!(f, "signaling {:?}", state),
        }
    }
}

/// What the session should do about a transport event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorSignal {
    /// Tear the call down
    Terminal(TerminalCondition),
    /// Media path is up
    Connected,
    /// Informational connection state change
    ConnectionState(ConnectionState),
    /// Informational signaling state change
    SignalingState(SignalingState),
    /// Candidate to forward to the remote peer
    LocalCandidate(IceCandidate),
    /// Local gathering finished
    GatheringComplete,
    /// Remote track appeared
    RemoteTrack {
        /// Remote track id
        track_id: String,
        /// Track kind
        kind: MediaType,
    },
}

/// Map a connection state to a terminal condition, if it is one
#[must_use]
pub fn terminal_connection_state(state: ConnectionState) -> Option<TerminalCondition> {
    match state {
        ConnectionState::Closed | ConnectionState::Failed | ConnectionState::Disconnected => {
            Some(TerminalCondition::Connection(state))
        }
        ConnectionState::New | ConnectionState::Connecting | ConnectionState::Connected => None,
    }
}

/// Map a signaling state to a terminal condition, if it is one
#[must_use]
pub fn terminal_signaling_state(state: SignalingState) -> Option<TerminalCondition> {
    match state {
        SignalingState::Closed => Some(TerminalCondition::Signaling(state)),
        _ => None,
    }
}

/// Classify one transport event
#[must_use]
pub fn classify(event: TransportEvent) -> MonitorSignal {
    match event {
        TransportEvent::ConnectionState(state) => match terminal_connection_state(state) {
            Some(condition) => MonitorSignal::Terminal(condition),
            None if state == ConnectionState::Connected => MonitorSignal::Connected,
            None => MonitorSignal::ConnectionState(state),
        },
        TransportEvent::SignalingState(state) => match terminal_signaling_state(state) {
            Some(condition) => MonitorSignal::Terminal(condition),
            None => MonitorSignal::SignalingState(state),
        },
        TransportEvent::LocalCandidate(Some(candidate)) => MonitorSignal::LocalCandidate(candidate),
        TransportEvent::LocalCandidate(None) => MonitorSignal::GatheringComplete,
        TransportEvent::RemoteTrack { track_id, kind } => {
            MonitorSignal::RemoteTrack { track_id, kind }
        }
    }
}

/// Observer for one transport session
///
/// Runs until the session's event sender is dropped or the receiving side of
/// `signals` goes away. Every signal is tagged with the session's `CallId` so
/// the receiver can ignore signals from sessions it has already released.
pub struct ConnectionMonitor {
    call_id: CallId,
    task: JoinHandle<()>,
}

impl ConnectionMonitor {
    /// Start observing `events`
    pub fn spawn<F>(
        call_id: CallId,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut forward: F,
    ) -> Self
    where
        F: FnMut(CallId, MonitorSignal) -> bool + Send + 'static,
    {
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let signal = classify(event);
                tracing::trace!(call_id = %call_id, signal = ?signal, "Transport event");
                if !forward(call_id, signal) {
                    break;
                }
            }
            tracing::debug!(call_id = %call_id, "Connection monitor stopped");
        });
        Self { call_id, task }
    }

    /// Session this monitor observes
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Stop observing
    pub fn stop(&self) {
        self.task.abort();
    }
}
