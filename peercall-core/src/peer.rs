//! Media transport capability
//!
//! A `PeerTransport` is one negotiated peer-media session (what a browser
//! calls a peer connection). SDP generation, candidate gathering and
//! connectivity checks happen behind this trait; the negotiation state
//! machine only drives it and listens to its events.

use crate::media::LocalTrack;
use crate::types::{ConnectionState, IceCandidate, MediaType, SessionDescription, SignalingState};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Media transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerTransportError {
    /// Session could not be created
    #[error("Failed to create transport session: {0}")]
    CreateFailed(String),

    /// Description is malformed or was refused
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// Offer or answer generation failed
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Candidate refused
    #[error("Failed to add ICE candidate: {0}")]
    CandidateFailed(String),

    /// Track could not be attached
    #[error("Failed to attach track: {0}")]
    TrackFailed(String),
}

/// Notifications emitted by a transport session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Locally gathered candidate; `None` marks the end of gathering
    LocalCandidate(Option<IceCandidate>),
    /// Connection state changed
    ConnectionState(ConnectionState),
    /// Signaling state changed
    SignalingState(SignalingState),
    /// Remote peer added a track
    RemoteTrack {
        /// Remote track id
        track_id: String,
        /// Track kind
        kind: MediaType,
    },
}

/// One peer-media session
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local track for sending
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerTransportError>;

    /// Generate an offer
    async fn create_offer(&self) -> Result<SessionDescription, PeerTransportError>;

    /// Generate an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerTransportError>;

    /// Apply a local description
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerTransportError>;

    /// Apply a remote description
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerTransportError>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerTransportError>;

    /// Detach every local track
    async fn detach_tracks(&self);

    /// Stop every transceiver
    async fn stop_transceivers(&self);

    /// Close the session
    async fn close(&self);
}

/// Creates transport sessions
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a fresh session that reports its events on `events`
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerTransportError>;
}
