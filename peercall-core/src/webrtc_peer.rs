//! `PeerTransport` backed by the webrtc crate
//!
//! Each session is one `RTCPeerConnection` configured with the STUN servers
//! from the call configuration. Connection, signaling, candidate and track
//! callbacks are forwarded as `TransportEvent`s.

use crate::media::LocalTrack;
use crate::peer::{PeerTransport, PeerTransportError, PeerTransportFactory, TransportEvent};
use crate::types::{
    ConnectionState, IceCandidate, MediaType, SdpType, SessionDescription, SignalingState,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Factory for webrtc-backed sessions
///
/// Local tracks are negotiated as opus/VP8 `TrackLocalStaticSample`s, but no
/// samples are written to them and `LocalTrack::is_enabled` is not consulted.
/// `pause_local_video` therefore only changes local state; it does not mute
/// what the remote side receives.
pub struct WebRtcPeerFactory {
    ice_servers: Vec<String>,
}

impl WebRtcPeerFactory {
    /// Create a factory using the given STUN/TURN URLs
    #[must_use]
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerTransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerTransportError::CreateFailed(format!("codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerTransportError::CreateFailed(format!("interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| PeerTransportError::CreateFailed(e.to_string()))?;
        let pc = Arc::new(pc);
        wire_callbacks(&pc, events);

        tracing::debug!("Created peer connection");
        Ok(Arc::new(WebRtcPeerTransport { pc }))
    }
}

fn wire_callbacks(pc: &RTCPeerConnection, events: mpsc::UnboundedSender<TransportEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let event = match candidate {
            Some(c) => match c.to_json() {
                Ok(init) => TransportEvent::LocalCandidate(Some(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping unserializable local candidate");
                    return Box::pin(async {});
                }
            },
            None => TransportEvent::LocalCandidate(None),
        };
        let _ = tx.send(event);
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let mapped = match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        };
        let _ = tx.send(TransportEvent::ConnectionState(mapped));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let mapped = match state {
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
        };
        let _ = tx.send(TransportEvent::SignalingState(mapped));
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(MediaType::Audio),
                RTPCodecType::Video => Some(MediaType::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                let _ = tx.send(TransportEvent::RemoteTrack {
                    track_id: track.id(),
                    kind,
                });
            }
            Box::pin(async {})
        },
    ));
}

/// Session over one `RTCPeerConnection`
pub struct WebRtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeerTransport {
    fn codec_for(kind: MediaType) -> RTCRtpCodecCapability {
        match kind {
            MediaType::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
            MediaType::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
        }
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerTransportError> {
        let result = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        };
        result.map_err(|e| PeerTransportError::InvalidDescription(e.to_string()))
    }

    fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, PeerTransportError> {
        match description.sdp_type {
            RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
            RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
            other => Err(PeerTransportError::NegotiationFailed(format!(
                "unexpected description type {other}"
            ))),
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerTransportError> {
        let local = Arc::new(TrackLocalStaticSample::new(
            Self::codec_for(track.kind()),
            track.id().to_string(),
            track.kind().to_string(),
        ));
        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PeerTransportError::TrackFailed(e.to_string()))?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerTransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerTransportError::NegotiationFailed(e.to_string()))?;
        Self::from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerTransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerTransportError::NegotiationFailed(e.to_string()))?;
        Self::from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerTransportError> {
        self.pc
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(|e| PeerTransportError::InvalidDescription(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerTransportError> {
        self.pc
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(|e| PeerTransportError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerTransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerTransportError::CandidateFailed(e.to_string()))
    }

    async fn detach_tracks(&self) {
        for sender in self.pc.get_senders().await {
            if let Err(e) = self.pc.remove_track(&sender).await {
                tracing::debug!(error = %e, "Failed to detach track");
            }
        }
    }

    async fn stop_transceivers(&self) {
        for transceiver in self.pc.get_transceivers().await {
            if let Err(e) = transceiver.stop().await {
                tracing::debug!(error = %e, "Failed to stop transceiver");
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "Failed to close peer connection");
        }
    }
}
