//! Call types and data structures

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a transport session
///
/// A fresh id is minted for every call attempt and is never reused, so it
/// doubles as the identity that asynchronous negotiation steps are checked
/// against before their results are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media constraints used when acquiring local capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture audio
    pub audio: bool,
    /// Capture video
    pub video: bool,
    /// Requested video width in pixels
    pub width: u32,
    /// Requested video height in pixels
    pub height: u32,
}

impl MediaConstraints {
    /// Audio-only capture
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            width: 0,
            height: 0,
        }
    }

    /// Video capture with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
            width: 500,
            height: 500,
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }

    /// Convert to media types
    pub fn to_media_types(&self) -> Vec<MediaType> {
        let mut types = Vec::new();
        if self.audio {
            types.push(MediaType::Audio);
        }
        if self.video {
            types.push(MediaType::Video);
        }
        types
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Types of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Audio stream
    Audio,
    /// Video stream
    Video,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer from the caller
    Offer,
    /// Answer from the callee
    Answer,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description kind
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate descriptor
///
/// Field names on the wire follow the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the candidate line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Which side of the offer/answer exchange this peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Sent the offer
    Caller,
    /// Received the offer
    Callee,
}

/// Call state enumeration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No call
    #[default]
    Idle,
    /// Offer/answer exchange in progress
    Negotiating(Role),
    /// Call is up
    Active,
    /// Teardown in progress
    Closing,
}

impl CallState {
    /// Whether a call exists in any form
    pub fn is_in_call(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Transport connection state reported by the media transport capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Freshly created
    New,
    /// Connectivity checks running
    Connecting,
    /// Media path established
    Connected,
    /// Connectivity lost
    Disconnected,
    /// Connectivity checks failed
    Failed,
    /// Transport closed
    Closed,
}

/// Offer/answer signaling state reported by the media transport capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    /// Local offer applied
    HaveLocalOffer,
    /// Remote offer applied
    HaveRemoteOffer,
    /// Local provisional answer applied
    HaveLocalPranswer,
    /// Remote provisional answer applied
    HaveRemotePranswer,
    /// Transport closed
    Closed,
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Remote peer sent a hangup
    RemoteHangup,
    /// Transport reported a terminal state
    ConnectionLost,
    /// A description could not be applied or generated
    NegotiationFailed,
    /// The signaling relay refused an outbound message
    SignalingFailed,
}

/// Call events for the presentation layer
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Call state changed
    StateChanged {
        /// Previous state
        from: CallState,
        /// New state
        to: CallState,
    },
    /// Transport connection state changed
    ConnectionStateChanged {
        /// Call identifier
        call_id: CallId,
        /// Reported state
        state: ConnectionState,
    },
    /// Remote peer added a track
    RemoteTrack {
        /// Call identifier
        call_id: CallId,
        /// Remote track id
        track_id: String,
        /// Track kind
        kind: MediaType,
    },
    /// Call ended
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why it ended
        reason: EndReason,
    },
    /// A non-fatal error occurred
    Error {
        /// Error description
        message: String,
    },
}
