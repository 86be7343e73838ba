//! PeerCall - two-party call negotiation over a signaling relay
//!
//! This library drives one side of a browser-style audio/video call. Two
//! parties exchange offers, answers and ICE candidates through a WebSocket
//! relay that forwards every message to the other party, then media flows
//! over a peer transport negotiated from those messages. It features:
//!
//! - **Single-owner state machine**: every transition happens on one task,
//!   fed by one ordered input queue
//! - **Early candidate buffering**: remote candidates are held until the
//!   remote description is applied, then applied in receipt order
//! - **Stale-result protection**: work finishing after a hangup is discarded
//! - **Pluggable transports**: relay, media transport and capture device are
//!   all traits
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::{CallController, TransportConfig, WebSocketTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), peercall_core::CallError> {
//! let transport = Arc::new(WebSocketTransport::new(TransportConfig::default()));
//! let controller = CallController::builder(transport).build()?;
//!
//! controller.start().await?;
//! let call_id = controller.call().await?;
//! println!("calling: {call_id}");
//!
//! controller.hang_up().await?;
//! controller.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core types shared by every module
pub mod types;

/// Call configuration
pub mod config;

/// Signaling protocol and channel
pub mod signaling;

/// Relay transports
pub mod transport;

/// Local media capture
pub mod media;

/// Media transport capability
pub mod peer;

/// Media transport backed by the webrtc crate (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_peer;

/// Transport session observation
pub mod monitor;

/// Negotiation state machine
pub mod session;

/// Public call API
pub mod controller;

// Re-export main types at crate root
pub use config::{PeerCallConfig, DEFAULT_STUN_SERVER};
pub use controller::{CallController, CallControllerBuilder};
pub use media::{CaptureDevice, LocalStream, LocalTrack, MediaController, MediaError, MediaEvent, SyntheticCapture};
pub use monitor::{ConnectionMonitor, MonitorSignal, TerminalCondition};
pub use peer::{PeerTransport, PeerTransportError, PeerTransportFactory, TransportEvent};
pub use session::{CallError, PendingCandidates};
pub use signaling::{
    SignalingChannel, SignalingError, SignalingMessage, SignalingTransport,
    MAX_SIGNALING_MESSAGE_SIZE,
};
pub use transport::{MemoryTransport, TransportConfig, WebSocketTransport, DEFAULT_RELAY_URL};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_peer::{WebRtcPeerFactory, WebRtcPeerTransport};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::PeerCallConfig;
    pub use crate::controller::{CallController, CallControllerBuilder};
    pub use crate::media::{CaptureDevice, MediaController, SyntheticCapture};
    pub use crate::peer::{PeerTransport, PeerTransportFactory};
    pub use crate::session::CallError;
    pub use crate::signaling::{SignalingChannel, SignalingMessage, SignalingTransport};
    pub use crate::transport::{MemoryTransport, TransportConfig, WebSocketTransport};
    pub use crate::types::{
        CallEvent, CallId, CallState, EndReason, IceCandidate, MediaConstraints, MediaType, Role,
        SessionDescription,
    };
}
