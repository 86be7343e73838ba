//! Signaling protocol
//!
//! Carries session descriptions, ICE candidates and hangups between the two
//! peers through a relay. The relay only ever sees opaque JSON text frames of
//! the shape `{"type": "...", "data": ...}`.

use crate::types::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Largest accepted signaling frame (64KB)
pub const MAX_SIGNALING_MESSAGE_SIZE: usize = 64 * 1024;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Send attempted while the relay connection is not open
    #[error("Signaling channel is not open")]
    ChannelNotOpen,

    /// Frame could not be interpreted as a signaling message
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Raw relay transport
///
/// Implement this for the relay connection in use (WebSocket, in-memory, ...).
/// Frames must be delivered reliably and in order. Reconnection is left to the
/// caller.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open the relay connection
    async fn connect(&self) -> Result<(), SignalingError>;

    /// Send a text frame
    async fn send_text(&self, frame: String) -> Result<(), SignalingError>;

    /// Wait for the next inbound text frame
    ///
    /// Returns `Ok(None)` once the relay connection has closed.
    async fn receive_text(&self) -> Result<Option<String>, SignalingError>;

    /// Whether the connection is currently open
    fn is_open(&self) -> bool;

    /// Close the relay connection. Calling this more than once is harmless.
    async fn disconnect(&self);
}

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireMessage", try_from = "WireMessage")]
pub enum SignalingMessage {
    /// SDP offer
    Offer(SessionDescription),
    /// SDP answer
    Answer(SessionDescription),
    /// ICE candidate
    IceCandidate(IceCandidate),
    /// End the call
    Hangup,
}

impl SignalingMessage {
    /// Wire tag for this message
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice_candidate",
            Self::Hangup => "hangup",
        }
    }

    /// Encode to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::ProtocolViolation(e.to_string()))
    }

    /// Decode a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` for malformed JSON, unknown message types
    /// and payloads that do not match their type.
    pub fn from_json(frame: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(frame).map_err(|e| SignalingError::ProtocolViolation(e.to_string()))
    }
}

/// On-the-wire envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl From<SignalingMessage> for WireMessage {
    fn from(message: SignalingMessage) -> Self {
        let kind = message.message_type().to_string();
        let data = match message {
            SignalingMessage::Offer(desc) | SignalingMessage::Answer(desc) => {
                serde_json::to_value(desc).unwrap_or_default()
            }
            SignalingMessage::IceCandidate(candidate) => {
                serde_json::to_value(candidate).unwrap_or_default()
            }
            SignalingMessage::Hangup => serde_json::Value::String(String::new()),
        };
        Self { kind, data }
    }
}

impl TryFrom<WireMessage> for SignalingMessage {
    type Error = SignalingError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        fn payload<P: for<'de> Deserialize<'de>>(
            kind: &str,
            data: serde_json::Value,
        ) -> Result<P, SignalingError> {
            serde_json::from_value(data)
                .map_err(|e| SignalingError::ProtocolViolation(format!("bad {kind} payload: {e}")))
        }

        match wire.kind.as_str() {
            "offer" => {
                let desc: SessionDescription = payload("offer", wire.data)?;
                if desc.sdp_type != SdpType::Offer {
                    return Err(SignalingError::ProtocolViolation(
                        "offer message carries a non-offer description".to_string(),
                    ));
                }
                Ok(Self::Offer(desc))
            }
            "answer" => {
                let desc: SessionDescription = payload("answer", wire.data)?;
                if desc.sdp_type != SdpType::Answer {
                    return Err(SignalingError::ProtocolViolation(
                        "answer message carries a non-answer description".to_string(),
                    ));
                }
                Ok(Self::Answer(desc))
            }
            "ice_candidate" => Ok(Self::IceCandidate(payload("ice_candidate", wire.data)?)),
            "hangup" => Ok(Self::Hangup),
            other => Err(SignalingError::ProtocolViolation(format!(
                "unknown message type: {other:?}"
            ))),
        }
    }
}

/// Typed signaling channel over a relay transport
///
/// Encodes outbound messages, decodes inbound frames and refuses to send
/// while the relay is down. Inbound messages are meant for a single consumer
/// and come out in receipt order.
pub struct SignalingChannel<T: SignalingTransport> {
    transport: Arc<T>,
}

impl<T: SignalingTransport> SignalingChannel<T> {
    /// Create new signaling channel
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Open the relay connection
    ///
    /// # Errors
    ///
    /// Returns error if the relay cannot be reached
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), SignalingError> {
        self.transport.connect().await?;
        tracing::info!("Signaling channel connected");
        Ok(())
    }

    /// Send a signaling message
    ///
    /// # Errors
    ///
    /// Returns `ChannelNotOpen` if the relay is not connected. Nothing is
    /// queued for later delivery.
    #[tracing::instrument(skip(self, message), fields(message_type = message.message_type()))]
    pub async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        if !self.transport.is_open() {
            tracing::warn!("Signaling channel is not open");
            return Err(SignalingError::ChannelNotOpen);
        }
        let frame = message.to_json()?;
        tracing::debug!(bytes = frame.len(), "Sending signaling message");
        self.transport.send_text(frame).await
    }

    /// Receive the next signaling message
    ///
    /// Returns `Ok(None)` once the relay has closed. A frame that cannot be
    /// decoded yields `ProtocolViolation`; the next call continues with the
    /// following frame.
    ///
    /// # Errors
    ///
    /// Returns error if the frame is invalid or the transport fails
    pub async fn receive(&self) -> Result<Option<SignalingMessage>, SignalingError> {
        let Some(frame) = self.transport.receive_text().await? else {
            tracing::info!("Signaling relay closed");
            return Ok(None);
        };

        if frame.len() > MAX_SIGNALING_MESSAGE_SIZE {
            tracing::warn!(bytes = frame.len(), "Oversized signaling frame rejected");
            return Err(SignalingError::ProtocolViolation(format!(
                "frame of {} bytes exceeds limit",
                frame.len()
            )));
        }

        match SignalingMessage::from_json(&frame) {
            Ok(message) => {
                tracing::debug!(message_type = message.message_type(), "Received signaling message");
                Ok(Some(message))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding undecodable signaling frame");
                Err(e)
            }
        }
    }

    /// Whether the relay connection is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Close the relay connection
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}
