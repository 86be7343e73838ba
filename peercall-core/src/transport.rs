//! Relay transport implementations
//!
//! This module provides the transports that carry signaling frames to and
//! from the relay.

use crate::signaling::{SignalingError, SignalingTransport};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;

/// Relay address used when none is configured
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8000/ws";

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// WebSocket URL of the signaling relay
    pub relay_url: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
        }
    }
}

/// WebSocket relay transport
///
/// Keeps one long-lived connection to the relay. A writer task drains
/// outbound frames into the socket and a reader task forwards inbound text
/// frames, so `receive_text` yields them in the order the relay sent them.
pub struct WebSocketTransport {
    config: TransportConfig,
    open: Arc<AtomicBool>,
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl WebSocketTransport {
    /// Create new WebSocket transport
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            open: Arc::new(AtomicBool::new(false)),
            outbound: parking_lot::Mutex::new(None),
            inbound: Mutex::new(None),
        }
    }

    /// Get transport configuration
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    #[tracing::instrument(skip(self), fields(relay = %self.config.relay_url))]
    async fn connect(&self) -> Result<(), SignalingError> {
        if self.open.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.config.relay_url.as_str())
            .await
            .map_err(|e| {
                SignalingError::TransportError(format!("Failed to connect to relay: {}", e))
            })?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        let open = self.open.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = ws_sender.send(msg).await {
                    tracing::warn!(error = %e, "Relay write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            open.store(false, Ordering::SeqCst);
        });

        let open = self.open.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Relay read failed");
                        break;
                    }
                }
            }
            open.store(false, Ordering::SeqCst);
        });

        *self.outbound.lock() = Some(out_tx);
        *self.inbound.lock().await = Some(in_rx);
        self.open.store(true, Ordering::SeqCst);
        tracing::info!("Connected to relay");
        Ok(())
    }

    async fn send_text(&self, frame: String) -> Result<(), SignalingError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SignalingError::ChannelNotOpen);
        }
        let outbound = self.outbound.lock();
        let sender = outbound.as_ref().ok_or(SignalingError::ChannelNotOpen)?;
        sender
            .send(Message::Text(frame))
            .map_err(|_| SignalingError::ChannelNotOpen)
    }

    async fn receive_text(&self) -> Result<Option<String>, SignalingError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.as_mut() {
            Some(rx) => Ok(rx.recv().await),
            None => Ok(None),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        let sender = self.outbound.lock().take();
        if let Some(sender) = sender {
            let _ = sender.send(Message::Close(None));
            tracing::info!("Disconnected from relay");
        }
        self.open.store(false, Ordering::SeqCst);
    }
}

/// In-process relay transport
///
/// Two linked endpoints; frames sent on one are received by the other in
/// order. Used for tests and loopback calls inside one process.
pub struct MemoryTransport {
    open: AtomicBool,
    peer: mpsc::UnboundedSender<String>,
    inbox: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl MemoryTransport {
    /// Create a linked pair of transports
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                open: AtomicBool::new(false),
                peer: b_tx,
                inbox: Mutex::new(a_rx),
            },
            Self {
                open: AtomicBool::new(false),
                peer: a_tx,
                inbox: Mutex::new(b_rx),
            },
        )
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn connect(&self) -> Result<(), SignalingError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_text(&self, frame: String) -> Result<(), SignalingError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SignalingError::ChannelNotOpen);
        }
        self.peer
            .send(frame)
            .map_err(|_| SignalingError::TransportError("peer endpoint dropped".to_string()))
    }

    async fn receive_text(&self) -> Result<Option<String>, SignalingError> {
        if !self.open.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.inbox.lock().await.recv().await)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
