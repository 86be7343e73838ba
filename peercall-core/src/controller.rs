//! Call controller
//!
//! Public entry point. Owns the signaling channel, local media and the
//! session task, and exposes `call`, `hang_up` and video toggles.

use crate::config::PeerCallConfig;
use crate::media::{CaptureDevice, MediaController, SyntheticCapture};
use crate::peer::PeerTransportFactory;
use crate::session::{pump_inbound, CallError, Command, PeerSession, SessionInput};
use crate::signaling::{SignalingChannel, SignalingTransport};
use crate::types::{CallEvent, CallId, CallState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

type PendingSession<T> = (PeerSession<T>, mpsc::UnboundedReceiver<SessionInput>);

/// Drives one user's side of a two-party call
pub struct CallController<T: SignalingTransport + 'static> {
    config: PeerCallConfig,
    channel: Arc<SignalingChannel<T>>,
    media: Arc<MediaController>,
    inputs: mpsc::UnboundedSender<SessionInput>,
    session: parking_lot::Mutex<Option<PendingSession<T>>>,
    state_rx: watch::Receiver<CallState>,
    event_sender: broadcast::Sender<CallEvent>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<T: SignalingTransport + 'static> CallController<T> {
    /// Create a controller
    ///
    /// Nothing is connected until [`CallController::start`].
    #[must_use]
    pub fn new(
        config: PeerCallConfig,
        transport: Arc<T>,
        factory: Arc<dyn PeerTransportFactory>,
        capture: Arc<dyn CaptureDevice>,
    ) -> Self {
        let channel = Arc::new(SignalingChannel::new(transport));
        let media = Arc::new(MediaController::new(capture));
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (event_sender, _) = broadcast::channel(config.event_capacity.max(1));

        let session = PeerSession::new(
            channel.clone(),
            media.clone(),
            factory,
            inputs.clone(),
            state_tx,
            event_sender.clone(),
        );

        Self {
            config,
            channel,
            media,
            inputs,
            session: parking_lot::Mutex::new(Some((session, inputs_rx))),
            state_rx,
            event_sender,
            tasks: parking_lot::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Create a builder
    #[must_use]
    pub fn builder(transport: Arc<T>) -> CallControllerBuilder<T> {
        CallControllerBuilder::new(transport)
    }

    /// Connect to the relay, acquire local media and start processing
    ///
    /// A capture failure is logged and the controller still starts, so that
    /// incoming calls can be answered receive-only. Calling `start` again is a
    /// no-op. A controller cannot be restarted after `shutdown`.
    ///
    /// # Errors
    ///
    /// - `NotStarted` after `shutdown`, without touching the relay
    /// - relay errors if the connection cannot be opened
    #[tracing::instrument(skip(self), fields(relay = ?self.config.transport.relay_url))]
    pub async fn start(&self) -> Result<(), CallError> {
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.session.lock().is_none() {
            return Err(CallError::NotStarted);
        }
        tracing::info!("Starting call controller");

        self.channel.connect().await?;

        match self.media.acquire(&self.config.media).await {
            Ok(_) => {
                if self.config.start_video_paused && self.config.media.has_video() {
                    self.media.disable_video()?;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Continuing without local media");
            }
        }

        let Some((session, inputs_rx)) = self.session.lock().take() else {
            return Err(CallError::NotStarted);
        };
        let session_task = tokio::spawn(session.run(inputs_rx));
        let pump_task = tokio::spawn(pump_inbound(self.channel.clone(), self.inputs.clone()));
        self.tasks.lock().extend([session_task, pump_task]);
        self.started.store(true, Ordering::SeqCst);

        tracing::info!("Call controller started");
        Ok(())
    }

    /// Place a call to whoever else is on the relay
    ///
    /// Returns once the transport session exists and the offer is being
    /// prepared; the OFFER goes out asynchronously.
    ///
    /// # Errors
    ///
    /// - `AlreadyInCall` unless idle
    /// - `MediaUnavailable` without a local stream
    /// - `ChannelNotOpen` if the relay is disconnected
    #[tracing::instrument(skip(self))]
    pub async fn call(&self) -> Result<CallId, CallError> {
        self.ensure_started()?;
        let (reply, response) = oneshot::channel();
        self.inputs
            .send(SessionInput::Command(Command::Call(reply)))
            .map_err(|_| CallError::NotStarted)?;
        let call_id = response.await.map_err(|_| CallError::NotStarted)??;
        tracing::info!(call_id = %call_id, "Call initiated");
        Ok(call_id)
    }

    /// End the current call, notifying the peer
    ///
    /// Safe to call at any time; with no call in progress it does nothing.
    ///
    /// # Errors
    ///
    /// Returns `NotStarted` if the controller is not running
    #[tracing::instrument(skip(self))]
    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.ensure_started()?;
        let (reply, done) = oneshot::channel();
        self.inputs
            .send(SessionInput::Command(Command::HangUp(reply)))
            .map_err(|_| CallError::NotStarted)?;
        done.await.map_err(|_| CallError::NotStarted)
    }

    /// Enable local video
    ///
    /// # Errors
    ///
    /// Returns `MediaUnavailable` if no local stream was acquired
    pub fn start_local_video(&self) -> Result<(), CallError> {
        self.media.enable_video().map_err(CallError::from)
    }

    /// Disable local video without touching the call
    ///
    /// # Errors
    ///
    /// Returns `MediaUnavailable` if no local stream was acquired
    pub fn pause_local_video(&self) -> Result<(), CallError> {
        self.media.disable_video().map_err(CallError::from)
    }

    /// Whether a call is being negotiated or is active
    #[must_use]
    pub fn in_call(&self) -> bool {
        self.state().is_in_call()
    }

    /// Whether local video is enabled
    #[must_use]
    pub fn local_video_active(&self) -> bool {
        self.media.is_video_active()
    }

    /// Current call state
    #[must_use]
    pub fn state(&self) -> CallState {
        *self.state_rx.borrow()
    }

    /// Watch call state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state_rx.clone()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    /// Local media
    #[must_use]
    pub fn media(&self) -> &Arc<MediaController> {
        &self.media
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &PeerCallConfig {
        &self.config
    }

    /// Hang up any call, stop processing and disconnect from the relay
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down call controller");

        let _ = self.inputs.send(SessionInput::Shutdown);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let mut tasks = tasks.into_iter();
        if let Some(session_task) = tasks.next() {
            if let Err(e) = session_task.await {
                tracing::warn!(error = %e, "Session task ended abnormally");
            }
        }
        for task in tasks {
            task.abort();
        }

        self.channel.disconnect().await;
        tracing::info!("Call controller stopped");
    }

    fn ensure_started(&self) -> Result<(), CallError> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CallError::NotStarted)
        }
    }
}

/// Call controller builder
pub struct CallControllerBuilder<T: SignalingTransport + 'static> {
    transport: Arc<T>,
    config: PeerCallConfig,
    factory: Option<Arc<dyn PeerTransportFactory>>,
    capture: Option<Arc<dyn CaptureDevice>>,
}

impl<T: SignalingTransport + 'static> CallControllerBuilder<T> {
    /// Create new builder
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            config: PeerCallConfig::default(),
            factory: None,
            capture: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: PeerCallConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific media transport
    #[must_use]
    pub fn with_transport_factory(mut self, factory: Arc<dyn PeerTransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use a specific capture device
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<dyn CaptureDevice>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Build the controller
    ///
    /// Without an explicit media transport the webrtc backend is used, built
    /// from the configured ICE servers. Without a capture device a synthetic
    /// one is used.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if no media transport is available
    pub fn build(self) -> Result<CallController<T>, CallError> {
        let factory = match self.factory {
            Some(factory) => factory,
            None => default_factory(&self.config)?,
        };
        let capture = self
            .capture
            .unwrap_or_else(|| Arc::new(SyntheticCapture::new()));
        Ok(CallController::new(
            self.config,
            self.transport,
            factory,
            capture,
        ))
    }
}

#[cfg(feature = "webrtc-backend")]
fn default_factory(config: &PeerCallConfig) -> Result<Arc<dyn PeerTransportFactory>, CallError> {
    Ok(Arc::new(crate::webrtc_peer::WebRtcPeerFactory::new(
        config.ice_servers.clone(),
    )))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_factory(_config: &PeerCallConfig) -> Result<Arc<dyn PeerTransportFactory>, CallError> {
    Err(CallError::ConfigError(
        "no media transport configured and the webrtc backend is disabled".to_string(),
    ))
}
