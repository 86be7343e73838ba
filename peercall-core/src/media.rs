//! Local media management
//!
//! The `MediaController` owns the local capture stream. The stream is
//! acquired once and outlives individual calls; transport sessions only
//! reference its tracks. Enabling or disabling video flips a flag shared with
//! those references and never touches negotiation.

use crate::types::{MediaConstraints, MediaType};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Capture device missing or access denied
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// Operation needs a local stream that has not been acquired
    #[error("No local stream acquired")]
    NoLocalStream,
}

/// Media events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Local stream acquired
    StreamAcquired {
        /// Stream ID
        stream_id: String,
    },
    /// Local video enablement changed
    VideoToggled {
        /// Whether video tracks are now enabled
        enabled: bool,
    },
}

/// One local capture track
///
/// Clones share the enabled flag.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaType,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Create a new, enabled track
    pub fn new(id: impl Into<String>, kind: MediaType) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Track ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> MediaType {
        self.kind
    }

    /// Whether the track currently produces media
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Local capture stream
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    /// Create a stream from tracks
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Stream ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Video tracks only
    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind == MediaType::Video)
    }

    /// Audio tracks only
    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind == MediaType::Audio)
    }
}

/// Capture device backend
///
/// Opens the platform capture device and returns a stream shaped by the
/// constraints.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Open capture
    ///
    /// # Errors
    ///
    /// Returns `MediaUnavailable` if the device is missing or access is denied
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// Capture device that produces tracks without touching hardware
///
/// Used by the CLI and tests. `unavailable()` simulates a missing device.
#[derive(Debug, Clone)]
pub struct SyntheticCapture {
    available: bool,
}

impl SyntheticCapture {
    /// Working synthetic device
    #[must_use]
    pub fn new() -> Self {
        Self { available: true }
    }

    /// Device that always refuses to open
    #[must_use]
    pub fn unavailable() -> Self {
        Self { available: false }
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureDevice for SyntheticCapture {
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        if !self.available {
            return Err(MediaError::MediaUnavailable(
                "no capture device present".to_string(),
            ));
        }
        let stream_id = format!("local-{}", uuid::Uuid::new_v4());
        let tracks = constraints
            .to_media_types()
            .into_iter()
            .map(|kind| LocalTrack::new(format!("{stream_id}-{kind}"), kind))
            .collect();
        Ok(LocalStream::new(stream_id, tracks))
    }
}

/// Owner of the local capture stream
pub struct MediaController {
    device: Arc<dyn CaptureDevice>,
    stream: parking_lot::RwLock<Option<Arc<LocalStream>>>,
    video_active: AtomicBool,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl MediaController {
    /// Create a controller over a capture device
    #[must_use]
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        let (event_sender, _) = broadcast::channel(16);
        Self {
            device,
            stream: parking_lot::RwLock::new(None),
            video_active: AtomicBool::new(false),
            event_sender,
        }
    }

    /// Acquire local capture
    ///
    /// Acquiring again returns the stream already held.
    ///
    /// # Errors
    ///
    /// Returns `MediaUnavailable` if the device cannot be opened
    #[tracing::instrument(skip(self))]
    pub async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<LocalStream>, MediaError> {
        if let Some(stream) = self.local_stream() {
            return Ok(stream);
        }

        let stream = match self.device.open(constraints).await {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                tracing::error!(error = %e, "Failed to acquire local media");
                return Err(e);
            }
        };

        let mut slot = self.stream.write();
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        *slot = Some(stream.clone());
        drop(slot);

        let video = stream.video_tracks().any(LocalTrack::is_enabled);
        self.video_active.store(video, Ordering::SeqCst);
        tracing::info!(
            stream_id = stream.id(),
            tracks = stream.tracks().len(),
            "Local media acquired"
        );
        let _ = self.event_sender.send(MediaEvent::StreamAcquired {
            stream_id: stream.id().to_string(),
        });
        Ok(stream)
    }

    /// The acquired stream, if any
    #[must_use]
    pub fn local_stream(&self) -> Option<Arc<LocalStream>> {
        self.stream.read().clone()
    }

    /// Enable local video tracks
    ///
    /// # Errors
    ///
    /// Returns `NoLocalStream` before `acquire` succeeded
    pub fn enable_video(&self) -> Result<(), MediaError> {
        self.set_video(true)
    }

    /// Disable local video tracks without releasing the device
    ///
    /// # Errors
    ///
    /// Returns `NoLocalStream` before `acquire` succeeded
    pub fn disable_video(&self) -> Result<(), MediaError> {
        self.set_video(false)
    }

    /// Whether local video is currently enabled
    #[must_use]
    pub fn is_video_active(&self) -> bool {
        self.video_active.load(Ordering::SeqCst)
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }

    fn set_video(&self, enabled: bool) -> Result<(), MediaError> {
        let stream = self.local_stream().ok_or(MediaError::NoLocalStream)?;
        for track in stream.video_tracks() {
            track.set_enabled(enabled);
        }
        self.video_active.store(enabled, Ordering::SeqCst);
        tracing::debug!(enabled, "Local video toggled");
        let _ = self.event_sender.send(MediaEvent::VideoToggled { enabled });
        Ok(())
    }
}
