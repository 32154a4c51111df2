//! Local and remote media primitives
//!
//! The session core owns every track it creates or receives. The rendering
//! and mixing layers only ever see a [`StreamHandle`], which can read a
//! stream but cannot stop or replace its tracks.

use crate::protocol::MediaKind;
use crate::types::TrackId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Lifecycle of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    /// Stopped by the session core
    Stopped,
    /// Terminated from outside (OS capture control, device unplugged, server)
    Ended,
}

/// A single audio or video track
pub struct MediaTrack {
    id: TrackId,
    kind: MediaKind,
    label: String,
    state: watch::Sender<TrackState>,
}

impl MediaTrack {
    #[must_use]
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Arc<Self> {
        let (state, _) = watch::channel(TrackState::Live);
        Arc::new(Self {
            id: TrackId::generate(),
            kind,
            label: label.into(),
            state,
        })
    }

    #[must_use]
    pub fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn state(&self) -> TrackState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Stop the track. Returns false if it was no longer live.
    pub(crate) fn stop(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = TrackState::Stopped;
                true
            } else {
                false
            }
        })
    }

    /// Signal that the track terminated on its own.
    ///
    /// Called by media backends, never by the rendering layer.
    pub fn end(&self) {
        self.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = TrackState::Ended;
                true
            } else {
                false
            }
        });
    }

    /// Resolves once the track is no longer live, with its final state
    pub async fn ended(&self) -> TrackState {
        let mut rx = self.state.subscribe();
        let result = rx.wait_for(|state| *state != TrackState::Live).await;
        result.map_or(TrackState::Ended, |state| *state)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

/// A group of tracks captured or received together
#[derive(Debug)]
pub struct MediaStream {
    id: TrackId,
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    #[must_use]
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: TrackId::generate(),
            tracks,
        }
    }

    #[must_use]
    pub fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    /// First track of the given kind
    #[must_use]
    pub fn track(&self, kind: MediaKind) -> Option<&Arc<MediaTrack>> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    /// Stop every track of the stream. Returns how many were still live.
    pub(crate) fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|track| track.stop()).count()
    }
}

/// Read-only handle to a stream owned by the session core
#[derive(Debug, Clone)]
pub struct StreamHandle(Arc<MediaStream>);

impl StreamHandle {
    pub(crate) fn new(stream: Arc<MediaStream>) -> Self {
        Self(stream)
    }

    #[must_use]
    pub fn id(&self) -> &TrackId {
        self.0.id()
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<MediaKind> {
        self.0.tracks().iter().map(|track| track.kind()).collect()
    }

    #[must_use]
    pub fn track_ids(&self) -> Vec<TrackId> {
        self.0.tracks().iter().map(|track| track.id().clone()).collect()
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.0.tracks().iter().any(|track| track.is_live())
    }
}

/// Constraints for camera capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// Constraints for microphone capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

/// What to capture for a toggle-on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRequest {
    Camera(VideoConstraints),
    Display { frame_rate: u32 },
    Microphone(AudioConstraints),
}

impl CaptureRequest {
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        match self {
            Self::Camera(_) | Self::Display { .. } => MediaKind::Video,
            Self::Microphone(_) => MediaKind::Audio,
        }
    }
}

/// Media acquisition failure as reported by the platform
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl AcquireError {
    /// Classify a platform error by its DOM exception name
    #[must_use]
    pub fn from_dom_name(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match name {
            "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => {
                Self::PermissionDenied(message)
            }
            "NotFoundError" | "DevicesNotFoundError" | "OverconstrainedError" => {
                Self::DeviceNotFound(message)
            }
            _ => Self::Other(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
    VideoInput,
}

/// A capture or playback device known to the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    pub label: String,
}

/// Platform access to capture devices
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture local media. May wait indefinitely on a permission prompt.
    async fn acquire(&self, request: CaptureRequest) -> Result<MediaStream, AcquireError>;

    /// Stream of device list changes, if the platform reports them
    fn device_changes(&self) -> Option<mpsc::UnboundedReceiver<Vec<DeviceInfo>>> {
        None
    }
}
