//! Error taxonomy for the session core
//!
//! Every failure is classified where it happens. Nothing else crosses the
//! public boundary of the crate.

use crate::media::AcquireError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("Negotiation failure: {0}")]
    NegotiationFailure(String),

    #[error("Stale event: {0}")]
    StaleEvent(String),
}

/// Discriminant of [`SessionError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PermissionDenied,
    DeviceNotFound,
    CaptureFailed,
    SignalingUnavailable,
    NegotiationFailure,
    StaleEvent,
}

impl SessionError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::CaptureFailed(_) => ErrorKind::CaptureFailed,
            Self::SignalingUnavailable(_) => ErrorKind::SignalingUnavailable,
            Self::NegotiationFailure(_) => ErrorKind::NegotiationFailure,
            Self::StaleEvent(_) => ErrorKind::StaleEvent,
        }
    }

    /// Short text for a transient notification in the UI
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => {
                "Access to the camera, microphone or screen was denied. Allow it in your browser or system settings."
            }
            Self::DeviceNotFound(_) => "No matching capture device was found.",
            Self::CaptureFailed(_) => "The device could not be started.",
            Self::SignalingUnavailable(_) => "Not connected to the call server.",
            Self::NegotiationFailure(_) => "The call server rejected the media request.",
            Self::StaleEvent(_) => "The call has already ended.",
        }
    }

    /// Whether the error should be shown to the user at all
    #[must_use]
    pub const fn is_reportable(&self) -> bool {
        !matches!(self, Self::StaleEvent(_))
    }
}

impl From<AcquireError> for SessionError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::PermissionDenied(msg) => Self::PermissionDenied(msg),
            AcquireError::DeviceNotFound(msg) => Self::DeviceNotFound(msg),
            AcquireError::Other(msg) => Self::CaptureFailed(msg),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::NegotiationFailure(format!("malformed payload: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
