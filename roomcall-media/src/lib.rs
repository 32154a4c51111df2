//! Client-side media session core for SFU rooms
//!
//! This crate negotiates and maintains a participant's connection to a
//! Selective Forwarding Unit: it publishes local camera, screen and
//! microphone streams, consumes the streams other participants publish, and
//! tears everything down deterministically when the participant leaves.
//!
//! ## Architecture
//!
//! - **`SignalingChannel`**: request/ack and push contract with the SFU server
//! - **`CapabilityNegotiator`**: codec intersection between router and local engine
//! - **`TransportManager`**: one lazily created send and recv transport per session
//! - **`PublisherRegistry`**: local producers, with camera and screen mutually exclusive
//! - **`SubscriberRegistry`**: remote consumers, with bounded retry while the session warms up
//! - **`Session`**: join/leave orchestration and the single inbound event loop
//!
//! The platform pieces (capture devices and the WebRTC engine) are traits,
//! [`MediaDevices`] and [`MediaEngine`], supplied by the host.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcall_media::{Backends, Session, SessionConfig, SocketSignaling};
//!
//! let signaling = Arc::new(SocketSignaling::new(outbound_tx, inbound_rx));
//! let session = Session::new("room-42", SessionConfig::load(None)?, Backends::new(signaling, devices, engine));
//! let mut notices = session.take_notices().expect("first call");
//!
//! session.join().await?;
//! session.toggle_camera().await?;
//! // ...
//! session.leave().await;
//! ```

mod capabilities;
mod config;
mod encoding;
mod engine;
mod error;
mod events;
mod generation;
mod logging;
mod media;
mod protocol;
mod publisher;
mod scheduler;
mod session;
mod signaling;
mod subscriber;
mod transport;
mod types;

#[cfg(test)]
mod test_helpers;

pub use capabilities::CapabilityNegotiator;
pub use config::{
    CameraConfig, LayerConfig, LoggingConfig, MicConfig, RetryConfig, ScreenConfig, SessionConfig,
};
pub use encoding::{send_options, QualityLayer};
pub use engine::{MediaEngine, SendOptions};
pub use error::{ErrorKind, Result, SessionError};
pub use events::{SessionEvent, SessionNotice};
pub use generation::{Generation, GenerationToken};
pub use logging::init_logging;
pub use media::{
    AcquireError, AudioConstraints, CaptureRequest, DeviceInfo, DeviceKind, MediaDevices,
    MediaStream, MediaTrack, StreamHandle, TrackState, VideoConstraints,
};
pub use protocol::{
    AppData, ConsumerParams, DtlsFingerprint, DtlsParameters, MediaKind, ProducerInfo,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncoding, RtpParameters,
    StreamRole, TransportParams,
};
pub use publisher::{LocalVideoSource, Producer, ProducerState, PublisherRegistry};
pub use scheduler::{ManualScheduler, Scheduler, TimerId, TimerTask, TokioScheduler};
pub use session::{Backends, LocalStreams, Session, SessionState, SessionStats};
pub use signaling::{SignalingChannel, SignalingEvent, SocketSignaling};
pub use subscriber::{Consumer, ConsumerState, RemoteStreamInfo, SubscriberRegistry};
pub use transport::{ConnectionState, Transport, TransportDirection, TransportManager};
pub use types::{ConsumerId, PeerId, ProducerId, RoomId, TrackId, TransportId};
