//! Inbound session events and outbound notices

use crate::error::SessionError;
use crate::media::{DeviceInfo, StreamHandle};
use crate::protocol::{ProducerInfo, StreamRole};
use crate::signaling::SignalingEvent;
use crate::subscriber::RemoteStreamInfo;
use crate::types::{ConsumerId, PeerId, ProducerId};
use tokio::sync::mpsc;

/// Everything the session's event loop reacts to, in receipt order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    NewProducer(ProducerInfo),
    ProducerClosed(ProducerId),
    /// A pending consume is due for another attempt
    RetryConsume {
        producer_id: ProducerId,
        generation: u64,
    },
    /// A published track was terminated outside this session
    LocalTrackEnded {
        role: StreamRole,
        producer_id: ProducerId,
    },
    /// A consumed track was terminated without a close event
    RemoteTrackEnded {
        producer_id: ProducerId,
        consumer_id: ConsumerId,
    },
    DevicesChanged(Vec<DeviceInfo>),
    SignalingLost,
}

impl From<SignalingEvent> for SessionEvent {
    fn from(event: SignalingEvent) -> Self {
        match event {
            SignalingEvent::NewProducer(info) => Self::NewProducer(info),
            SignalingEvent::ProducerClosed(id) => Self::ProducerClosed(id),
            SignalingEvent::Disconnected => Self::SignalingLost,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// What the rendering layer is told about
#[derive(Debug, Clone)]
pub enum SessionNotice {
    LocalStreamChanged {
        role: StreamRole,
        stream: Option<StreamHandle>,
    },
    RemoteStreamAdded(RemoteStreamInfo),
    RemoteStreamRemoved {
        producer_id: ProducerId,
    },
    /// Remote audio bound to a hidden playback sink tagged with the producer
    AudioAttached {
        producer_id: ProducerId,
        peer_id: PeerId,
        stream: StreamHandle,
    },
    AudioDetached {
        producer_id: ProducerId,
    },
    /// Advisory only
    DevicesChanged(Vec<DeviceInfo>),
    SignalingLost,
    Error(SessionError),
}

pub type NoticeSender = mpsc::UnboundedSender<SessionNotice>;
