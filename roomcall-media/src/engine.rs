//! Seam to the local media engine
//!
//! ICE and DTLS are handled by the engine. The session core only moves the
//! parameters it produces through signaling.

use crate::error::Result;
use crate::media::{MediaStream, MediaTrack};
use crate::protocol::{
    ConsumerParams, DtlsParameters, RtpCapabilities, RtpEncoding, RtpParameters, TransportParams,
};
use crate::transport::TransportDirection;
use serde_json::Value;
use std::sync::Arc;

/// How a local track should be sent
#[derive(Debug, Clone, PartialEq)]
pub struct SendOptions {
    pub encodings: Vec<RtpEncoding>,
    pub codec_options: Value,
}

pub trait MediaEngine: Send + Sync {
    /// Codecs the local engine can encode and decode
    fn native_capabilities(&self) -> RtpCapabilities;

    /// Local DTLS parameters to announce when a transport connects
    fn dtls_parameters(
        &self,
        direction: TransportDirection,
        remote: &TransportParams,
    ) -> Result<DtlsParameters>;

    /// RTP parameters for sending `track` with the negotiated capabilities
    fn send_parameters(
        &self,
        track: &MediaTrack,
        options: &SendOptions,
        capabilities: &RtpCapabilities,
    ) -> Result<RtpParameters>;

    /// Start receiving a consumer, returning the resulting stream
    fn receive(&self, params: &ConsumerParams) -> Result<Arc<MediaStream>>;
}
