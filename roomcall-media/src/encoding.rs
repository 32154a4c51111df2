//! Encoding layers for published streams
//!
//! The camera is sent as three simulcast layers so the SFU can forward a
//! tier that fits each receiver. Screen share and microphone use a single
//! layer.

use crate::config::SessionConfig;
use crate::engine::SendOptions;
use crate::protocol::{RtpEncoding, StreamRole};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Simulcast quality layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLayer {
    High,
    Medium,
    Low,
}

impl QualityLayer {
    pub const ASCENDING: [Self; 3] = [Self::Low, Self::Medium, Self::High];

    /// Get the RID (restriction identifier) for this layer
    #[must_use]
    pub const fn rid(&self) -> &'static str {
        match self {
            Self::High => "h",
            Self::Medium => "m",
            Self::Low => "l",
        }
    }

    /// Default bitrate for this layer (kbps)
    #[must_use]
    pub const fn expected_bitrate(&self) -> u32 {
        match self {
            Self::High => 900,
            Self::Medium => 300,
            Self::Low => 100,
        }
    }

    #[must_use]
    pub const fn default_scale_down(&self) -> f64 {
        match self {
            Self::High => 1.0,
            Self::Medium => 2.0,
            Self::Low => 4.0,
        }
    }

    /// Spatial layer index
    #[must_use]
    pub const fn spatial_layer(&self) -> u8 {
        match self {
            Self::High => 2,
            Self::Medium => 1,
            Self::Low => 0,
        }
    }
}

/// Encodings and codec options used to publish `role`
#[must_use]
pub fn send_options(role: StreamRole, config: &SessionConfig) -> SendOptions {
    match role {
        StreamRole::Camera => {
            let mut layers = config.camera.layers.clone();
            layers.sort_by_key(|layer| layer.layer.spatial_layer());
            SendOptions {
                encodings: layers
                    .iter()
                    .map(|layer| RtpEncoding {
                        rid: Some(layer.layer.rid().to_string()),
                        max_bitrate: Some(layer.max_bitrate_kbps * 1000),
                        scale_resolution_down_by: Some(layer.scale_resolution_down_by),
                        max_framerate: None,
                    })
                    .collect(),
                codec_options: json!({
                    "videoGoogleStartBitrate": config.camera.start_bitrate_kbps,
                }),
            }
        }
        StreamRole::Screen => SendOptions {
            encodings: vec![RtpEncoding {
                max_bitrate: Some(config.screen.max_bitrate_kbps * 1000),
                max_framerate: Some(f64::from(config.screen.frame_rate)),
                ..Default::default()
            }],
            codec_options: serde_json::Value::Null,
        },
        StreamRole::Mic => SendOptions {
            encodings: vec![RtpEncoding::default()],
            codec_options: json!({ "opusStereo": false, "opusDtx": true }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_uses_three_ascending_layers() {
        let options = send_options(StreamRole::Camera, &SessionConfig::default());
        let rids: Vec<_> = options
            .encodings
            .iter()
            .map(|e| e.rid.clone().unwrap())
            .collect();
        assert_eq!(rids, vec!["l", "m", "h"]);

        let bitrates: Vec<_> = options.encodings.iter().map(|e| e.max_bitrate.unwrap()).collect();
        assert!(bitrates.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(options.codec_options["videoGoogleStartBitrate"], 1000);
    }

    #[test]
    fn test_screen_and_mic_use_single_layer() {
        let config = SessionConfig::default();
        let screen = send_options(StreamRole::Screen, &config);
        assert_eq!(screen.encodings.len(), 1);
        assert!(screen.encodings[0].rid.is_none());
        assert_eq!(screen.encodings[0].max_framerate, Some(15.0));

        let mic = send_options(StreamRole::Mic, &config);
        assert_eq!(mic.encodings.len(), 1);
    }

    #[test]
    fn test_layer_order_follows_spatial_index() {
        let mut config = SessionConfig::default();
        config.camera.layers.reverse();
        let options = send_options(StreamRole::Camera, &config);
        assert_eq!(options.encodings[0].rid.as_deref(), Some("l"));
        assert_eq!(options.encodings[2].rid.as_deref(), Some("h"));
    }
}
