//! Session configuration

use crate::encoding::QualityLayer;
use crate::media::{AudioConstraints, VideoConstraints};
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Session core configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub retry: RetryConfig,
    pub camera: CameraConfig,
    pub screen: ScreenConfig,
    pub mic: MicConfig,
    pub logging: LoggingConfig,
}

/// Bounded retry for consuming producers announced before the session is ready
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before a pending consume is abandoned
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay_ms: 500,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Simulcast layer of the camera stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub layer: QualityLayer,
    /// Maximum bitrate in kbps
    pub max_bitrate_kbps: u32,
    pub scale_resolution_down_by: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Layers ordered from lowest to highest quality
    pub layers: Vec<LayerConfig>,
    /// Start bitrate hint for the encoder (kbps)
    pub start_bitrate_kbps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            layers: QualityLayer::ASCENDING
                .iter()
                .map(|layer| LayerConfig {
                    layer: *layer,
                    max_bitrate_kbps: layer.expected_bitrate(),
                    scale_resolution_down_by: layer.default_scale_down(),
                })
                .collect(),
            start_bitrate_kbps: 1000,
        }
    }
}

impl CameraConfig {
    #[must_use]
    pub const fn constraints(&self) -> VideoConstraints {
        VideoConstraints {
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    pub frame_rate: u32,
    /// Maximum bitrate of the single layer (kbps)
    pub max_bitrate_kbps: u32,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            frame_rate: 15,
            max_bitrate_kbps: 1500,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MicConfig {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for MicConfig {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

impl MicConfig {
    #[must_use]
    pub const fn constraints(&self) -> AudioConstraints {
        AudioConstraints {
            echo_cancellation: self.echo_cancellation,
            noise_suppression: self.noise_suppression,
            auto_gain_control: self.auto_gain_control,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // ROOMCALL_RETRY__MAX_ATTEMPTS, ROOMCALL_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("ROOMCALL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
