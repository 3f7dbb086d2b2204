//! Recorder configuration.
//!
//! Every field has a default, so a config file only needs the keys it
//! changes. The CLI layers its flags on top of whatever was loaded.

use crate::depth::DEFAULT_DEPTH_SCALE;
use crate::frame::Resolution;
use crate::video::VideoSettings;
use anyhow::Context;
use scenerec_codec::Codec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("fps must be positive")]
    ZeroFps,
    #[error("depth scale must be a positive finite number, got {0}")]
    InvalidDepthScale(f32),
    #[error("{name} must be positive")]
    ZeroQueue { name: &'static str },
    #[error("unknown codec {0:?}")]
    UnknownCodec(String),
    #[error("codec {0} cannot be recorded to mp4")]
    UnsupportedCodec(String),
    #[error("bitrate must be positive")]
    ZeroBitrate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Root under which session directories are created.
    pub output_dir: PathBuf,
    pub fps: u32,
    pub codec: String,
    pub bitrate: u32,
    pub compress_depth: bool,
    /// Meters per depth unit.
    pub depth_scale: f32,
    pub fragment_duration_ms: u32,
    /// Color frames in flight before the video sink reports not-ready.
    pub video_queue_depth: usize,
    /// Capacity of the recorder's event queue.
    pub event_queue_depth: usize,
    pub finalize_timeout_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            fps: 60,
            codec: "h264".to_string(),
            bitrate: 12_000_000,
            compress_depth: true,
            depth_scale: DEFAULT_DEPTH_SCALE,
            fragment_duration_ms: 1000,
            video_queue_depth: 8,
            event_queue_depth: 64,
            finalize_timeout_secs: 30,
        }
    }
}

impl RecorderConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fps == 0 {
            return Err(ConfigError::ZeroFps);
        }
        if !(self.depth_scale.is_finite() && self.depth_scale > 0.0) {
            return Err(ConfigError::InvalidDepthScale(self.depth_scale));
        }
        if self.video_queue_depth == 0 {
            return Err(ConfigError::ZeroQueue {
                name: "video_queue_depth",
            });
        }
        if self.event_queue_depth == 0 {
            return Err(ConfigError::ZeroQueue {
                name: "event_queue_depth",
            });
        }
        if self.bitrate == 0 {
            return Err(ConfigError::ZeroBitrate);
        }
        match self.codec()? {
            Codec::H264 => Ok(()),
            Codec::Hevc => Err(ConfigError::UnsupportedCodec(self.codec.clone())),
        }
    }

    pub fn codec(&self) -> Result<Codec, ConfigError> {
        match self.codec.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(Codec::H264),
            "hevc" | "h265" => Ok(Codec::Hevc),
            _ => Err(ConfigError::UnknownCodec(self.codec.clone())),
        }
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_secs(self.finalize_timeout_secs)
    }

    pub fn video_settings(&self, resolution: Resolution) -> VideoSettings {
        VideoSettings {
            resolution,
            fps: self.fps,
            codec: self.codec().unwrap_or_default(),
            bitrate: self.bitrate,
            fragment_duration_ms: self.fragment_duration_ms,
            queue_depth: self.video_queue_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RecorderConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.fps, 60);
        assert!(config.compress_depth);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.json");
        std::fs::write(&path, r#"{ "fps": 30, "compress_depth": false }"#).unwrap();

        let config = RecorderConfig::load(&path).unwrap();
        assert_eq!(config.fps, 30);
        assert!(!config.compress_depth);
        assert_eq!(config.depth_scale, DEFAULT_DEPTH_SCALE);
        assert_eq!(config.finalize_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad = |f: fn(&mut RecorderConfig)| {
            let mut c = RecorderConfig::default();
            f(&mut c);
            c.validate()
        };
        assert_eq!(bad(|c| c.fps = 0), Err(ConfigError::ZeroFps));
        assert!(matches!(
            bad(|c| c.depth_scale = f32::NAN),
            Err(ConfigError::InvalidDepthScale(_))
        ));
        assert!(matches!(
            bad(|c| c.depth_scale = -1.0),
            Err(ConfigError::InvalidDepthScale(_))
        ));
        assert!(matches!(
            bad(|c| c.video_queue_depth = 0),
            Err(ConfigError::ZeroQueue { .. })
        ));
        assert!(matches!(
            bad(|c| c.codec = "hevc".into()),
            Err(ConfigError::UnsupportedCodec(_))
        ));
        assert!(matches!(
            bad(|c| c.codec = "vp9".into()),
            Err(ConfigError::UnknownCodec(_))
        ));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.json");
        std::fs::write(&path, r#"{ "fps": 0 }"#).unwrap();
        assert!(RecorderConfig::load(&path).is_err());
        assert!(RecorderConfig::load(dir.path().join("missing.json")).is_err());
    }
}
