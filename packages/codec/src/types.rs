use crate::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Codec {
    #[default]
    H264,
    /// Accepted in configuration; no backend here produces it.
    Hevc,
}

/// Encoder settings for one recording.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub codec: Codec,
    /// Frames per second as numerator / denominator.
    pub framerate: (u32, u32),
    /// Bits per second.
    pub bitrate: u32,
    /// Keyframe interval in frames; 0 leaves it to the backend.
    pub gop_length: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1440,
            codec: Codec::H264,
            framerate: (60, 1),
            bitrate: 12_000_000,
            gop_length: 60,
        }
    }
}

impl EncoderConfig {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Set the framerate. The GOP follows it so every second starts with a keyframe.
    #[must_use]
    pub fn framerate(mut self, num: u32, den: u32) -> Self {
        self.framerate = (num, den);
        if den > 0 {
            self.gop_length = (num / den).max(1);
        }
        self
    }

    #[must_use]
    pub fn bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    #[must_use]
    pub fn gop_length(mut self, frames: u32) -> Self {
        self.gop_length = frames;
        self
    }

    #[must_use]
    pub fn fps(&self) -> f32 {
        if self.framerate.1 == 0 {
            return 0.0;
        }
        self.framerate.0 as f32 / self.framerate.1 as f32
    }

    /// Check the settings any 4:2:0 encoder needs.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(CodecError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.framerate.0 == 0 || self.framerate.1 == 0 {
            return Err(CodecError::invalid_param(format!(
                "framerate {}/{}",
                self.framerate.0, self.framerate.1
            )));
        }
        if self.bitrate == 0 {
            return Err(CodecError::invalid_param("bitrate must be positive"));
        }
        Ok(())
    }
}
