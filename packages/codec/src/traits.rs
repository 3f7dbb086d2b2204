use crate::{Codec, CodecError, VideoFrame};

/// One access unit out of an encoder.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// Start-code delimited NAL units (Annex B).
    pub data: Vec<u8>,
    pub pts_us: u64,
    pub is_keyframe: bool,
    /// Position of the source frame in submission order.
    pub frame_index: u64,
}

impl EncodedPacket {
    #[must_use]
    pub fn new(data: Vec<u8>, pts_us: u64, is_keyframe: bool, frame_index: u64) -> Self {
        Self {
            data,
            pts_us,
            is_keyframe,
            frame_index,
        }
    }

    /// The encoder dropped the frame (rate control).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A video encoder driven from a single worker thread.
///
/// Keyframes must carry SPS and PPS in band so the muxer can build the
/// decoder configuration from the first one.
pub trait VideoEncoder: Send {
    fn encode(&mut self, frame: &VideoFrame, force_keyframe: bool)
        -> Result<EncodedPacket, CodecError>;

    /// Drain anything still buffered. Called once after the last frame.
    fn flush(&mut self) -> Result<Vec<EncodedPacket>, CodecError>;

    fn codec(&self) -> Codec;

    fn dimensions(&self) -> (u32, u32);
}
