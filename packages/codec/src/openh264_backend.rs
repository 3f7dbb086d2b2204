//! OpenH264 software encoder.
//!
//! Produces Annex B H.264 with SPS/PPS in front of every IDR frame, which is
//! what the MP4 muxer needs to build its `avcC` box.

use crate::{Codec, CodecError, EncodedPacket, EncoderConfig, VideoEncoder, VideoFrame};
use openh264::encoder::{BitRate, Encoder, FrameRate, FrameType};
use openh264::formats::YUVSlices;
use openh264::OpenH264API;

pub struct OpenH264Encoder {
    encoder: Encoder,
    config: EncoderConfig,
    frame_count: u64,
}

impl OpenH264Encoder {
    /// Only [`Codec::H264`] is supported.
    pub fn new(config: EncoderConfig) -> Result<Self, CodecError> {
        config.validate()?;
        if config.codec != Codec::H264 {
            return Err(CodecError::UnsupportedCodec(config.codec));
        }

        let encoder_config = openh264::encoder::EncoderConfig::new()
            .bitrate(BitRate::from_bps(config.bitrate))
            .max_frame_rate(FrameRate::from_hz(config.fps()));
        let encoder = Encoder::with_api_config(OpenH264API::from_source(), encoder_config)
            .map_err(|e| CodecError::backend(e.to_string()))?;

        Ok(Self {
            encoder,
            config,
            frame_count: 0,
        })
    }
}

impl VideoEncoder for OpenH264Encoder {
    fn encode(
        &mut self,
        frame: &VideoFrame,
        force_keyframe: bool,
    ) -> Result<EncodedPacket, CodecError> {
        if (frame.width, frame.height) != self.dimensions() {
            return Err(CodecError::InvalidDimensions {
                width: frame.width,
                height: frame.height,
            });
        }
        let (cb, cr) = frame.split_chroma()?;
        let (w, h) = (frame.width as usize, frame.height as usize);
        let yuv = YUVSlices::new(
            (frame.luma.as_slice(), cb.as_slice(), cr.as_slice()),
            (w, h),
            (w, w / 2, w / 2),
        );

        let gop = self.config.gop_length as u64;
        if force_keyframe || (gop > 0 && self.frame_count % gop == 0) {
            self.encoder.force_intra_frame();
        }

        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| CodecError::backend(e.to_string()))?;
        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);

        let packet = EncodedPacket::new(
            bitstream.to_vec(),
            frame.timestamp_us,
            is_keyframe,
            self.frame_count,
        );
        self.frame_count += 1;
        Ok(packet)
    }

    fn flush(&mut self) -> Result<Vec<EncodedPacket>, CodecError> {
        // No B-frames, nothing is held back.
        Ok(Vec::new())
    }

    fn codec(&self) -> Codec {
        Codec::H264
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }
}
