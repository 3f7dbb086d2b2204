//! Shared fixtures for unit tests.

use crate::frame::{ColorImage, FrameSample, Resolution};
use crate::source::{synthetic_frame, CaptureResolution};
use crate::video::{
    FinalizeHandle, Mp4SinkFactory, PresentationTime, VideoError, VideoSettings, VideoSink,
    VideoSinkFactory, VideoSummary,
};
use bytes::Bytes;
use scenerec_codec::{Codec, CodecError, EncodedPacket, EncoderConfig, VideoEncoder, VideoFrame};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

pub const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xBF];
pub const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

pub fn small_resolution() -> CaptureResolution {
    CaptureResolution {
        color: Resolution::new(16, 8),
        depth: Resolution::new(8, 4),
    }
}

/// A small synthetic frame; `with_depth = false` gives a non-qualifying frame.
pub fn frame(index: u64, timestamp: f64, with_depth: bool) -> FrameSample {
    synthetic_frame(small_resolution(), index, timestamp, with_depth)
}

pub fn color_image(resolution: Resolution) -> ColorImage {
    let pixels = resolution.pixels();
    ColorImage::new(
        resolution,
        Bytes::from(vec![90u8; pixels]),
        Bytes::from(vec![128u8; pixels / 2]),
    )
}

pub fn video_settings(fps: u32) -> VideoSettings {
    VideoSettings {
        resolution: small_resolution().color,
        fps,
        codec: Codec::H264,
        bitrate: 1_000_000,
        fragment_duration_ms: 1000,
        queue_depth: 4,
    }
}

/// One Annex B access unit. Keyframes carry SPS, PPS and an IDR slice.
pub fn annex_b_frame(keyframe: bool, seed: u64) -> Vec<u8> {
    let mut out = Vec::new();
    if keyframe {
        for nal in [SPS, PPS] {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
    }
    out.extend_from_slice(&[0, 0, 0, 1]);
    out.push(if keyframe { 0x65 } else { 0x41 });
    out.extend_from_slice(&[0x88, 0x84, 0x10 | (seed & 0x0F) as u8, 0xAA]);
    out
}

/// Encoder that emits well-formed but meaningless H.264 access units.
pub struct StubEncoder {
    config: EncoderConfig,
    frame_count: u64,
}

impl StubEncoder {
    pub fn new(config: EncoderConfig) -> Result<Self, CodecError> {
        config.validate()?;
        Ok(Self {
            config,
            frame_count: 0,
        })
    }
}

impl VideoEncoder for StubEncoder {
    fn encode(
        &mut self,
        frame: &VideoFrame,
        force_keyframe: bool,
    ) -> Result<EncodedPacket, CodecError> {
        frame.validate()?;
        let gop = self.config.gop_length.max(1) as u64;
        let keyframe = force_keyframe || self.frame_count % gop == 0;
        let packet = EncodedPacket::new(
            annex_b_frame(keyframe, self.frame_count),
            frame.timestamp_us,
            keyframe,
            self.frame_count,
        );
        self.frame_count += 1;
        Ok(packet)
    }

    fn flush(&mut self) -> Result<Vec<EncodedPacket>, CodecError> {
        Ok(Vec::new())
    }

    fn codec(&self) -> Codec {
        Codec::H264
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }
}

pub fn stub_sink_factory() -> Mp4SinkFactory {
    Mp4SinkFactory::new(|config| Ok(Box::new(StubEncoder::new(config)?) as Box<dyn VideoEncoder>))
}

/// Sink whose readiness and completion are driven by the test.
#[derive(Clone, Default)]
pub struct ScriptedSinkFactory {
    pub ready: Arc<AtomicBool>,
    pub fail_start: Arc<AtomicBool>,
    /// When set, finalization stays pending until the test resolves it.
    pub hold_finalize: Arc<AtomicBool>,
    pub pushed: Arc<Mutex<Vec<PresentationTime>>>,
    pub started: Arc<Mutex<Vec<PathBuf>>>,
    pub pending_finalize: Arc<Mutex<Option<oneshot::Sender<Result<VideoSummary, VideoError>>>>>,
}

impl ScriptedSinkFactory {
    pub fn new() -> Self {
        let factory = Self::default();
        factory.ready.store(true, Ordering::SeqCst);
        factory
    }

    pub fn pushed(&self) -> Vec<PresentationTime> {
        self.pushed.lock().unwrap().clone()
    }

    /// Complete a held finalization.
    pub fn release_finalize(&self) -> bool {
        match self.pending_finalize.lock().unwrap().take() {
            Some(tx) => tx.send(Ok(VideoSummary::default())).is_ok(),
            None => false,
        }
    }
}

impl VideoSinkFactory for ScriptedSinkFactory {
    fn start(
        &self,
        path: &Path,
        _settings: &VideoSettings,
    ) -> Result<Box<dyn VideoSink>, VideoError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(VideoError::Worker("scripted start failure".to_string()));
        }
        self.started.lock().unwrap().push(path.to_path_buf());
        Ok(Box::new(ScriptedSink {
            factory: self.clone(),
            pushed: 0,
        }))
    }
}

struct ScriptedSink {
    factory: ScriptedSinkFactory,
    pushed: u64,
}

impl VideoSink for ScriptedSink {
    fn is_ready(&self) -> bool {
        self.factory.ready.load(Ordering::SeqCst)
    }

    fn push(&mut self, _color: &ColorImage, pts: PresentationTime) -> Result<(), VideoError> {
        self.factory.pushed.lock().unwrap().push(pts);
        self.pushed += 1;
        Ok(())
    }

    fn frames_pushed(&self) -> u64 {
        self.pushed
    }

    fn finish(self: Box<Self>) -> FinalizeHandle {
        let summary = VideoSummary {
            frames: self.pushed,
            ..Default::default()
        };
        if self.factory.hold_finalize.load(Ordering::SeqCst) {
            let (tx, rx) = oneshot::channel();
            *self.factory.pending_finalize.lock().unwrap() = Some(tx);
            return FinalizeHandle::new(rx);
        }
        FinalizeHandle::resolved(Ok(summary))
    }
}
