//! Capture session abstraction and a synthetic source.
//!
//! A real device session delivers frames from its own callback thread; here
//! frames are pushed into the recorder's event queue through a
//! [`FrameSender`]. The recorder only needs the negotiated resolutions and
//! the ability to pause delivery while a recording is being finalized.

use crate::frame::{ColorImage, DepthMap, ExifMap, ExifValue, FrameSample, Mat3, Mat4, Resolution};
use crate::motion::{MotionPublisher, MotionSample};
use crate::recorder::FrameSender;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Resolutions negotiated by the capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureResolution {
    pub color: Resolution,
    pub depth: Resolution,
}

pub trait FrameSource: Send + Sync {
    fn resolution(&self) -> CaptureResolution;
    fn pause(&self);
    fn resume(&self);
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub resolution: CaptureResolution,
    pub fps: u32,
    /// Stop after this many emitted frames.
    pub frame_limit: Option<u64>,
    /// Attach depth to every n-th frame only (1 = every frame).
    pub depth_interval: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            resolution: CaptureResolution {
                color: Resolution::new(640, 480),
                depth: Resolution::new(256, 192),
            },
            fps: 30,
            frame_limit: None,
            depth_interval: 1,
        }
    }
}

/// Generates moving test frames at a fixed rate.
pub struct SyntheticFrameSource {
    config: SyntheticConfig,
    paused: Arc<AtomicBool>,
}

impl SyntheticFrameSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Start emitting frames. The task ends when the frame limit is reached,
    /// the recorder goes away, or `cancel` fires; it returns the number of
    /// frames emitted.
    pub fn spawn(
        &self,
        frames: FrameSender,
        motion: Option<MotionPublisher>,
        cancel: CancellationToken,
    ) -> JoinHandle<u64> {
        let config = self.config.clone();
        let paused = self.paused.clone();
        let period = Duration::from_secs_f64(1.0 / config.fps.max(1) as f64);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut emitted = 0u64;
            let mut tick = 0u64;

            loop {
                if config.frame_limit.is_some_and(|limit| emitted >= limit) {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let timestamp = tick as f64 / config.fps.max(1) as f64;
                tick += 1;
                if paused.load(Ordering::Acquire) {
                    continue;
                }

                if let Some(publisher) = &motion {
                    publisher.publish(synthetic_motion(timestamp));
                }
                let with_depth = config.depth_interval <= 1 || tick % config.depth_interval == 0;
                let frame = synthetic_frame(config.resolution, emitted, timestamp, with_depth);
                if frames.send(frame).await.is_err() {
                    tracing::debug!("Recorder gone, synthetic source stopping");
                    break;
                }
                emitted += 1;
            }
            tracing::info!("Synthetic source emitted {} frames", emitted);
            emitted
        })
    }
}

impl FrameSource for SyntheticFrameSource {
    fn resolution(&self) -> CaptureResolution {
        self.config.resolution
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }
}

/// Build one synthetic frame: a scrolling luma gradient, a tilted depth
/// plane and a camera sliding along +x.
pub fn synthetic_frame(
    resolution: CaptureResolution,
    index: u64,
    timestamp: f64,
    with_depth: bool,
) -> FrameSample {
    let color = resolution.color;
    let shift = (index * 4) as usize;
    let luma: Vec<u8> = (0..color.height as usize)
        .flat_map(|y| (0..color.width as usize).map(move |x| ((x + y + shift) & 0xff) as u8))
        .collect();
    let chroma = vec![128u8; color.pixels() / 2];

    let depth = with_depth.then(|| {
        let d = resolution.depth;
        let values: Vec<f32> = (0..d.height)
            .flat_map(|y| (0..d.width).map(move |x| 0.5 + (x + y) as f32 * 0.01))
            .collect();
        DepthMap::new(d, values)
    });

    let fx = color.width as f32 * 0.8;
    FrameSample {
        color: ColorImage::new(color, Bytes::from(luma), Bytes::from(chroma)),
        smoothed_depth: depth.clone(),
        depth,
        confidence: None,
        smoothed_confidence: None,
        intrinsics: Mat3::intrinsics(fx, fx, color.width as f32 / 2.0, color.height as f32 / 2.0),
        resolution: color,
        pose: Mat4::from_translation(index as f32 * 0.01, 0.0, 0.0),
        timestamp,
        exposure_duration: 1.0 / 120.0,
        exposure_offset: 0.0,
        exif: synthetic_exif(index),
    }
}

fn synthetic_exif(index: u64) -> ExifMap {
    let mut exif = ExifMap::new();
    exif.insert("ShutterSpeedValue".into(), ExifValue::Number(6.9));
    exif.insert(
        "BrightnessValue".into(),
        ExifValue::Number(2.0 + (index % 10) as f64 * 0.1),
    );
    exif.insert("FNumber".into(), ExifValue::Number(1.8));
    exif.insert("FocalLength".into(), ExifValue::Number(5.1));
    exif.insert("ISOSpeedRatings".into(), ExifValue::List(vec![100.0]));
    exif.insert("LensMake".into(), ExifValue::Text("Synthetic".into()));
    exif.insert(
        "LensSpecification".into(),
        ExifValue::List(vec![1.5, 6.0, 1.8, 2.4]),
    );
    exif
}

fn synthetic_motion(timestamp: f64) -> MotionSample {
    MotionSample {
        timestamp,
        rotation_rate: [0.0, 0.01, 0.0],
        gravity: [0.0, -1.0, 0.0],
        magnetic_field: [20.0, 0.0, -40.0],
        attitude: [0.0, 0.0, timestamp * 0.1],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> CaptureResolution {
        CaptureResolution {
            color: Resolution::new(16, 8),
            depth: Resolution::new(8, 4),
        }
    }

    #[test]
    fn test_synthetic_frame_shape() {
        let frame = synthetic_frame(small(), 3, 0.1, true);
        assert!(frame.color.is_well_formed());
        assert!(frame.is_qualifying());
        assert_eq!(frame.depth_resolution(), Some(Resolution::new(8, 4)));
        assert!((frame.pose.translation()[0] - 0.03).abs() < 1e-6);

        let no_depth = synthetic_frame(small(), 0, 0.0, false);
        assert!(!no_depth.is_qualifying());
    }

    #[test]
    fn test_pause_resume() {
        let source = SyntheticFrameSource::new(SyntheticConfig::default());
        assert!(!source.is_paused());
        source.pause();
        assert!(source.is_paused());
        source.resume();
        assert!(!source.is_paused());
    }
}
