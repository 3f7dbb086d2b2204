//! scenerec - multi-stream RGB-D capture recorder.
//!
//! A capture session delivers color frames, LiDAR depth, camera intrinsics
//! and pose at a fixed rate, with inertial samples on their own cadence.
//! This crate turns that stream into one directory per recording:
//!
//! - `rgb.mp4` - fragmented MP4 with one H.264 track and an `mfra` index
//! - `depth.bin` - 16-bit depth, one raw-deflate record per frame
//! - `trans.json`, `intri.json`, `imu.json`, ... - telemetry keyed by frame index
//! - `metadata.json` - scene, resolutions, last intrinsics and EXIF summary
//!
//! # Quick Start
//!
//! ```ignore
//! use scenerec::{Recorder, RecorderConfig, RecorderService, StartRequest};
//!
//! let recorder = Recorder::new(config, source, motion, Arc::new(Mp4SinkFactory::openh264()))?;
//! let (handle, _task) = RecorderService::spawn(recorder, cancel.clone());
//!
//! handle.start(StartRequest::new("kitchen", "indoor")).await?;
//! // capture source pushes frames through handle.frame_sender()
//! let summary = handle.stop().await?;
//! ```
//!
//! # Feature Flags
//!
//! - `openh264` - software H.264 encoder, required by the `scenerec` binary

pub mod config;
pub mod depth;
pub mod depth_file;
pub mod frame;
pub mod metadata;
pub mod motion;
pub mod mp4;
pub mod reader;
pub mod recorder;
pub mod session;
pub mod source;
pub mod video;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, RecorderConfig};
pub use frame::{ColorImage, DepthMap, FrameSample, LatestFrame, Mat3, Mat4, Resolution};
pub use motion::{MotionFeed, MotionSample, MotionSource};
pub use reader::Recording;
pub use recorder::{
    FrameSender, Recorder, RecorderError, RecorderHandle, RecorderService, RecorderState,
    SessionSummary, StartRequest,
};
pub use source::{CaptureResolution, FrameSource, SyntheticConfig, SyntheticFrameSource};
pub use video::{FinalizeStatus, Mp4SinkFactory, VideoSink, VideoSinkFactory};
