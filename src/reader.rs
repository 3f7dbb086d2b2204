//! Offline access to a finished session directory.

use crate::depth::raw_to_meters;
use crate::depth_file::{decode_samples, DepthReadError, DepthReader};
use crate::frame::{Mat3, Mat4, Resolution};
use crate::metadata::{SessionMetadata, TelemetryKind, METADATA_FILE};
use crate::motion::MotionSample;
use crate::mp4::{self, Mp4Inspection, MuxError};
use crate::session::{DEPTH_FILE, VIDEO_FILE};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("failed to read {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{file}: bad entry {key}: {reason}")]
    BadEntry {
        file: &'static str,
        key: String,
        reason: String,
    },
    #[error(transparent)]
    Depth(#[from] DepthReadError),
    #[error(transparent)]
    Mux(#[from] MuxError),
}

pub struct Recording {
    dir: PathBuf,
    metadata: SessionMetadata,
}

impl Recording {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ReaderError> {
        let dir = dir.into();
        let metadata = read_json(&dir.join(METADATA_FILE))?;
        Ok(Self { dir, metadata })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn depth_resolution(&self) -> Resolution {
        Resolution::new(self.metadata.depth_width, self.metadata.depth_height)
    }

    /// Intrinsics of the last recorded frame.
    pub fn intrinsics(&self) -> Result<Option<Mat3>, ReaderError> {
        self.metadata
            .intrinsic
            .as_deref()
            .map(|text| {
                parse_array::<f32, 9>(METADATA_FILE, "intrinsic", text)
                    .map(|v| Mat3::from_cols_array(&v))
            })
            .transpose()
    }

    pub fn poses(&self) -> Result<BTreeMap<u64, Mat4>, ReaderError> {
        self.telemetry(TelemetryKind::Pose, |file, key, text| {
            parse_array::<f32, 16>(file, key, text).map(|v| Mat4::from_cols_array(&v))
        })
    }

    pub fn frame_intrinsics(&self) -> Result<BTreeMap<u64, Mat3>, ReaderError> {
        self.telemetry(TelemetryKind::Intrinsics, |file, key, text| {
            parse_array::<f32, 9>(file, key, text).map(|v| Mat3::from_cols_array(&v))
        })
    }

    pub fn timestamps(&self) -> Result<BTreeMap<u64, f64>, ReaderError> {
        self.telemetry(TelemetryKind::Timestamp, parse_scalar)
    }

    /// Motion samples keyed by the frame they were recorded with.
    pub fn motion(&self) -> Result<BTreeMap<u64, MotionSample>, ReaderError> {
        let times = self.telemetry(TelemetryKind::ImuTimestamp, parse_scalar)?;
        self.telemetry(TelemetryKind::Imu, |file, key, text| {
            let v = parse_array::<f64, { MotionSample::VECTOR_LEN }>(file, key, text)?;
            let timestamp = key
                .parse::<u64>()
                .ok()
                .and_then(|k| times.get(&k).copied())
                .unwrap_or_default();
            Ok(MotionSample::from_vector(timestamp, &v))
        })
    }

    /// Depth frames in meters, in recording order.
    pub fn depth_frames(&self) -> Result<DepthFrames, ReaderError> {
        let path = self.dir.join(DEPTH_FILE);
        let file = File::open(&path).map_err(|source| ReaderError::Io { path, source })?;
        let reader = if self.metadata.depth_compression == "none" {
            DepthReader::uncompressed(BufReader::new(file), self.depth_resolution().pixels() * 2)
        } else {
            DepthReader::compressed(BufReader::new(file))
        };
        Ok(DepthFrames {
            reader,
            scale: self.metadata.depth_scale,
        })
    }

    pub fn inspect_video(&self) -> Result<Mp4Inspection, ReaderError> {
        let path = self.dir.join(VIDEO_FILE);
        let data = std::fs::read(&path).map_err(|source| ReaderError::Io { path, source })?;
        Ok(mp4::inspect(&data)?)
    }

    fn telemetry<T>(
        &self,
        kind: TelemetryKind,
        parse: impl Fn(&'static str, &str, &str) -> Result<T, ReaderError>,
    ) -> Result<BTreeMap<u64, T>, ReaderError> {
        let file = kind.file_name();
        let raw: BTreeMap<String, String> = read_json(&self.dir.join(file))?;
        raw.iter()
            .map(|(key, text)| {
                let index = key.parse::<u64>().map_err(|e| ReaderError::BadEntry {
                    file,
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
                Ok((index, parse(file, key, text)?))
            })
            .collect()
    }
}

pub struct DepthFrames {
    reader: DepthReader<BufReader<File>>,
    scale: f32,
}

impl Iterator for DepthFrames {
    type Item = Result<Vec<f32>, ReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = match self.reader.next()? {
            Ok(raw) => raw,
            Err(e) => return Some(Err(e.into())),
        };
        let scale = self.scale;
        Some(Ok(decode_samples(&raw)
            .into_iter()
            .map(|v| raw_to_meters(v, scale))
            .collect()))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ReaderError> {
    let file = File::open(path).map_err(|source| ReaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| ReaderError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_array<T: DeserializeOwned, const N: usize>(
    file: &'static str,
    key: &str,
    text: &str,
) -> Result<[T; N], ReaderError> {
    let bad = |reason: String| ReaderError::BadEntry {
        file,
        key: key.to_string(),
        reason,
    };
    let values: Vec<T> = serde_json::from_str(text).map_err(|e| bad(e.to_string()))?;
    let len = values.len();
    values
        .try_into()
        .map_err(|_| bad(format!("expected {} values, found {}", N, len)))
}

fn parse_scalar(file: &'static str, key: &str, text: &str) -> Result<f64, ReaderError> {
    text.trim().parse().map_err(|e: std::num::ParseFloatError| ReaderError::BadEntry {
        file,
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecorderConfig;
    use crate::motion::{MotionFeed, MotionSource};
    use crate::recorder::{Recorder, StartRequest};
    use crate::source::{SyntheticConfig, SyntheticFrameSource};
    use crate::test_support::{frame, small_resolution, stub_sink_factory};
    use std::sync::Arc;

    fn record(root: &Path, compress: bool, frames: u64) -> PathBuf {
        let config = RecorderConfig {
            output_dir: root.to_path_buf(),
            fps: 30,
            compress_depth: compress,
            video_queue_depth: 64,
            ..Default::default()
        };
        let source = Arc::new(SyntheticFrameSource::new(SyntheticConfig {
            resolution: small_resolution(),
            ..Default::default()
        }));
        let (feed, publisher) = MotionFeed::new();
        let mut rec = Recorder::new(
            config,
            source,
            Arc::new(feed.clone()) as Arc<dyn MotionSource>,
            Arc::new(stub_sink_factory()),
        )
        .unwrap();

        rec.start(StartRequest::new("reader", "test")).unwrap();
        for i in 0..frames {
            publisher.publish(MotionSample {
                timestamp: 50.0 + i as f64,
                ..Default::default()
            });
            rec.on_frame(&frame(i, i as f64 / 30.0, true));
        }
        let pending = rec.stop().unwrap();
        assert!(pending.finalize.wait_blocking().is_completed());
        pending.session.dir
    }

    #[test]
    fn test_reads_back_a_recording() {
        let root = tempfile::tempdir().unwrap();
        let dir = record(root.path(), true, 4);
        let recording = Recording::open(&dir).unwrap();

        assert_eq!(recording.metadata().scene_name, "reader");
        assert_eq!(recording.metadata().frame_count, 4);
        assert_eq!(recording.depth_resolution(), small_resolution().depth);

        let poses = recording.poses().unwrap();
        assert_eq!(poses.len(), 4);
        assert!((poses[&3].translation()[0] - 0.03).abs() < 1e-6);

        let k = recording.intrinsics().unwrap().unwrap();
        assert_eq!(k, recording.frame_intrinsics().unwrap()[&3]);

        let motion = recording.motion().unwrap();
        assert_eq!(motion[&2].timestamp, 52.0);

        let depth: Vec<Vec<f32>> = recording
            .depth_frames()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(depth.len(), 4);
        assert!((depth[0][0] - 0.5).abs() < 0.001);

        let video = recording.inspect_video().unwrap();
        assert_eq!(video.samples.len(), 4);
        assert_eq!(recording.timestamps().unwrap().len(), video.samples.len());
    }

    #[test]
    fn test_reads_uncompressed_depth() {
        let root = tempfile::tempdir().unwrap();
        let dir = record(root.path(), false, 3);
        let recording = Recording::open(&dir).unwrap();
        assert_eq!(recording.metadata().depth_compression, "none");
        assert_eq!(recording.depth_frames().unwrap().count(), 3);
    }

    #[test]
    fn test_bad_entry_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let dir = record(root.path(), true, 1);
        std::fs::write(dir.join("trans.json"), r#"{ "0": "[1.0, 2.0]" }"#).unwrap();
        let err = Recording::open(&dir).unwrap().poses().unwrap_err();
        assert!(matches!(err, ReaderError::BadEntry { file: "trans.json", .. }));

        assert!(matches!(
            Recording::open(root.path().join("missing")),
            Err(ReaderError::Io { .. })
        ));
    }
}
