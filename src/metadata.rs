//! Per-frame telemetry and the session metadata documents.
//!
//! Every telemetry kind is an append-only map from frame index to a string
//! value, serialized at stop as one JSON object per file with keys in
//! ascending frame order. Vectors are written bracketed (`"[1.0,0.0,...]"`)
//! and matrices flattened column-major, so a reader can `json.loads` each
//! value and reshape.

use crate::frame::{ExifMap, ExifValue, FrameSample, Mat3, Resolution};
use crate::motion::MotionSample;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "metadata.json";

/// EXIF fields copied into `metadata.json` as `exif_<Name>`.
pub const GLOBAL_EXIF_KEYS: [&str; 19] = [
    "OffsetTime",
    "ExposureBiasValue",
    "ExifVersion",
    "SceneType",
    "SensingMethod",
    "FocalLength",
    "LensMake",
    "LensModel",
    "ApertureValue",
    "FNumber",
    "FocalLenIn35mmFilm",
    "OffsetTimeDigitized",
    "Flash",
    "OffsetTimeOriginal",
    "MeteringMode",
    "WhiteBalance",
    "ColorSpace",
    "ISOSpeedRatings",
    "LensSpecification",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TelemetryKind {
    Pose,
    Intrinsics,
    ExposureOffset,
    Timestamp,
    Imu,
    ImuTimestamp,
    ExifShutterSpeed,
    ExifBrightness,
}

impl TelemetryKind {
    pub const ALL: [TelemetryKind; 8] = [
        TelemetryKind::Pose,
        TelemetryKind::Intrinsics,
        TelemetryKind::ExposureOffset,
        TelemetryKind::Timestamp,
        TelemetryKind::Imu,
        TelemetryKind::ImuTimestamp,
        TelemetryKind::ExifShutterSpeed,
        TelemetryKind::ExifBrightness,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            TelemetryKind::Pose => "trans.json",
            TelemetryKind::Intrinsics => "intri.json",
            TelemetryKind::ExposureOffset => "offset.json",
            TelemetryKind::Timestamp => "timestamps.json",
            TelemetryKind::Imu => "imu.json",
            TelemetryKind::ImuTimestamp => "imu_timestamp.json",
            TelemetryKind::ExifShutterSpeed => "exif_ShutterSpeedValue.json",
            TelemetryKind::ExifBrightness => "exif_BrightnessValue.json",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("failed to serialize {name}: {source}")]
    Serialize {
        name: String,
        source: serde_json::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Static facts about a session, known at start.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub scene_name: String,
    pub scene_type: String,
    pub color: Resolution,
    pub depth: Resolution,
    pub fps: u32,
    pub depth_scale: f32,
    pub depth_compressed: bool,
    pub start_time: DateTime<Local>,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub scene_name: String,
    pub scene_type: String,
    pub color_width: u32,
    pub color_height: u32,
    pub depth_width: u32,
    pub depth_height: u32,
    pub fps: u32,
    /// Last recorded intrinsics, bracketed column-major.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intrinsic: Option<String>,
    pub depth_scale: f32,
    pub depth_format: String,
    pub depth_compression: String,
    pub matrix_layout: String,
    pub frame_count: u64,
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure_duration: Option<f64>,
    #[serde(flatten)]
    pub exif: BTreeMap<String, String>,
}

/// Outcome of writing the documents at stop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetadataReport {
    pub written: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl MetadataReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct MetadataAggregator {
    entries: BTreeMap<TelemetryKind, BTreeMap<u64, String>>,
    last_index: Option<u64>,
    last_intrinsics: Option<Mat3>,
    last_exposure_duration: Option<f64>,
    last_exif: ExifMap,
}

impl MetadataAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append telemetry for frame `index`.
    ///
    /// IMU entries are only added when a motion sample is available, and the
    /// per-frame EXIF entries only when the frame carries that field.
    pub fn record(&mut self, index: u64, frame: &FrameSample, motion: Option<&MotionSample>) {
        if let Some(last) = self.last_index {
            if index <= last {
                debug_assert!(index > last, "frame index {} after {}", index, last);
                tracing::error!("Telemetry for frame {} arrived after frame {}, skipped", index, last);
                return;
            }
        }
        self.last_index = Some(index);

        self.insert(TelemetryKind::Pose, index, bracketed(&frame.pose.to_cols_array()));
        self.insert(
            TelemetryKind::Intrinsics,
            index,
            bracketed(&frame.intrinsics.to_cols_array()),
        );
        self.insert(
            TelemetryKind::ExposureOffset,
            index,
            format!("{:?}", frame.exposure_offset),
        );
        self.insert(TelemetryKind::Timestamp, index, format!("{:?}", frame.timestamp));

        if let Some(m) = motion {
            self.insert(TelemetryKind::Imu, index, bracketed(&m.to_vector()));
            self.insert(TelemetryKind::ImuTimestamp, index, format!("{:?}", m.timestamp));
        }
        if let Some(v) = frame.exif.get("ShutterSpeedValue") {
            self.insert(TelemetryKind::ExifShutterSpeed, index, v.to_string());
        }
        if let Some(v) = frame.exif.get("BrightnessValue") {
            self.insert(TelemetryKind::ExifBrightness, index, v.to_string());
        }

        self.last_intrinsics = Some(frame.intrinsics);
        self.last_exposure_duration = Some(frame.exposure_duration);
        if !frame.exif.is_empty() {
            self.last_exif = frame.exif.clone();
        }
    }

    fn insert(&mut self, kind: TelemetryKind, index: u64, value: String) {
        self.entries.entry(kind).or_default().insert(index, value);
    }

    pub fn entries(&self, kind: TelemetryKind) -> Option<&BTreeMap<u64, String>> {
        self.entries.get(&kind)
    }

    pub fn len(&self, kind: TelemetryKind) -> usize {
        self.entries.get(&kind).map_or(0, BTreeMap::len)
    }

    /// Frames recorded, counted by pose entries.
    pub fn frame_count(&self) -> u64 {
        self.len(TelemetryKind::Pose) as u64
    }

    pub fn last_exposure_duration(&self) -> Option<f64> {
        self.last_exposure_duration
    }

    pub fn session_metadata(&self, info: &SessionInfo) -> SessionMetadata {
        SessionMetadata {
            scene_name: info.scene_name.clone(),
            scene_type: info.scene_type.clone(),
            color_width: info.color.width,
            color_height: info.color.height,
            depth_width: info.depth.width,
            depth_height: info.depth.height,
            fps: info.fps,
            intrinsic: self.last_intrinsics.map(|k| bracketed(&k.to_cols_array())),
            depth_scale: info.depth_scale,
            depth_format: "uint16_le".to_string(),
            depth_compression: if info.depth_compressed {
                "deflate_raw".to_string()
            } else {
                "none".to_string()
            },
            matrix_layout: "column-major".to_string(),
            frame_count: self.frame_count(),
            start_time: info.start_time.to_rfc3339(),
            exposure_duration: self.last_exposure_duration,
            exif: exif_summary(&self.last_exif),
        }
    }

    /// Write `metadata.json` and every telemetry document into `dir`.
    ///
    /// Each document is written on its own; a failure is logged and reported
    /// without stopping the others.
    pub fn flush(&self, dir: &Path, info: &SessionInfo) -> MetadataReport {
        let mut report = MetadataReport::default();
        let empty = BTreeMap::new();

        let mut outcome = |name: &str, result: Result<PathBuf, MetadataError>| match result {
            Ok(path) => report.written.push(path),
            Err(e) => {
                tracing::warn!("Metadata document {} not written: {}", name, e);
                report.failed.push((dir.join(name), e.to_string()));
            }
        };

        outcome(
            METADATA_FILE,
            write_json_atomic(dir, METADATA_FILE, &self.session_metadata(info)),
        );
        for kind in TelemetryKind::ALL {
            let entries = self.entries.get(&kind).unwrap_or(&empty);
            outcome(kind.file_name(), write_json_atomic(dir, kind.file_name(), entries));
        }

        tracing::info!(
            "Metadata written: {} documents, {} failed",
            report.written.len(),
            report.failed.len()
        );
        report
    }
}

/// `[a,b,c]` with every value in round-trip float notation.
pub fn bracketed<T: std::fmt::Debug>(values: &[T]) -> String {
    let mut out = String::from("[");
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{:?}", v);
    }
    out.push(']');
    out
}

/// `exif_<Name>` entries for the fixed list of global EXIF keys that are present.
pub fn exif_summary(exif: &ExifMap) -> BTreeMap<String, String> {
    GLOBAL_EXIF_KEYS
        .iter()
        .filter_map(|&key| {
            let value = exif.get(key)?;
            let text = match (key, value) {
                ("ISOSpeedRatings", ExifValue::List(values)) => values.first()?.to_string(),
                _ => value.to_string(),
            };
            Some((format!("exif_{}", key), text))
        })
        .collect()
}

fn write_json_atomic<T: Serialize + ?Sized>(
    dir: &Path,
    name: &str,
    value: &T,
) -> Result<PathBuf, MetadataError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| MetadataError::Serialize {
        name: name.to_string(),
        source,
    })?;
    let path = dir.join(name);
    let tmp = dir.join(format!(".{}.tmp", name));
    let io_err = |source| MetadataError::Io {
        path: path.clone(),
        source,
    };

    let mut file = File::create(&tmp).map_err(io_err)?;
    file.write_all(&bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    fs::rename(&tmp, &path).map_err(io_err)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Mat4;
    use crate::test_support::{frame, small_resolution};

    fn info() -> SessionInfo {
        let res = small_resolution();
        SessionInfo {
            scene_name: "kitchen".into(),
            scene_type: "indoor".into(),
            color: res.color,
            depth: res.depth,
            fps: 30,
            depth_scale: 0.001,
            depth_compressed: true,
            start_time: Local::now(),
        }
    }

    fn read_doc(dir: &Path, name: &str) -> BTreeMap<String, String> {
        serde_json::from_slice(&std::fs::read(dir.join(name)).unwrap()).unwrap()
    }

    #[test]
    fn test_bracketed_floats() {
        assert_eq!(bracketed(&[1.0f32, 0.5, -2.0]), "[1.0,0.5,-2.0]");
        assert_eq!(bracketed::<f64>(&[]), "[]");
    }

    #[test]
    fn test_record_keys_by_frame_index() {
        let mut agg = MetadataAggregator::new();
        let motion = MotionSample {
            timestamp: 9.5,
            ..Default::default()
        };
        for i in 0..3 {
            let mut f = frame(i, 100.0 + i as f64, true);
            f.pose = Mat4::from_translation(i as f32, 0.0, 0.0);
            agg.record(i, &f, if i == 1 { None } else { Some(&motion) });
        }

        let poses = agg.entries(TelemetryKind::Pose).unwrap();
        assert_eq!(poses.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(poses[&2].ends_with("2.0,0.0,0.0,1.0]"));
        assert_eq!(agg.entries(TelemetryKind::Timestamp).unwrap()[&1], "101.0");
        assert_eq!(agg.len(TelemetryKind::Imu), 2);
        assert!(!agg.entries(TelemetryKind::Imu).unwrap().contains_key(&1));
        assert_eq!(agg.len(TelemetryKind::ExifShutterSpeed), 3);
        assert_eq!(agg.frame_count(), 3);
    }

    #[test]
    fn test_out_of_order_index_is_ignored_in_release() {
        let mut agg = MetadataAggregator::new();
        agg.record(5, &frame(0, 0.0, true), None);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            agg.record(5, &frame(1, 1.0, true), None);
        }));
        // debug builds assert, release builds skip
        assert!(result.is_err() || agg.frame_count() == 1);
    }

    #[test]
    fn test_flush_writes_every_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = MetadataAggregator::new();
        for i in 0..4 {
            agg.record(i, &frame(i, i as f64 / 30.0, true), None);
        }

        let report = agg.flush(dir.path(), &info());
        assert!(report.is_complete());
        assert_eq!(report.written.len(), 1 + TelemetryKind::ALL.len());

        let trans = read_doc(dir.path(), "trans.json");
        assert_eq!(trans.len(), 4);
        let pose: Vec<f32> = serde_json::from_str(&trans["3"]).unwrap();
        assert_eq!(pose.len(), 16);

        // No motion source: the document exists and is empty.
        assert!(read_doc(dir.path(), "imu.json").is_empty());

        let meta: SessionMetadata =
            serde_json::from_slice(&std::fs::read(dir.path().join(METADATA_FILE)).unwrap())
                .unwrap();
        assert_eq!(meta.scene_name, "kitchen");
        assert_eq!(meta.frame_count, 4);
        assert_eq!(meta.fps, 30);
        assert_eq!(meta.color_width, 16);
        assert_eq!(meta.matrix_layout, "column-major");
        let k: Vec<f32> = serde_json::from_str(meta.intrinsic.as_deref().unwrap()).unwrap();
        assert_eq!(k.len(), 9);
        assert_eq!(meta.exif["exif_ISOSpeedRatings"], "100");
        assert_eq!(meta.exif["exif_LensSpecification"], "1.5,6,1.8,2.4");
        assert!(!meta.exif.contains_key("exif_LensModel"));
    }

    #[test]
    fn test_flush_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let report = MetadataAggregator::new().flush(&missing, &info());
        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 1 + TelemetryKind::ALL.len());
    }
}
