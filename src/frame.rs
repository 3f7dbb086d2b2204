//! Sensor frame types delivered by the capture session.
//!
//! A [`FrameSample`] carries everything one camera tick produces: the color
//! image, primary and smoothed depth, confidence maps, intrinsics, pose and
//! exposure metadata. Pixel planes are reference-counted so the same sample
//! can be published to the live preview slot and handed to the recorder
//! without copying.

use bytes::Bytes;
use scenerec_codec::VideoFrame;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels.
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 3×3 float matrix stored as columns, matching the capture session's layout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mat3(pub [[f32; 3]; 3]);

impl Mat3 {
    pub const IDENTITY: Mat3 = Mat3([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);

    /// Pinhole intrinsics `[fx 0 cx; 0 fy cy; 0 0 1]`.
    pub fn intrinsics(fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
        Mat3([[fx, 0.0, 0.0], [0.0, fy, 0.0], [cx, cy, 1.0]])
    }

    /// Element at `row`, `col`.
    pub fn at(&self, row: usize, col: usize) -> f32 {
        self.0[col][row]
    }

    /// Column-major flattening (column 0 first).
    pub fn to_cols_array(&self) -> [f32; 9] {
        let mut out = [0.0; 9];
        for (c, column) in self.0.iter().enumerate() {
            out[c * 3..c * 3 + 3].copy_from_slice(column);
        }
        out
    }

    pub fn from_cols_array(values: &[f32; 9]) -> Self {
        let mut cols = [[0.0; 3]; 3];
        for (c, column) in cols.iter_mut().enumerate() {
            column.copy_from_slice(&values[c * 3..c * 3 + 3]);
        }
        Mat3(cols)
    }
}

impl Default for Mat3 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// 4×4 float transform stored as columns (camera-to-world pose).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mat4(pub [[f32; 4]; 4]);

impl Mat4 {
    pub const IDENTITY: Mat4 = Mat4([
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]);

    /// Pure translation.
    pub fn from_translation(x: f32, y: f32, z: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.0[3] = [x, y, z, 1.0];
        m
    }

    /// Element at `row`, `col`.
    pub fn at(&self, row: usize, col: usize) -> f32 {
        self.0[col][row]
    }

    pub fn translation(&self) -> [f32; 3] {
        [self.0[3][0], self.0[3][1], self.0[3][2]]
    }

    /// Column-major flattening (column 0 first).
    pub fn to_cols_array(&self) -> [f32; 16] {
        let mut out = [0.0; 16];
        for (c, column) in self.0.iter().enumerate() {
            out[c * 4..c * 4 + 4].copy_from_slice(column);
        }
        out
    }

    pub fn from_cols_array(values: &[f32; 16]) -> Self {
        let mut cols = [[0.0; 4]; 4];
        for (c, column) in cols.iter_mut().enumerate() {
            column.copy_from_slice(&values[c * 4..c * 4 + 4]);
        }
        Mat4(cols)
    }
}

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Biplanar YCbCr 4:2:0 color image (full-range luma plane + interleaved CbCr plane).
#[derive(Debug, Clone)]
pub struct ColorImage {
    pub resolution: Resolution,
    /// Y plane, `width * height` bytes, no row padding.
    pub luma: Bytes,
    /// Interleaved CbCr plane, `width * height / 2` bytes.
    pub chroma: Bytes,
}

impl ColorImage {
    pub fn new(resolution: Resolution, luma: Bytes, chroma: Bytes) -> Self {
        Self {
            resolution,
            luma,
            chroma,
        }
    }

    /// True when both planes have the size the resolution implies.
    pub fn is_well_formed(&self) -> bool {
        let pixels = self.resolution.pixels();
        self.luma.len() == pixels && self.chroma.len() == pixels / 2
    }

    /// Copy the planes into an encoder input frame.
    pub fn to_video_frame(&self, timestamp_us: u64) -> VideoFrame {
        VideoFrame::from_nv12_planes(
            self.resolution.width,
            self.resolution.height,
            &self.luma,
            &self.chroma,
            timestamp_us,
        )
    }
}

/// Depth map in meters, row-major.
#[derive(Debug, Clone)]
pub struct DepthMap {
    pub resolution: Resolution,
    pub values: Arc<[f32]>,
}

impl DepthMap {
    pub fn new(resolution: Resolution, values: Vec<f32>) -> Self {
        Self {
            resolution,
            values: values.into(),
        }
    }

    /// Depth at pixel `(x, y)`, if inside the map.
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.resolution.width || y >= self.resolution.height {
            return None;
        }
        self.values
            .get(y as usize * self.resolution.width as usize + x as usize)
            .copied()
    }
}

/// Per-pixel depth confidence (0 = low, 1 = medium, 2 = high).
#[derive(Debug, Clone)]
pub struct ConfidenceMap {
    pub resolution: Resolution,
    pub values: Bytes,
}

/// One EXIF field value as reported by the camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExifValue {
    Number(f64),
    Text(String),
    List(Vec<f64>),
}

impl fmt::Display for ExifValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExifValue::Number(n) => write!(f, "{}", n),
            ExifValue::Text(s) => f.write_str(s),
            ExifValue::List(values) => {
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", v)?;
                }
                Ok(())
            }
        }
    }
}

pub type ExifMap = BTreeMap<String, ExifValue>;

/// Everything the capture session produced for one tick.
#[derive(Debug, Clone)]
pub struct FrameSample {
    pub color: ColorImage,
    pub depth: Option<DepthMap>,
    pub smoothed_depth: Option<DepthMap>,
    pub confidence: Option<ConfidenceMap>,
    pub smoothed_confidence: Option<ConfidenceMap>,
    pub intrinsics: Mat3,
    /// Color camera resolution the intrinsics refer to.
    pub resolution: Resolution,
    /// Camera-to-world transform.
    pub pose: Mat4,
    /// Monotonic session-relative time in seconds.
    pub timestamp: f64,
    /// Exposure duration in seconds.
    pub exposure_duration: f64,
    pub exposure_offset: f32,
    pub exif: ExifMap,
}

impl FrameSample {
    /// Only frames with both primary and smoothed depth are recorded.
    pub fn is_qualifying(&self) -> bool {
        self.depth.is_some() && self.smoothed_depth.is_some()
    }

    pub fn depth_resolution(&self) -> Option<Resolution> {
        self.depth.as_ref().map(|d| d.resolution)
    }

    /// Frame timestamp in whole microseconds.
    pub fn timestamp_us(&self) -> u64 {
        (self.timestamp.max(0.0) * 1_000_000.0) as u64
    }
}

/// Single-writer slot holding the most recent frame for live preview.
///
/// The recorder service is the only writer; any number of readers can
/// subscribe and always observe the latest published sample.
#[derive(Debug)]
pub struct LatestFrame {
    tx: watch::Sender<Option<Arc<FrameSample>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn publish(&self, frame: Arc<FrameSample>) {
        self.tx.send_replace(Some(frame));
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<FrameSample>>> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<FrameSample>> {
        self.tx.borrow().clone()
    }
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_flattening_is_column_major() {
        let k = Mat3::intrinsics(500.0, 510.0, 320.0, 240.0);
        let flat = k.to_cols_array();
        assert_eq!(flat, [500.0, 0.0, 0.0, 0.0, 510.0, 0.0, 320.0, 240.0, 1.0]);
        assert_eq!(k.at(0, 2), 320.0);
        assert_eq!(Mat3::from_cols_array(&flat), k);

        let pose = Mat4::from_translation(1.0, 2.0, 3.0);
        assert_eq!(&pose.to_cols_array()[12..], &[1.0, 2.0, 3.0, 1.0]);
        assert_eq!(pose.at(1, 3), 2.0);
        assert_eq!(pose.translation(), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_exif_display() {
        assert_eq!(ExifValue::Number(2.5).to_string(), "2.5");
        assert_eq!(ExifValue::Text("Apple".into()).to_string(), "Apple");
        assert_eq!(
            ExifValue::List(vec![1.5, 2.0, 2.8, 4.0]).to_string(),
            "1.5,2,2.8,4"
        );
    }

    #[test]
    fn test_depth_map_get() {
        let map = DepthMap::new(Resolution::new(2, 2), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(map.get(1, 1), Some(4.0));
        assert_eq!(map.get(2, 0), None);
    }

    #[test]
    fn test_color_image_shape() {
        let res = Resolution::new(4, 2);
        let good = ColorImage::new(res, Bytes::from(vec![0u8; 8]), Bytes::from(vec![0u8; 4]));
        assert!(good.is_well_formed());
        let frame = good.to_video_frame(0);
        assert_eq!((frame.luma.len(), frame.chroma.len()), (8, 4));
        assert!(frame.validate().is_ok());

        let bad = ColorImage::new(res, Bytes::from(vec![0u8; 8]), Bytes::new());
        assert!(!bad.is_well_formed());
    }

    #[test]
    fn test_latest_frame_slot() {
        let slot = LatestFrame::new();
        let rx = slot.subscribe();
        assert!(slot.latest().is_none());

        let frame = Arc::new(crate::test_support::frame(0, 0.5, true));
        slot.publish(frame.clone());
        assert_eq!(slot.latest().map(|f| f.timestamp), Some(0.5));
        assert!(rx.has_changed().unwrap());
    }
}
