//! Float depth to 16-bit fixed point conversion.
//!
//! Depth maps arrive as 32-bit floats in meters. On disk they are stored as
//! unsigned 16-bit integers, `round(depth / scale)`, saturated to the u16
//! range. The default scale of 1 mm per unit covers about 65.5 m.

use crate::frame::{DepthMap, Resolution};

/// Default meters per stored unit.
pub const DEFAULT_DEPTH_SCALE: f32 = 0.001;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DepthError {
    #[error("depth map is {actual} ({samples} samples), converter expects {expected}")]
    DimensionMismatch {
        expected: Resolution,
        actual: Resolution,
        samples: usize,
    },
    #[error("depth scale must be finite and positive, got {0}")]
    InvalidScale(f32),
}

/// Converts depth maps of one fixed resolution, reusing its output buffers.
pub struct DepthConverter {
    resolution: Resolution,
    scale: f32,
    units: Vec<u16>,
    le_bytes: Vec<u8>,
}

impl DepthConverter {
    pub fn new(resolution: Resolution, scale: f32) -> Result<Self, DepthError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(DepthError::InvalidScale(scale));
        }
        let pixels = resolution.pixels();
        Ok(Self {
            resolution,
            scale,
            units: vec![0; pixels],
            le_bytes: vec![0; pixels * 2],
        })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Size in bytes of one converted frame.
    pub fn frame_len(&self) -> usize {
        self.le_bytes.len()
    }

    /// Convert a depth map into the internal u16 buffer.
    pub fn convert(&mut self, depth: &DepthMap) -> Result<&[u16], DepthError> {
        if depth.resolution != self.resolution || depth.values.len() != self.units.len() {
            return Err(DepthError::DimensionMismatch {
                expected: self.resolution,
                actual: depth.resolution,
                samples: depth.values.len(),
            });
        }

        for (out, &meters) in self.units.iter_mut().zip(depth.values.iter()) {
            *out = quantize(meters, self.scale);
        }
        Ok(&self.units)
    }

    /// Convert a depth map to its little-endian on-disk byte image.
    pub fn convert_le_bytes(&mut self, depth: &DepthMap) -> Result<&[u8], DepthError> {
        self.convert(depth)?;
        for (chunk, unit) in self.le_bytes.chunks_exact_mut(2).zip(self.units.iter()) {
            chunk.copy_from_slice(&unit.to_le_bytes());
        }
        Ok(&self.le_bytes)
    }

    /// Reverse scaling of a stored value back to meters.
    pub fn to_meters(&self, raw: u16) -> f32 {
        raw_to_meters(raw, self.scale)
    }
}

pub fn raw_to_meters(raw: u16, scale: f32) -> f32 {
    raw as f32 * scale
}

fn quantize(meters: f32, scale: f32) -> u16 {
    if meters.is_nan() {
        return 0;
    }
    // `as` saturates, so +inf maps to u16::MAX and negatives to 0.
    (meters / scale).round() as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(values: Vec<f32>) -> DepthMap {
        DepthMap::new(Resolution::new(values.len() as u32, 1), values)
    }

    #[test]
    fn test_round_trip_within_one_quantum() {
        let values = vec![0.0, 0.25, 1.2345, 3.9999, 12.0, 65.0];
        let mut conv = DepthConverter::new(Resolution::new(6, 1), DEFAULT_DEPTH_SCALE).unwrap();
        let raw = conv.convert(&map(values.clone())).unwrap().to_vec();
        for (v, r) in values.iter().zip(raw) {
            assert!((conv.to_meters(r) - v).abs() <= DEFAULT_DEPTH_SCALE);
        }
    }

    #[test]
    fn test_clamping() {
        let mut conv = DepthConverter::new(Resolution::new(5, 1), DEFAULT_DEPTH_SCALE).unwrap();
        let raw = conv
            .convert(&map(vec![-5.0, 1e9, f32::NAN, f32::INFINITY, f32::NEG_INFINITY]))
            .unwrap();
        assert_eq!(raw, &[0, 65535, 0, 65535, 0]);
    }

    #[test]
    fn test_le_bytes() {
        let mut conv = DepthConverter::new(Resolution::new(2, 1), 0.001).unwrap();
        let bytes = conv.convert_le_bytes(&map(vec![1.0, 0.258])).unwrap();
        assert_eq!(bytes, &[0xe8, 0x03, 0x02, 0x01]);
        assert_eq!(conv.frame_len(), 4);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut conv = DepthConverter::new(Resolution::new(4, 1), 0.001).unwrap();
        let err = conv.convert(&map(vec![1.0, 2.0])).unwrap_err();
        assert!(matches!(err, DepthError::DimensionMismatch { samples: 2, .. }));

        // Right resolution, short buffer.
        let short = DepthMap::new(Resolution::new(4, 1), vec![1.0; 3]);
        assert!(conv.convert(&short).is_err());
    }

    #[test]
    fn test_invalid_scale() {
        let res = Resolution::new(1, 1);
        assert!(DepthConverter::new(res, 0.0).is_err());
        assert!(DepthConverter::new(res, -1.0).is_err());
        assert!(DepthConverter::new(res, f32::NAN).is_err());
    }
}
