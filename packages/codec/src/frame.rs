//! Encoder input frames.

use crate::CodecError;

/// Luma and chroma plane sizes of a biplanar 4:2:0 image.
#[must_use]
pub fn nv12_plane_sizes(width: u32, height: u32) -> (usize, usize) {
    let luma = width as usize * height as usize;
    (luma, luma / 2)
}

/// One biplanar YCbCr 4:2:0 image as delivered by the capture session:
/// a full-resolution luma plane and a half-resolution interleaved CbCr plane,
/// both without row padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub luma: Vec<u8>,
    /// Cb and Cr samples alternating.
    pub chroma: Vec<u8>,
    pub timestamp_us: u64,
}

impl VideoFrame {
    #[must_use]
    pub fn from_nv12_planes(
        width: u32,
        height: u32,
        luma: &[u8],
        chroma: &[u8],
        timestamp_us: u64,
    ) -> Self {
        Self {
            width,
            height,
            luma: luma.to_vec(),
            chroma: chroma.to_vec(),
            timestamp_us,
        }
    }

    /// Planes must match the dimensions, which must be even.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(CodecError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        let (luma, chroma) = nv12_plane_sizes(self.width, self.height);
        if self.luma.len() != luma || self.chroma.len() != chroma {
            return Err(CodecError::ConversionError(format!(
                "{}x{} frame needs {}+{} plane bytes, got {}+{}",
                self.width,
                self.height,
                luma,
                chroma,
                self.luma.len(),
                self.chroma.len()
            )));
        }
        Ok(())
    }

    /// Split the interleaved chroma into separate Cb and Cr planes, the
    /// three-plane layout software encoders take.
    pub fn split_chroma(&self) -> Result<(Vec<u8>, Vec<u8>), CodecError> {
        self.validate()?;
        let quarter = self.chroma.len() / 2;
        let mut cb = Vec::with_capacity(quarter);
        let mut cr = Vec::with_capacity(quarter);
        for pair in self.chroma.chunks_exact(2) {
            cb.push(pair[0]);
            cr.push(pair[1]);
        }
        Ok((cb, cr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chroma() {
        // 4x2: 8 luma bytes, 2 CbCr pairs
        let luma: Vec<u8> = (0..8).collect();
        let frame = VideoFrame::from_nv12_planes(4, 2, &luma, &[100, 200, 101, 201], 0);
        let (cb, cr) = frame.split_chroma().unwrap();
        assert_eq!(cb, vec![100, 101]);
        assert_eq!(cr, vec![200, 201]);
    }

    #[test]
    fn test_plane_size_mismatch() {
        let frame = VideoFrame::from_nv12_planes(4, 2, &[0; 8], &[0; 3], 0);
        assert!(matches!(
            frame.split_chroma(),
            Err(CodecError::ConversionError(_))
        ));
        let odd = VideoFrame::from_nv12_planes(3, 2, &[0; 6], &[0; 3], 0);
        assert!(matches!(
            odd.validate(),
            Err(CodecError::InvalidDimensions { width: 3, .. })
        ));
    }
}
