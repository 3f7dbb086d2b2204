//! Video encoder abstraction for scenerec.
//!
//! The recorder muxes whatever H.264 Annex B bitstream a [`VideoEncoder`]
//! produces, so backends only have to turn raw frames into NAL units:
//!
//! - **OpenH264** (`openh264` feature): portable software encoder
//!
//! # Quick Start
//!
//! ```ignore
//! use scenerec_codec::{Codec, EncoderConfig, OpenH264Encoder, VideoEncoder, VideoFrame};
//!
//! let config = EncoderConfig::new(1920, 1440)
//!     .codec(Codec::H264)
//!     .framerate(60, 1);
//!
//! let mut encoder = OpenH264Encoder::new(config)?;
//!
//! // Frames from the capture session are biplanar YCbCr 4:2:0
//! let frame = VideoFrame::from_nv12_planes(1920, 1440, &luma, &chroma, timestamp_us);
//! let packet = encoder.encode(&frame, false)?;
//!
//! // packet.data contains Annex B H.264 NAL units ready for muxing
//! ```
//!
//! # Feature Flags
//!
//! - `openh264` - Enable the OpenH264 software encoder (compiles the C library)

mod error;
mod frame;
mod traits;
mod types;

pub use error::CodecError;
pub use frame::{nv12_plane_sizes, VideoFrame};
pub use traits::{EncodedPacket, VideoEncoder};
pub use types::{Codec, EncoderConfig};

#[cfg(feature = "openh264")]
mod openh264_backend;

#[cfg(feature = "openh264")]
pub use openh264_backend::OpenH264Encoder;
