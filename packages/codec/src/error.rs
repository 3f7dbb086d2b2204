//! Error types for video encoding.

use thiserror::Error;

/// Errors that can occur while configuring or running an encoder.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Invalid parameter passed to the encoder.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// Encoder has not been initialized (or was already flushed).
    #[error("encoder not initialized")]
    EncoderNotInitialized,

    /// Unsupported codec for this backend.
    #[error("unsupported codec: {0:?}")]
    UnsupportedCodec(crate::Codec),

    /// Invalid frame dimensions.
    #[error("invalid frame dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Frame conversion error.
    #[error("frame conversion error: {0}")]
    ConversionError(String),

    /// Error reported by the encoder backend library.
    #[error("encoder backend error: {0}")]
    Backend(String),
}

impl CodecError {
    /// Create an InvalidParam error with a message.
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    /// Create a Backend error with a message.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}
