//! Frame encoders
//!
//! Software path: JPEG stills via the `image` crate.
//! Hardware path: a stateful H.264 encoder emitting config/key/delta units.

pub mod jpeg;
pub mod nal;
#[cfg(feature = "gstreamer")]
pub mod h264;

pub use jpeg::JpegEncoder;
#[cfg(feature = "gstreamer")]
pub use h264::GstH264Encoder;

use crate::capture::Frame;
use bytes::Bytes;
use std::error::Error;
use std::fmt;
use std::time::Instant;

/// Encoded unit classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// One-time codec parameters (SPS/PPS)
    Config,
    /// Self-contained frame
    Key,
    /// Frame depending on earlier frames
    Delta,
}

/// Payload encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Jpeg,
    H264,
}

/// Output of the capture engine. Consumed by exactly one transport path.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub kind: FrameKind,
    pub format: PayloadFormat,
    pub payload: Bytes,
    pub timestamp: Instant,
}

impl EncodedFrame {
    pub fn is_keyframe(&self) -> bool {
        self.kind == FrameKind::Key
    }
}

impl fmt::Display for EncodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncodedFrame({:?}/{:?}, {} bytes)", self.format, self.kind, self.payload.len())
    }
}

/// Encoder-related errors
#[derive(Debug)]
pub enum EncodeError {
    /// No encoder of this kind is available on the host
    Unsupported(String),
    /// Codec-level failure
    Failed(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::Unsupported(msg) => write!(f, "Encoder unsupported: {}", msg),
            EncodeError::Failed(msg) => write!(f, "Encoder failure: {}", msg),
        }
    }
}

impl Error for EncodeError {}

/// Settings handed to a stateful video encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSettings {
    /// Frame size; capture already delivers frames at this size
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u32,
}

/// Stateful video encoder used on the hardware path.
///
/// `encode` may return zero or more units; parameter sets are reported as
/// [`FrameKind::Config`] ahead of the keyframe they belong to.
pub trait StreamEncoder: Send {
    fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Result<Vec<EncodedFrame>, EncodeError>;

    /// Applied live, without rebuilding the encoder
    fn set_bitrate(&mut self, bitrate: u32);

    fn settings(&self) -> VideoSettings;
}

/// Builds hardware encoders. Called again whenever the output size changes.
pub trait EncoderFactory: Send + Sync {
    /// Whether `create` can be expected to succeed on this host
    fn is_available(&self) -> bool {
        true
    }

    fn create(&self, settings: VideoSettings) -> Result<Box<dyn StreamEncoder>, EncodeError>;
}

/// Factory for hosts without a hardware encoder
pub struct NoHardwareEncoder;

impl EncoderFactory for NoHardwareEncoder {
    fn is_available(&self) -> bool {
        false
    }

    fn create(&self, _settings: VideoSettings) -> Result<Box<dyn StreamEncoder>, EncodeError> {
        Err(EncodeError::Unsupported("no H.264 encoder compiled in".to_string()))
    }
}

/// Default factory for this build
pub fn default_encoder_factory() -> std::sync::Arc<dyn EncoderFactory> {
    #[cfg(feature = "gstreamer")]
    {
        if h264::is_available() {
            return std::sync::Arc::new(h264::GstEncoderFactory);
        }
    }
    std::sync::Arc::new(NoHardwareEncoder)
}

/// H.264 output size for a source size and ladder scale.
///
/// Large sources are pre-scaled, then sizes are aligned down to 16.
pub fn h264_dimensions(width: u32, height: u32, level_scale: f32) -> (u32, u32) {
    let base_scale = if width > 1920 {
        0.5
    } else if width > 1080 {
        0.75
    } else {
        1.0
    };
    let scale = base_scale * level_scale;
    let align = |v: u32| (((v as f32 * scale) as u32) / 16 * 16).max(16);
    (align(width), align(height))
}

/// Scaled size for the software path, kept even for chroma subsampling
pub fn scaled_dimensions(width: u32, height: u32, scale: f32) -> (u32, u32) {
    let even = |v: u32| (((v as f32 * scale) as u32) & !1).max(2);
    (even(width), even(height))
}
