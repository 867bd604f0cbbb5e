//! JPEG encoding for the software path
//!
//! Each captured frame becomes a self-contained still.

use super::{EncodeError, EncodedFrame, FrameKind, PayloadFormat};
use crate::capture::Frame;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ColorType;

/// JPEG encoder with a live-adjustable quality
pub struct JpegEncoder {
    quality: u8,
    /// Reused output buffer
    buffer: Vec<u8>,
}

impl JpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            buffer: Vec::new(),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn set_quality(&mut self, quality: u8) {
        self.quality = quality.clamp(1, 100);
    }

    /// Encode a frame as a JPEG still
    pub fn encode(&mut self, frame: &Frame) -> Result<EncodedFrame, EncodeError> {
        if !frame.is_complete() {
            return Err(EncodeError::Failed(format!(
                "short frame buffer: {} of {} bytes",
                frame.data.len(),
                frame.expected_len()
            )));
        }

        self.buffer.clear();
        {
            let mut encoder = ImageJpegEncoder::new_with_quality(&mut self.buffer, self.quality);
            encoder
                .encode(
                    &frame.data[..frame.expected_len()],
                    frame.width,
                    frame.height,
                    ColorType::Rgb8,
                )
                .map_err(|e| EncodeError::Failed(format!("JPEG encode failed: {}", e)))?;
        }

        Ok(EncodedFrame {
            kind: FrameKind::Key,
            format: PayloadFormat::Jpeg,
            payload: Bytes::copy_from_slice(&self.buffer),
            timestamp: frame.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn frame(width: u32, height: u32) -> Frame {
        let data = (0..width * height * 3).map(|i| (i % 255) as u8).collect();
        Frame {
            width,
            height,
            data,
            timestamp: Instant::now(),
            sequence: 0,
        }
    }

    #[test]
    fn produces_jpeg_markers() {
        let mut encoder = JpegEncoder::new(80);
        let out = encoder.encode(&frame(32, 16)).expect("encode");
        assert_eq!(out.format, PayloadFormat::Jpeg);
        assert_eq!(out.kind, FrameKind::Key);
        assert_eq!(&out.payload[..2], &[0xFF, 0xD8]);
        assert_eq!(&out.payload[out.payload.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn lower_quality_is_smaller() {
        let input = frame(128, 128);
        let mut encoder = JpegEncoder::new(95);
        let high = encoder.encode(&input).expect("encode").payload.len();
        encoder.set_quality(10);
        let low = encoder.encode(&input).expect("encode").payload.len();
        assert!(low < high);
    }

    #[test]
    fn rejects_short_buffers() {
        let mut input = frame(8, 8);
        input.data.truncate(10);
        assert!(JpegEncoder::new(50).encode(&input).is_err());
    }

    #[test]
    fn quality_is_clamped() {
        let mut encoder = JpegEncoder::new(0);
        assert_eq!(encoder.quality(), 1);
        encoder.set_quality(200);
        assert_eq!(encoder.quality(), 100);
    }
}
