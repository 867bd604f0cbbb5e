//! Binary wire format for the framed fallback transport
//!
//! Every media packet on the control channel is `[type:1][flags:1][payload...]`.

use crate::encode::{EncodedFrame, FrameKind, PayloadFormat};
use std::error::Error;
use std::fmt;

/// MJPEG still image
pub const TYPE_IMAGE: u8 = 0x01;
/// H.264 access unit (key or delta)
pub const TYPE_VIDEO: u8 = 0x02;
/// H.264 parameter sets (SPS/PPS)
pub const TYPE_PARAMETER_SET: u8 = 0x03;

/// Flags bit 0: payload is a keyframe
pub const FLAG_KEYFRAME: u8 = 0x01;

const HEADER_LEN: usize = 2;

/// Decoded frame classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    Image,
    Video { keyframe: bool },
    ParameterSet,
    /// Unknown type byte, kept for forward compatibility
    Opaque(u8),
}

impl WireKind {
    pub fn type_byte(&self) -> u8 {
        match self {
            WireKind::Image => TYPE_IMAGE,
            WireKind::Video { .. } => TYPE_VIDEO,
            WireKind::ParameterSet => TYPE_PARAMETER_SET,
            WireKind::Opaque(t) => *t,
        }
    }

    pub fn flags(&self) -> u8 {
        match self {
            WireKind::Video { keyframe: true } => FLAG_KEYFRAME,
            _ => 0,
        }
    }

    fn from_header(frame_type: u8, flags: u8) -> Self {
        match frame_type {
            TYPE_IMAGE => WireKind::Image,
            TYPE_VIDEO => WireKind::Video {
                keyframe: flags & FLAG_KEYFRAME != 0,
            },
            TYPE_PARAMETER_SET => WireKind::ParameterSet,
            other => WireKind::Opaque(other),
        }
    }
}

impl From<&EncodedFrame> for WireKind {
    fn from(frame: &EncodedFrame) -> Self {
        match (frame.format, frame.kind) {
            (PayloadFormat::Jpeg, _) => WireKind::Image,
            (PayloadFormat::H264, FrameKind::Config) => WireKind::ParameterSet,
            (PayloadFormat::H264, FrameKind::Key) => WireKind::Video { keyframe: true },
            (PayloadFormat::H264, FrameKind::Delta) => WireKind::Video { keyframe: false },
        }
    }
}

impl fmt::Display for WireKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireKind::Image => write!(f, "Image"),
            WireKind::Video { keyframe: true } => write!(f, "Video(key)"),
            WireKind::Video { keyframe: false } => write!(f, "Video(delta)"),
            WireKind::ParameterSet => write!(f, "ParameterSet"),
            WireKind::Opaque(t) => write!(f, "Opaque(0x{:02x})", t),
        }
    }
}

/// A frame as it crosses the framed transport boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub frame_type: u8,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl WireFrame {
    pub fn kind(&self) -> WireKind {
        WireKind::from_header(self.frame_type, self.flags)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer too short to hold the header
    Malformed(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Malformed(len) => {
                write!(f, "Malformed wire frame: {} bytes, header needs {}", len, HEADER_LEN)
            }
        }
    }
}

impl Error for CodecError {}

/// Frame protocol codec
pub struct FrameProtocolCodec;

impl FrameProtocolCodec {
    /// Pack a payload behind the two-byte header
    pub fn pack(kind: WireKind, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(kind.type_byte());
        out.push(kind.flags());
        out.extend_from_slice(payload);
        out
    }

    /// Pack an encoded frame as produced by the capture engine
    pub fn pack_frame(frame: &EncodedFrame) -> Vec<u8> {
        Self::pack(WireKind::from(frame), &frame.payload)
    }

    /// Split a packet into its kind and payload slice
    pub fn unpack(data: &[u8]) -> Result<(WireKind, &[u8]), CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::Malformed(data.len()));
        }
        let kind = WireKind::from_header(data[0], data[1]);
        Ok((kind, &data[HEADER_LEN..]))
    }

    /// Owned variant of [`FrameProtocolCodec::unpack`]
    pub fn decode(data: &[u8]) -> Result<WireFrame, CodecError> {
        let (_, payload) = Self::unpack(data)?;
        Ok(WireFrame {
            frame_type: data[0],
            flags: data[1],
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Instant;

    #[test]
    fn round_trip_preserves_kind_and_payload() {
        let large: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        let kinds = [
            WireKind::Image,
            WireKind::Video { keyframe: true },
            WireKind::Video { keyframe: false },
            WireKind::ParameterSet,
        ];
        for kind in kinds {
            for payload in [&[][..], &[0xAB][..], &large[..]] {
                let packed = FrameProtocolCodec::pack(kind, payload);
                let (decoded, body) = FrameProtocolCodec::unpack(&packed).expect("unpack");
                assert_eq!(decoded, kind);
                assert_eq!(body, payload);
            }
        }
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert_eq!(FrameProtocolCodec::unpack(&[]), Err(CodecError::Malformed(0)));
        assert_eq!(FrameProtocolCodec::unpack(&[0x01]), Err(CodecError::Malformed(1)));
    }

    #[test]
    fn unknown_type_passes_through() {
        let (kind, body) = FrameProtocolCodec::unpack(&[0x7f, 0x01, 9, 9]).expect("unpack");
        assert_eq!(kind, WireKind::Opaque(0x7f));
        assert_eq!(body, &[9, 9]);
    }

    #[test]
    fn keyframe_flag_only_applies_to_video() {
        let packed = FrameProtocolCodec::pack(WireKind::Image, b"jpeg");
        assert_eq!(&packed[..2], &[TYPE_IMAGE, 0]);

        let (kind, _) = FrameProtocolCodec::unpack(&[TYPE_IMAGE, FLAG_KEYFRAME]).expect("unpack");
        assert_eq!(kind, WireKind::Image);
    }

    #[test]
    fn encoded_frames_map_to_wire_types() {
        let frame = |format, kind| EncodedFrame {
            kind,
            format,
            payload: Bytes::from_static(b"x"),
            timestamp: Instant::now(),
        };
        let config = FrameProtocolCodec::pack_frame(&frame(PayloadFormat::H264, FrameKind::Config));
        let key = FrameProtocolCodec::pack_frame(&frame(PayloadFormat::H264, FrameKind::Key));
        let delta = FrameProtocolCodec::pack_frame(&frame(PayloadFormat::H264, FrameKind::Delta));
        let jpeg = FrameProtocolCodec::pack_frame(&frame(PayloadFormat::Jpeg, FrameKind::Key));
        assert_eq!(&config[..2], &[TYPE_PARAMETER_SET, 0]);
        assert_eq!(&key[..2], &[TYPE_VIDEO, FLAG_KEYFRAME]);
        assert_eq!(&delta[..2], &[TYPE_VIDEO, 0]);
        assert_eq!(&jpeg[..2], &[TYPE_IMAGE, 0]);
    }

    #[test]
    fn decode_returns_owned_frame() {
        let frame = FrameProtocolCodec::decode(&[TYPE_VIDEO, FLAG_KEYFRAME, 1, 2]).expect("decode");
        assert_eq!(frame.kind(), WireKind::Video { keyframe: true });
        assert_eq!(frame.payload, vec![1, 2]);
    }
}
