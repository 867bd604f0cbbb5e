//! Screen capture abstraction
//!
//! A capture source yields raw frames at its own cadence; a provider knows how
//! to obtain one through a particular grant path.

use super::frame::{Frame, FrameStats};
use super::CaptureError;
use std::fmt;

/// How a capture source was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantPath {
    /// Granted by the system (privileged display access)
    System,
    /// Granted through a user permission flow
    Permission,
}

impl fmt::Display for GrantPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrantPath::System => write!(f, "system"),
            GrantPath::Permission => write!(f, "permission"),
        }
    }
}

/// Requested capture surface geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub width: u32,
    pub height: u32,
    pub density: u32,
}

/// Trait for screen capture implementations
pub trait CaptureSource: Send {
    /// Block until the next sample is available and return it
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Output size of produced frames
    fn dimensions(&self) -> (u32, u32);

    /// Get capture statistics
    fn stats(&self) -> FrameStats;
}

/// Supplies capture sources through one grant path
pub trait CaptureProvider: Send + Sync {
    fn name(&self) -> &str;

    fn grant(&self) -> GrantPath;

    /// Open a source. Must not leave anything acquired when it fails.
    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureSource>, CaptureError>;
}

/// Nearest-neighbour resample of packed RGB24
pub fn resample_rgb(src: &[u8], src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Vec<u8> {
    if src_w == dst_w && src_h == dst_h {
        return src.to_vec();
    }
    let mut dst = Vec::with_capacity((dst_w * dst_h * 3) as usize);
    for y in 0..dst_h {
        let sy = (y as u64 * src_h as u64 / dst_h.max(1) as u64) as usize;
        let row = sy * src_w as usize * 3;
        for x in 0..dst_w {
            let sx = (x as u64 * src_w as u64 / dst_w.max(1) as u64) as usize;
            let offset = row + sx * 3;
            match src.get(offset..offset + 3) {
                Some(px) => dst.extend_from_slice(px),
                None => dst.extend_from_slice(&[0, 0, 0]),
            }
        }
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_identity_copies() {
        let src = vec![1, 2, 3, 4, 5, 6];
        assert_eq!(resample_rgb(&src, 2, 1, 2, 1), src);
    }

    #[test]
    fn resample_halves() {
        // 2x2 -> 1x1 picks the top-left pixel
        let src = vec![10, 11, 12, 20, 21, 22, 30, 31, 32, 40, 41, 42];
        assert_eq!(resample_rgb(&src, 2, 2, 1, 1), vec![10, 11, 12]);
    }

    #[test]
    fn resample_pads_short_input() {
        let out = resample_rgb(&[1, 2, 3], 2, 2, 2, 2);
        assert_eq!(out.len(), 12);
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert_eq!(&out[3..], &[0; 9]);
    }
}
