//! Captured frame data structure
//!
//! Represents a raw screen sample with metadata.

use std::fmt;

/// A raw RGB24 sample from a capture source
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Raw pixel data (packed RGB, no row padding)
    pub data: Vec<u8>,

    /// Capture timestamp
    pub timestamp: std::time::Instant,

    /// Frame sequence number
    pub sequence: u64,
}

impl Frame {
    /// Expected buffer length for the frame geometry
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() >= self.expected_len()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame({}x{}, {} bytes, seq={})",
            self.width,
            self.height,
            self.data.len(),
            self.sequence
        )
    }
}

/// Capture statistics for monitoring
#[derive(Debug, Default, Clone)]
pub struct FrameStats {
    pub total_frames: u64,
    pub total_bytes: u64,
    pub total_capture_time_us: u64,
    pub last_capture_time_us: u64,
}

impl FrameStats {
    /// Record a frame capture
    pub fn record_capture(&mut self, bytes: usize, time_us: u64) {
        self.total_frames += 1;
        self.total_bytes += bytes as u64;
        self.last_capture_time_us = time_us;
        self.total_capture_time_us += time_us;
    }

    pub fn average_capture_time_us(&self) -> u64 {
        if self.total_frames == 0 {
            0
        } else {
            self.total_capture_time_us / self.total_frames
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn completeness_checks_geometry() {
        let mut frame = Frame {
            width: 4,
            height: 2,
            data: vec![0; 24],
            timestamp: Instant::now(),
            sequence: 0,
        };
        assert!(frame.is_complete());
        frame.data.truncate(20);
        assert!(!frame.is_complete());
    }

    #[test]
    fn stats_average() {
        let mut stats = FrameStats::default();
        assert_eq!(stats.average_capture_time_us(), 0);
        stats.record_capture(100, 10);
        stats.record_capture(100, 30);
        assert_eq!(stats.total_bytes, 200);
        assert_eq!(stats.average_capture_time_us(), 20);
    }
}
