//! Synthetic test-pattern source
//!
//! Needs no display access; used for headless runs and tests.

use super::capturer::{CaptureProvider, CaptureRequest, CaptureSource, GrantPath};
use super::frame::{Frame, FrameStats};
use super::CaptureError;
use std::time::{Duration, Instant};

/// Moving gradient at a fixed cadence
pub struct SyntheticSource {
    width: u32,
    height: u32,
    interval: Duration,
    last: Option<Instant>,
    sequence: u64,
    stats: FrameStats,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, interval: Duration) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            interval,
            last: None,
            sequence: 0,
            stats: FrameStats::default(),
        }
    }

    fn render(&self) -> Vec<u8> {
        let shift = (self.sequence % 256) as u32;
        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push(((x + shift) % 256) as u8);
                data.push(((y + shift) % 256) as u8);
                data.push(((x ^ y) % 256) as u8);
            }
        }
        data
    }
}

impl CaptureSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        let start = Instant::now();
        let data = self.render();
        self.stats.record_capture(data.len(), start.elapsed().as_micros() as u64);
        self.last = Some(start);

        let frame = Frame {
            width: self.width,
            height: self.height,
            data,
            timestamp: start,
            sequence: self.sequence,
        };
        self.sequence += 1;
        Ok(frame)
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn stats(&self) -> FrameStats {
        self.stats.clone()
    }
}

/// Provider for [`SyntheticSource`]
pub struct SyntheticProvider {
    grant: GrantPath,
    interval: Duration,
}

impl SyntheticProvider {
    pub fn new(grant: GrantPath) -> Self {
        Self {
            grant,
            interval: Duration::from_millis(16),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl CaptureProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn grant(&self) -> GrantPath {
        self.grant
    }

    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureSource>, CaptureError> {
        if request.width == 0 || request.height == 0 {
            return Err(CaptureError::Unavailable(format!(
                "invalid surface {}x{}",
                request.width, request.height
            )));
        }
        Ok(Box::new(SyntheticSource::new(request.width, request.height, self.interval)))
    }
}
